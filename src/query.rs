use anyhow::{anyhow, Result};
use std::cmp::Ordering;

use crate::models::{language_keyword, CompanyRecord, DateSort, SearchFilters};

pub const PAGE_SIZE: u32 = 20;

// --- Query model ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    CompanyName,
    BranchName,
    Address,
    BranchAddress,
    Language,
    SupportLegal,
    SupportOptional,
}

impl Field {
    pub fn column(self) -> &'static str {
        match self {
            Field::CompanyName => "company_name",
            Field::BranchName => "branch_name",
            Field::Address => "address",
            Field::BranchAddress => "branch_address",
            Field::Language => "language",
            Field::SupportLegal => "support_legal",
            Field::SupportOptional => "support_optional",
        }
    }

    fn value(self, record: &CompanyRecord) -> Option<&str> {
        match self {
            Field::CompanyName => Some(&record.company_name),
            Field::BranchName => record.branch_name(),
            Field::Address => Some(&record.address),
            Field::BranchAddress => record.branch_address(),
            Field::Language => record.language.as_deref(),
            Field::SupportLegal => Some(&record.support_legal),
            Field::SupportOptional => Some(&record.support_optional),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Case-insensitive substring match. A NULL column never matches.
    Contains(Field, String),
    /// Case-insensitive substring absence. A NULL column passes, unlike a bare
    /// `not.ilike` filter, which drops NULL rows.
    NotContains(Field, String),
    Equals(Field, String),
    Any(Vec<Predicate>),
    All(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, record: &CompanyRecord) -> bool {
        match self {
            Predicate::Contains(field, needle) => field
                .value(record)
                .is_some_and(|v| v.to_lowercase().contains(&needle.to_lowercase())),
            Predicate::NotContains(field, needle) => !field
                .value(record)
                .is_some_and(|v| v.to_lowercase().contains(&needle.to_lowercase())),
            Predicate::Equals(field, expected) => field.value(record) == Some(expected.as_str()),
            Predicate::Any(children) => children.iter().any(|p| p.matches(record)),
            Predicate::All(children) => children.iter().all(|p| p.matches(record)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    TotalLikes,
    SupportStartDate,
    Id,
}

impl SortKey {
    pub fn column(self) -> &'static str {
        match self {
            SortKey::TotalLikes => "total_likes",
            SortKey::SupportStartDate => "support_start_date",
            SortKey::Id => "id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub key: SortKey,
    pub ascending: bool,
    pub nulls_last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub filter: Predicate,
    pub order: Vec<OrderBy>,
    pub page: u32,
    pub offset: u64,
    pub limit: u64,
}

// --- Compiler ---

pub fn compile(page: u32, filters: &SearchFilters) -> Result<CompiledQuery> {
    if page == 0 {
        return Err(anyhow!("Page numbers start at 1"));
    }

    let mut categories = Vec::new();

    let text = filters.query.trim();
    if !text.is_empty() {
        categories.push(Predicate::Any(
            [Field::CompanyName, Field::BranchName, Field::Address, Field::BranchAddress]
                .into_iter()
                .map(|f| Predicate::Contains(f, text.to_string()))
                .collect(),
        ));
    }

    let prefectures: Vec<Predicate> = filters
        .prefectures
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .flat_map(|p| {
            [
                Predicate::Contains(Field::Address, p.to_string()),
                Predicate::Contains(Field::BranchAddress, p.to_string()),
            ]
        })
        .collect();
    if !prefectures.is_empty() {
        categories.push(Predicate::Any(prefectures));
    }

    let included: Vec<Predicate> = filters
        .languages()
        .iter()
        .map(|l| language_keyword(l))
        .filter(|k| !k.is_empty())
        .map(|k| Predicate::Contains(Field::Language, k.to_string()))
        .collect();
    if !included.is_empty() {
        categories.push(Predicate::Any(included));
    }

    categories.extend(
        filters
            .excluded_languages()
            .iter()
            .map(|l| language_keyword(l))
            .filter(|k| !k.is_empty())
            .map(|k| Predicate::NotContains(Field::Language, k.to_string())),
    );

    if filters.support_legal {
        categories.push(Predicate::Equals(Field::SupportLegal, "Yes".to_string()));
    }
    if filters.support_optional {
        categories.push(Predicate::Equals(Field::SupportOptional, "Yes".to_string()));
    }

    let mut order = match filters.date_sort {
        Some(sort) => vec![OrderBy {
            key: SortKey::SupportStartDate,
            ascending: sort == DateSort::Oldest,
            nulls_last: true,
        }],
        None => vec![OrderBy {
            key: SortKey::TotalLikes,
            ascending: false,
            nulls_last: false,
        }],
    };
    order.push(OrderBy {
        key: SortKey::Id,
        ascending: true,
        nulls_last: false,
    });

    Ok(CompiledQuery {
        filter: Predicate::All(categories),
        order,
        page,
        offset: u64::from(page - 1) * u64::from(PAGE_SIZE),
        limit: u64::from(PAGE_SIZE),
    })
}

pub fn total_pages(total: u64) -> u64 {
    total.div_ceil(u64::from(PAGE_SIZE))
}

impl CompiledQuery {
    pub fn matches(&self, record: &CompanyRecord) -> bool {
        self.filter.matches(record)
    }

    /// Result order for two records under this query's sort policy.
    pub fn compare(&self, a: &CompanyRecord, b: &CompanyRecord) -> Ordering {
        for order in &self.order {
            let ord = match order.key {
                SortKey::TotalLikes => directed(a.total_likes.cmp(&b.total_likes), order.ascending),
                SortKey::Id => directed(a.id.cmp(&b.id), order.ascending),
                SortKey::SupportStartDate => {
                    match (a.support_start_date, b.support_start_date) {
                        (Some(x), Some(y)) => directed(x.cmp(&y), order.ascending),
                        (None, None) => Ordering::Equal,
                        (None, Some(_)) if order.nulls_last => Ordering::Greater,
                        (Some(_), None) if order.nulls_last => Ordering::Less,
                        (x, y) => directed(x.cmp(&y), order.ascending),
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    // --- SQLite rendering ---

    pub fn to_sql(&self) -> SqlQuery {
        let mut params = Vec::new();
        let where_clause = render_sql(&self.filter, &mut params);
        let order_clause = self
            .order
            .iter()
            .map(|o| {
                format!(
                    "{} {}{}",
                    o.key.column(),
                    if o.ascending { "ASC" } else { "DESC" },
                    if o.nulls_last { " NULLS LAST" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        SqlQuery {
            where_clause,
            order_clause,
            params,
            limit: self.limit,
            offset: self.offset,
        }
    }

    // --- PostgREST rendering ---

    /// Query string pairs for a PostgREST table endpoint.
    pub fn to_postgrest(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), "*".to_string())];

        if let Predicate::All(children) = &self.filter {
            if !children.is_empty() {
                let inner = children.iter().map(render_postgrest).collect::<Vec<_>>().join(",");
                pairs.push(("and".to_string(), format!("({})", inner)));
            }
        } else {
            pairs.push(("and".to_string(), format!("({})", render_postgrest(&self.filter))));
        }

        let order = self
            .order
            .iter()
            .map(|o| {
                format!(
                    "{}.{}{}",
                    o.key.column(),
                    if o.ascending { "asc" } else { "desc" },
                    if o.nulls_last { ".nullslast" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("order".to_string(), order));
        pairs.push(("offset".to_string(), self.offset.to_string()));
        pairs.push(("limit".to_string(), self.limit.to_string()));
        pairs
    }
}

fn directed(ord: Ordering, ascending: bool) -> Ordering {
    if ascending { ord } else { ord.reverse() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlQuery {
    pub where_clause: String,
    pub order_clause: String,
    pub params: Vec<String>,
    pub limit: u64,
    pub offset: u64,
}

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn render_sql(predicate: &Predicate, params: &mut Vec<String>) -> String {
    match predicate {
        Predicate::Contains(field, needle) => {
            params.push(like_pattern(needle));
            format!("COALESCE({}, '') LIKE ?{} ESCAPE '\\'", field.column(), params.len())
        }
        Predicate::NotContains(field, needle) => {
            params.push(like_pattern(needle));
            format!("COALESCE({}, '') NOT LIKE ?{} ESCAPE '\\'", field.column(), params.len())
        }
        Predicate::Equals(field, expected) => {
            params.push(expected.clone());
            format!("{} = ?{}", field.column(), params.len())
        }
        Predicate::Any(children) if children.is_empty() => "0".to_string(),
        Predicate::All(children) if children.is_empty() => "1".to_string(),
        Predicate::Any(children) => {
            let parts: Vec<String> = children.iter().map(|c| render_sql(c, params)).collect();
            format!("({})", parts.join(" OR "))
        }
        Predicate::All(children) => {
            let parts: Vec<String> = children.iter().map(|c| render_sql(c, params)).collect();
            format!("({})", parts.join(" AND "))
        }
    }
}

/// PostgREST reserves `,.:()` inside logic trees; such values must be double-quoted.
fn postgrest_value(value: &str) -> String {
    if value.chars().any(|c| matches!(c, ',' | '.' | ':' | '(' | ')' | '"' | '\\' | ' ')) {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn render_postgrest(predicate: &Predicate) -> String {
    match predicate {
        Predicate::Contains(field, needle) => {
            format!("{}.ilike.{}", field.column(), postgrest_value(&format!("*{}*", needle)))
        }
        // Explicit NULL branch keeps rows without a value.
        Predicate::NotContains(field, needle) => format!(
            "or({col}.is.null,{col}.not.ilike.{pat})",
            col = field.column(),
            pat = postgrest_value(&format!("*{}*", needle))
        ),
        Predicate::Equals(field, expected) => {
            format!("{}.eq.{}", field.column(), postgrest_value(expected))
        }
        Predicate::Any(children) => format!(
            "or({})",
            children.iter().map(render_postgrest).collect::<Vec<_>>().join(",")
        ),
        Predicate::All(children) => format!(
            "and({})",
            children.iter().map(render_postgrest).collect::<Vec<_>>().join(",")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::company;
    use crate::models::{LanguageState, OfficeRole};
    use chrono::NaiveDate;

    #[test]
    fn test_page_zero_rejected() {
        assert!(compile(0, &SearchFilters::default()).is_err());
    }

    #[test]
    fn test_pagination_offsets() {
        let filters = SearchFilters::default();
        let q = compile(1, &filters).unwrap();
        assert_eq!((q.offset, q.limit), (0, 20));
        let q = compile(3, &filters).unwrap();
        assert_eq!((q.offset, q.limit), (40, 20));
        assert_eq!(total_pages(0), 0);
        assert_eq!(total_pages(20), 1);
        assert_eq!(total_pages(45), 3);
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let q = compile(1, &SearchFilters::default()).unwrap();
        assert_eq!(q.filter, Predicate::All(vec![]));
        assert!(q.matches(&company(1, "Anything", "Anywhere")));
        let sql = q.to_sql();
        assert_eq!(sql.where_clause, "1");
        assert!(sql.params.is_empty());
        assert_eq!(sql.order_clause, "total_likes DESC, id ASC");
    }

    #[test]
    fn test_whitespace_query_is_ignored() {
        let filters = SearchFilters::new("   ", false, false, None);
        let q = compile(1, &filters).unwrap();
        assert_eq!(q.filter, Predicate::All(vec![]));
    }

    #[test]
    fn test_text_filter_checks_four_fields() {
        let filters = SearchFilters::new(" tokyo ", false, false, None);
        let q = compile(1, &filters).unwrap();

        assert!(q.matches(&company(1, "Tokyo Jinzai", "Osaka")));
        assert!(q.matches(&company(2, "Kansai", "Minato-ku, TOKYO")));

        let mut branch = company(3, "Kansai", "Osaka");
        branch.office = OfficeRole::Branch {
            name: Some("Tokyo Office".into()),
            address: None,
            zipcode: None,
        };
        assert!(q.matches(&branch));

        let mut branch_addr = company(4, "Kansai", "Osaka");
        branch_addr.office = OfficeRole::Branch {
            name: None,
            address: Some("Shibuya, Tokyo".into()),
            zipcode: None,
        };
        assert!(q.matches(&branch_addr));

        // Representative and note are not searched.
        let mut other = company(5, "Kansai", "Osaka");
        other.representative = "Tokyo Taro".into();
        other.note = Some("Tokyo".into());
        assert!(!q.matches(&other));
    }

    #[test]
    fn test_prefecture_filter_is_disjunctive() {
        let mut filters = SearchFilters::default();
        filters.prefectures.insert("Aichi".into());
        filters.prefectures.insert("Gifu".into());
        let q = compile(1, &filters).unwrap();

        assert!(q.matches(&company(1, "A", "Nagoya, Aichi")));
        assert!(q.matches(&company(2, "B", "Ogaki, Gifu")));
        assert!(!q.matches(&company(3, "Aichi Kogyo", "Tsu, Mie")));

        let mut branch = company(4, "C", "Tsu, Mie");
        branch.office = OfficeRole::Branch {
            name: None,
            address: Some("Gifu-shi, Gifu".into()),
            zipcode: None,
        };
        assert!(q.matches(&branch));
    }

    #[test]
    fn test_language_include_and_exclude() {
        let mut filters = SearchFilters::default();
        filters.set_language_state("Filipino (Tagalog)", LanguageState::Included);
        filters.set_language_state("Vietnamese", LanguageState::Included);
        filters.set_language_state("Chinese", LanguageState::Excluded);
        filters.set_language_state("Nepali", LanguageState::Excluded);
        let q = compile(1, &filters).unwrap();

        let with = |id: i64, lang: Option<&str>| {
            let mut c = company(id, "X", "Y");
            c.language = lang.map(String::from);
            c
        };

        assert!(q.matches(&with(1, Some("Filipino, English"))));
        assert!(q.matches(&with(2, Some("vietnamese"))));
        assert!(!q.matches(&with(3, Some("Vietnamese, Chinese"))));
        assert!(!q.matches(&with(4, Some("Filipino, Nepali"))));
        assert!(!q.matches(&with(5, Some("English"))));
        assert!(!q.matches(&with(6, None)));
    }

    #[test]
    fn test_exclude_only_keeps_null_language() {
        let mut filters = SearchFilters::default();
        filters.set_language_state("Chinese", LanguageState::Excluded);
        let q = compile(1, &filters).unwrap();

        let mut none = company(1, "X", "Y");
        none.language = None;
        assert!(q.matches(&none));

        let mut chinese = company(2, "X", "Y");
        chinese.language = Some("Chinese (Mandarin)".into());
        assert!(!q.matches(&chinese));
    }

    #[test]
    fn test_support_filters() {
        let filters = SearchFilters::new("", true, true, None);
        let q = compile(1, &filters).unwrap();

        let mut both = company(1, "X", "Y");
        both.support_legal = "Yes".into();
        both.support_optional = "Yes".into();
        assert!(q.matches(&both));

        let mut legal_only = both.clone();
        legal_only.support_optional = "No".into();
        assert!(!q.matches(&legal_only));

        let mut lowercase = both.clone();
        lowercase.support_legal = "yes".into();
        assert!(!q.matches(&lowercase));
    }

    #[test]
    fn test_categories_are_conjunctive() {
        let mut filters = SearchFilters::new("Sakura", true, false, None);
        filters.prefectures.insert("Tokyo".into());
        let q = compile(1, &filters).unwrap();

        let mut hit = company(1, "Sakura Support", "Shinjuku, Tokyo");
        hit.support_legal = "Yes".into();
        assert!(q.matches(&hit));

        // Each record breaks exactly one category.
        let mut wrong_text = hit.clone();
        wrong_text.company_name = "Fuji Support".into();
        assert!(!q.matches(&wrong_text));

        let mut wrong_pref = hit.clone();
        wrong_pref.address = "Naha, Okinawa".into();
        assert!(!q.matches(&wrong_pref));

        let mut wrong_support = hit.clone();
        wrong_support.support_legal = "No".into();
        assert!(!q.matches(&wrong_support));
    }

    #[test]
    fn test_default_sort_with_tie_break() {
        let q = compile(1, &SearchFilters::default()).unwrap();
        let mut records = vec![
            company(5, "a", "x"),
            company(2, "b", "x"),
            company(9, "c", "x"),
            company(1, "d", "x"),
        ];
        records[0].total_likes = 3;
        records[1].total_likes = 3;
        records[2].total_likes = 10;
        records[3].total_likes = 0;

        records.sort_by(|a, b| q.compare(a, b));
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![9, 2, 5, 1]);
    }

    #[test]
    fn test_date_sort_nulls_last_both_directions() {
        let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d);
        let mut records = vec![
            company(4, "a", "x"),
            company(3, "b", "x"),
            company(2, "c", "x"),
            company(1, "d", "x"),
            company(5, "e", "x"),
        ];
        records[0].support_start_date = date(2020, 1, 1);
        records[1].support_start_date = None;
        records[2].support_start_date = date(2020, 1, 1);
        records[3].support_start_date = None;
        records[4].support_start_date = date(2023, 6, 30);

        for (sort, expected) in [
            (DateSort::Newest, vec![5, 2, 4, 1, 3]),
            (DateSort::Oldest, vec![2, 4, 5, 1, 3]),
        ] {
            let filters = SearchFilters::new("", false, false, Some(sort));
            let q = compile(1, &filters).unwrap();
            let mut sorted = records.clone();
            sorted.sort_by(|a, b| q.compare(a, b));
            let ids: Vec<i64> = sorted.iter().map(|r| r.id).collect();
            assert_eq!(ids, expected, "{:?}", sort);
        }
    }

    #[test]
    fn test_sql_rendering() {
        let mut filters = SearchFilters::new("50%_off", false, true, Some(DateSort::Newest));
        filters.set_language_state("Thai", LanguageState::Excluded);
        let sql = compile(2, &filters).unwrap().to_sql();

        assert_eq!(
            sql.where_clause,
            "((COALESCE(company_name, '') LIKE ?1 ESCAPE '\\' OR COALESCE(branch_name, '') LIKE ?2 ESCAPE '\\' \
             OR COALESCE(address, '') LIKE ?3 ESCAPE '\\' OR COALESCE(branch_address, '') LIKE ?4 ESCAPE '\\') \
             AND COALESCE(language, '') NOT LIKE ?5 ESCAPE '\\' AND support_optional = ?6)"
        );
        assert_eq!(sql.params[0], "%50\\%\\_off%");
        assert_eq!(sql.params[4], "%Thai%");
        assert_eq!(sql.params[5], "Yes");
        assert_eq!(sql.order_clause, "support_start_date DESC NULLS LAST, id ASC");
        assert_eq!((sql.limit, sql.offset), (20, 20));
    }

    #[test]
    fn test_postgrest_rendering() {
        let mut filters = SearchFilters::new("Tokyo", false, false, None);
        filters.prefectures.insert("Osaka".into());
        filters.set_language_state("Cambodian (Khmer)", LanguageState::Included);
        filters.set_language_state("Chinese", LanguageState::Excluded);
        filters.support_legal = true;
        filters.date_sort = Some(DateSort::Oldest);

        let pairs = compile(1, &filters).unwrap().to_postgrest();
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("select"), Some("*"));
        assert_eq!(
            get("and"),
            Some(
                "(or(company_name.ilike.*Tokyo*,branch_name.ilike.*Tokyo*,address.ilike.*Tokyo*,branch_address.ilike.*Tokyo*),\
                 or(address.ilike.*Osaka*,branch_address.ilike.*Osaka*),\
                 or(language.ilike.*Cambodian*),\
                 or(language.is.null,language.not.ilike.*Chinese*),\
                 support_legal.eq.Yes)"
            )
        );
        assert_eq!(get("order"), Some("support_start_date.asc.nullslast,id.asc"));
        assert_eq!(get("offset"), Some("0"));
        assert_eq!(get("limit"), Some("20"));
    }

    #[test]
    fn test_postgrest_quotes_reserved_characters() {
        let filters = SearchFilters::new("Co., Ltd.", false, false, None);
        let pairs = compile(1, &filters).unwrap().to_postgrest();
        let and = &pairs.iter().find(|(k, _)| k == "and").unwrap().1;
        assert!(and.contains(r#"company_name.ilike."*Co., Ltd.*""#));
    }

    #[test]
    fn test_postgrest_without_filters_has_no_logic_tree() {
        let pairs = compile(1, &SearchFilters::default()).unwrap().to_postgrest();
        assert!(pairs.iter().all(|(k, _)| k != "and"));
        assert!(pairs.contains(&("order".to_string(), "total_likes.desc,id.asc".to_string())));
    }
}
