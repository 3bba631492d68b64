use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Display;

use crate::sector::{SectorCode, TagSet};

// --- Company ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role")]
pub enum OfficeRole {
    HeadOffice,
    Branch {
        name: Option<String>,
        address: Option<String>,
        zipcode: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyRecord {
    pub id: i64,
    pub reg_number: String,
    pub reg_date: Option<NaiveDate>,
    pub office: OfficeRole,
    pub company_name: String,
    pub address: String,
    pub zipcode: String,
    pub phone: String,
    pub representative: String,
    pub language: Option<String>,
    pub note: Option<String>,
    pub support_legal: String,
    pub support_optional: String,
    pub support_start_date: Option<NaiveDate>,
    pub total_likes: i64,
    pub tags: Option<String>,
}

impl CompanyRecord {
    pub fn is_branch(&self) -> bool {
        matches!(self.office, OfficeRole::Branch { .. })
    }

    pub fn branch_name(&self) -> Option<&str> {
        match &self.office {
            OfficeRole::Branch { name, .. } => name.as_deref(),
            OfficeRole::HeadOffice => None,
        }
    }

    pub fn branch_address(&self) -> Option<&str> {
        match &self.office {
            OfficeRole::Branch { address, .. } => address.as_deref(),
            OfficeRole::HeadOffice => None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.branch_name().unwrap_or(&self.company_name)
    }

    pub fn display_address(&self) -> &str {
        self.branch_address().unwrap_or(&self.address)
    }

    pub fn display_zipcode(&self) -> &str {
        match &self.office {
            OfficeRole::Branch { zipcode: Some(z), .. } => z,
            _ => &self.zipcode,
        }
    }

    pub fn has_legal_support(&self) -> bool {
        self.support_legal == "Yes"
    }

    pub fn has_optional_support(&self) -> bool {
        self.support_optional == "Yes"
    }

    pub fn tag_set(&self) -> TagSet {
        self.tags.as_deref().map(TagSet::parse).unwrap_or_default()
    }
}

/// Untrusted company row as it arrives from a backend, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCompanyRow {
    pub id: Option<Value>,
    pub office_type: Option<String>,
    pub reg_number: Option<String>,
    pub reg_date: Option<String>,
    pub company_name: Option<String>,
    pub zipcode: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub representative: Option<String>,
    pub branch_name: Option<String>,
    pub branch_zipcode: Option<String>,
    pub branch_address: Option<String>,
    pub support_legal: Option<String>,
    pub support_optional: Option<String>,
    pub support_start_date: Option<String>,
    pub language: Option<String>,
    pub note: Option<String>,
    pub total_likes: Option<Value>,
    pub tags: Option<String>,
}

impl RawCompanyRow {
    /// Inverse of validation, used when writing a record back to a store.
    pub fn from_record(record: &CompanyRecord) -> Self {
        let (office_type, branch_name, branch_address, branch_zipcode) = match &record.office {
            OfficeRole::HeadOffice => ("Head Office", None, None, None),
            OfficeRole::Branch { name, address, zipcode } => {
                ("Branch", name.clone(), address.clone(), zipcode.clone())
            }
        };
        Self {
            id: Some(Value::from(record.id)),
            office_type: Some(office_type.to_string()),
            reg_number: Some(record.reg_number.clone()),
            reg_date: record.reg_date.map(|d| d.to_string()),
            company_name: Some(record.company_name.clone()),
            zipcode: Some(record.zipcode.clone()),
            address: Some(record.address.clone()),
            phone: Some(record.phone.clone()),
            representative: Some(record.representative.clone()),
            branch_name,
            branch_zipcode,
            branch_address,
            support_legal: Some(record.support_legal.clone()),
            support_optional: Some(record.support_optional.clone()),
            support_start_date: record.support_start_date.map(|d| d.to_string()),
            language: record.language.clone(),
            note: record.note.clone(),
            total_likes: Some(Value::from(record.total_likes)),
            tags: record.tags.clone(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_int(value: Option<&Value>, field: &str) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| anyhow!("{} is not an integer: {}", field, n)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .with_context(|| format!("{} is not an integer: {:?}", field, s)),
        Some(other) => Err(anyhow!("{} has unexpected type: {}", field, other)),
    }
}

fn parse_date(value: Option<String>, field: &str) -> Result<Option<NaiveDate>> {
    let Some(raw) = non_empty(value) else {
        return Ok(None);
    };
    // Timestamps like "2019-04-01T00:00:00" keep only the date part.
    let date_part = raw.split('T').next().unwrap_or(&raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y/%m/%d"))
        .map(Some)
        .with_context(|| format!("{} is not a date: {:?}", field, raw))
}

fn parse_office(office_type: Option<&str>) -> Result<bool> {
    match office_type.map(str::trim) {
        None | Some("") | Some("Kantor Pusat") | Some("Head Office") | Some("本社") => Ok(false),
        Some("Kantor Cabang") | Some("Branch") | Some("支店") => Ok(true),
        Some(other) => Err(anyhow!("unknown office_type: {:?}", other)),
    }
}

impl TryFrom<RawCompanyRow> for CompanyRecord {
    type Error = anyhow::Error;

    fn try_from(raw: RawCompanyRow) -> Result<Self> {
        let id = parse_int(raw.id.as_ref(), "id")?.ok_or_else(|| anyhow!("missing id"))?;
        let reg_number = non_empty(raw.reg_number)
            .ok_or_else(|| anyhow!("row {} has no reg_number", id))?;
        let company_name = non_empty(raw.company_name)
            .ok_or_else(|| anyhow!("row {} has no company_name", id))?;

        let office = if parse_office(raw.office_type.as_deref())? {
            OfficeRole::Branch {
                name: non_empty(raw.branch_name),
                address: non_empty(raw.branch_address),
                zipcode: non_empty(raw.branch_zipcode),
            }
        } else {
            OfficeRole::HeadOffice
        };

        Ok(CompanyRecord {
            id,
            reg_number,
            reg_date: parse_date(raw.reg_date, "reg_date")?,
            office,
            company_name,
            address: raw.address.unwrap_or_default(),
            zipcode: raw.zipcode.unwrap_or_default(),
            phone: raw.phone.unwrap_or_default(),
            representative: raw.representative.unwrap_or_default(),
            language: non_empty(raw.language),
            note: non_empty(raw.note),
            support_legal: raw.support_legal.unwrap_or_default(),
            support_optional: raw.support_optional.unwrap_or_default(),
            support_start_date: parse_date(raw.support_start_date, "support_start_date")?,
            total_likes: parse_int(raw.total_likes.as_ref(), "total_likes")?.unwrap_or(0).max(0),
            tags: non_empty(raw.tags),
        })
    }
}

/// Validate untrusted rows, dropping (and logging) the ones that do not fit `T`.
pub fn validate_rows<R, T>(rows: impl IntoIterator<Item = R>, kind: &str) -> Vec<T>
where
    T: TryFrom<R>,
    T::Error: Display,
{
    rows.into_iter()
        .filter_map(|raw| match T::try_from(raw) {
            Ok(valid) => Some(valid),
            Err(e) => {
                tracing::warn!(kind, error = %e, "skipping malformed row");
                None
            }
        })
        .collect()
}

/// Same as [`validate_rows`] for rows still in JSON form.
pub fn validate_json_rows<R, T>(rows: Vec<Value>, kind: &str) -> Vec<T>
where
    R: serde::de::DeserializeOwned,
    T: TryFrom<R>,
    T::Error: Display,
{
    let raw: Vec<R> = rows
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<R>(value) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(kind, error = %e, "skipping undecodable row");
                None
            }
        })
        .collect();
    validate_rows(raw, kind)
}

// --- Search filters ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DateSort {
    Newest,
    Oldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageState {
    Neutral,
    Included,
    Excluded,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub query: String,
    pub prefectures: BTreeSet<String>,
    languages: BTreeSet<String>,
    excluded_languages: BTreeSet<String>,
    pub support_legal: bool,
    pub support_optional: bool,
    pub date_sort: Option<DateSort>,
}

impl SearchFilters {
    /// Filters with no prefecture or language selection.
    pub fn new(
        query: impl Into<String>,
        support_legal: bool,
        support_optional: bool,
        date_sort: Option<DateSort>,
    ) -> Self {
        Self {
            query: query.into(),
            support_legal,
            support_optional,
            date_sort,
            ..Default::default()
        }
    }

    pub fn languages(&self) -> &BTreeSet<String> {
        &self.languages
    }

    pub fn excluded_languages(&self) -> &BTreeSet<String> {
        &self.excluded_languages
    }

    pub fn language_state(&self, lang: &str) -> LanguageState {
        if self.languages.contains(lang) {
            LanguageState::Included
        } else if self.excluded_languages.contains(lang) {
            LanguageState::Excluded
        } else {
            LanguageState::Neutral
        }
    }

    /// neutral -> included -> excluded -> neutral
    pub fn cycle_language(&mut self, lang: &str) -> LanguageState {
        let next = match self.language_state(lang) {
            LanguageState::Neutral => LanguageState::Included,
            LanguageState::Included => LanguageState::Excluded,
            LanguageState::Excluded => LanguageState::Neutral,
        };
        self.set_language_state(lang, next);
        next
    }

    pub fn set_language_state(&mut self, lang: &str, state: LanguageState) {
        self.languages.remove(lang);
        self.excluded_languages.remove(lang);
        match state {
            LanguageState::Included => {
                self.languages.insert(lang.to_string());
            }
            LanguageState::Excluded => {
                self.excluded_languages.insert(lang.to_string());
            }
            LanguageState::Neutral => {}
        }
    }
}

/// Languages are matched on their first word so "Filipino (Tagalog)" finds "Filipino".
pub fn language_keyword(lang: &str) -> &str {
    lang.split_whitespace().next().unwrap_or("")
}

pub const LANGUAGES: &[&str] = &[
    "Indonesian",
    "English",
    "Vietnamese",
    "Chinese",
    "Filipino (Tagalog)",
    "Burmese",
    "Nepali",
    "Thai",
    "Cambodian (Khmer)",
    "Mongolian",
    "Uzbek",
    "Sinhalese",
];

/// (name, region), in JIS order.
pub const PREFECTURES: &[(&str, &str)] = &[
    ("Hokkaido", "Hokkaido"),
    ("Aomori", "Tohoku"),
    ("Iwate", "Tohoku"),
    ("Miyagi", "Tohoku"),
    ("Akita", "Tohoku"),
    ("Yamagata", "Tohoku"),
    ("Fukushima", "Tohoku"),
    ("Ibaraki", "Kanto"),
    ("Tochigi", "Kanto"),
    ("Gunma", "Kanto"),
    ("Saitama", "Kanto"),
    ("Chiba", "Kanto"),
    ("Tokyo", "Kanto"),
    ("Kanagawa", "Kanto"),
    ("Niigata", "Chubu"),
    ("Toyama", "Chubu"),
    ("Ishikawa", "Chubu"),
    ("Fukui", "Chubu"),
    ("Yamanashi", "Chubu"),
    ("Nagano", "Chubu"),
    ("Gifu", "Chubu"),
    ("Shizuoka", "Chubu"),
    ("Aichi", "Chubu"),
    ("Mie", "Kansai"),
    ("Shiga", "Kansai"),
    ("Kyoto", "Kansai"),
    ("Osaka", "Kansai"),
    ("Hyogo", "Kansai"),
    ("Nara", "Kansai"),
    ("Wakayama", "Kansai"),
    ("Tottori", "Chugoku"),
    ("Shimane", "Chugoku"),
    ("Okayama", "Chugoku"),
    ("Hiroshima", "Chugoku"),
    ("Yamaguchi", "Chugoku"),
    ("Tokushima", "Shikoku"),
    ("Kagawa", "Shikoku"),
    ("Ehime", "Shikoku"),
    ("Kochi", "Shikoku"),
    ("Fukuoka", "Kyushu"),
    ("Saga", "Kyushu"),
    ("Nagasaki", "Kyushu"),
    ("Kumamoto", "Kyushu"),
    ("Oita", "Kyushu"),
    ("Miyazaki", "Kyushu"),
    ("Kagoshima", "Kyushu"),
    ("Okinawa", "Kyushu"),
];

/// Case-insensitive lookup returning the canonical spelling.
pub fn find_prefecture(name: &str) -> Option<&'static str> {
    PREFECTURES
        .iter()
        .find(|(p, _)| p.eq_ignore_ascii_case(name.trim()))
        .map(|(p, _)| *p)
}

/// Prefecture named by the rightmost address segment that starts with one.
/// "Sagamihara, Kanagawa" is Kanagawa, never Saga.
pub fn prefecture_of(address: &str) -> Option<&'static str> {
    let lower = address.to_lowercase();
    lower.rsplit(',').map(str::trim).find_map(|segment| {
        PREFECTURES.iter().map(|(p, _)| *p).find(|p| {
            segment
                .strip_prefix(p.to_lowercase().as_str())
                .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_alphabetic()))
        })
    })
}

/// Case-insensitive lookup over [`LANGUAGES`], accepting the full name or its first word.
pub fn find_language(name: &str) -> Option<&'static str> {
    let wanted = name.trim();
    LANGUAGES
        .iter()
        .find(|l| l.eq_ignore_ascii_case(wanted) || language_keyword(l).eq_ignore_ascii_case(wanted))
        .copied()
}

// --- Likes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeOutcome {
    pub liked: bool,
    pub total: i64,
}

// --- Leaderboard ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardRow {
    pub prefecture: String,
    pub total_companies: i64,
    pub total_analyzed: i64,
    pub sector_counts: [i64; 12],
}

impl LeaderboardRow {
    pub fn sector_count(&self, code: SectorCode) -> i64 {
        self.sector_counts[code.index()]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLeaderboardRow {
    pub prefecture: Option<String>,
    pub total_tsk: Option<i64>,
    pub total_tags_analyzed: Option<i64>,
    pub ssw_a: Option<i64>,
    pub ssw_b: Option<i64>,
    pub ssw_c: Option<i64>,
    pub ssw_d: Option<i64>,
    pub ssw_e: Option<i64>,
    pub ssw_f: Option<i64>,
    pub ssw_g: Option<i64>,
    pub ssw_h: Option<i64>,
    pub ssw_i: Option<i64>,
    pub ssw_j: Option<i64>,
    pub ssw_k: Option<i64>,
    pub ssw_l: Option<i64>,
}

impl TryFrom<RawLeaderboardRow> for LeaderboardRow {
    type Error = anyhow::Error;

    fn try_from(raw: RawLeaderboardRow) -> Result<Self> {
        let prefecture = non_empty(raw.prefecture)
            .ok_or_else(|| anyhow!("leaderboard row has no prefecture"))?;
        let total_companies = raw
            .total_tsk
            .ok_or_else(|| anyhow!("{}: missing total_tsk", prefecture))?;
        let total_analyzed = raw
            .total_tags_analyzed
            .ok_or_else(|| anyhow!("{}: missing total_tags_analyzed", prefecture))?;
        if total_companies < 0 || total_analyzed < 0 || total_analyzed > total_companies {
            return Err(anyhow!(
                "{}: inconsistent totals ({} analyzed of {})",
                prefecture,
                total_analyzed,
                total_companies
            ));
        }

        let sector_counts = [
            raw.ssw_a, raw.ssw_b, raw.ssw_c, raw.ssw_d, raw.ssw_e, raw.ssw_f, raw.ssw_g, raw.ssw_h,
            raw.ssw_i, raw.ssw_j, raw.ssw_k, raw.ssw_l,
        ]
        .map(|c| c.unwrap_or(0).max(0));

        Ok(LeaderboardRow {
            prefecture,
            total_companies,
            total_analyzed,
            sector_counts,
        })
    }
}
