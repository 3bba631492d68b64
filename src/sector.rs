use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

// --- Sector alphabet ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectorCode {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
}

impl SectorCode {
    pub const ALL: [SectorCode; 12] = [
        SectorCode::A,
        SectorCode::B,
        SectorCode::C,
        SectorCode::D,
        SectorCode::E,
        SectorCode::F,
        SectorCode::G,
        SectorCode::H,
        SectorCode::I,
        SectorCode::J,
        SectorCode::K,
        SectorCode::L,
    ];

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(SectorCode::A),
            'B' => Some(SectorCode::B),
            'C' => Some(SectorCode::C),
            'D' => Some(SectorCode::D),
            'E' => Some(SectorCode::E),
            'F' => Some(SectorCode::F),
            'G' => Some(SectorCode::G),
            'H' => Some(SectorCode::H),
            'I' => Some(SectorCode::I),
            'J' => Some(SectorCode::J),
            'K' => Some(SectorCode::K),
            'L' => Some(SectorCode::L),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        (b'A' + self.index() as u8) as char
    }

    /// Position in the alphabet, used to index per-sector count columns.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical label, also the enumerated category name in structured output.
    pub fn label(self) -> &'static str {
        match self {
            SectorCode::A => "Nursing Care",
            SectorCode::B => "Building Cleaning",
            SectorCode::C => "Construction",
            SectorCode::D => "Manufacturing",
            SectorCode::E => "Electronics",
            SectorCode::F => "Automobile Repair",
            SectorCode::G => "Aviation",
            SectorCode::H => "Accommodation",
            SectorCode::I => "Agriculture",
            SectorCode::J => "Fishery",
            SectorCode::K => "Food & Beverage Manufacturing",
            SectorCode::L => "Food Service",
        }
    }

    /// Translate a human-readable category label to its code.
    pub fn from_label(label: &str) -> Option<Self> {
        let wanted = label.trim().to_lowercase();
        SECTOR_MAP
            .iter()
            .find(|(name, _)| name.to_lowercase() == wanted)
            .map(|(_, code)| *code)
    }
}

impl fmt::Display for SectorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Label lookup table. Canonical labels first, then the aliases models tend to answer with.
pub const SECTOR_MAP: &[(&str, SectorCode)] = &[
    ("Nursing Care", SectorCode::A),
    ("Building Cleaning", SectorCode::B),
    ("Construction", SectorCode::C),
    ("Manufacturing", SectorCode::D),
    ("Electronics", SectorCode::E),
    ("Automobile Repair", SectorCode::F),
    ("Aviation", SectorCode::G),
    ("Accommodation", SectorCode::H),
    ("Agriculture", SectorCode::I),
    ("Fishery", SectorCode::J),
    ("Food & Beverage Manufacturing", SectorCode::K),
    ("Food Service", SectorCode::L),
    ("Kaigo", SectorCode::A),
    ("Caregiver", SectorCode::A),
    ("Cleaning", SectorCode::B),
    ("Factory", SectorCode::D),
    ("Industrial Manufacturing", SectorCode::D),
    ("Electric", SectorCode::E),
    ("Electronics / Electric", SectorCode::E),
    ("Auto Repair", SectorCode::F),
    ("Hotel", SectorCode::H),
    ("Accommodation / Hotel", SectorCode::H),
    ("Fisheries", SectorCode::J),
    ("Aquaculture", SectorCode::J),
    ("Food Manufacturing", SectorCode::K),
    ("Food and Beverage Manufacturing", SectorCode::K),
    ("Restaurant", SectorCode::L),
    ("Food Service / Restaurant", SectorCode::L),
];

// --- Tags ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorTag {
    pub code: SectorCode,
    pub percent: u8,
}

impl fmt::Display for SectorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.code, self.percent)
    }
}

static TAG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-L])(\d{1,3})$").expect("valid tag token regex"));

// ASCII-only guard: a token touching Japanese text still counts.
static TAG_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9])([A-L])([0-9]{1,3})").expect("valid tag scan regex")
});

impl SectorTag {
    fn from_parts(letter: &str, digits: &str) -> Option<Self> {
        let code = SectorCode::from_char(letter.chars().next()?)?;
        let percent: u16 = digits.parse().ok()?;
        if percent > 100 {
            return None;
        }
        Some(SectorTag { code, percent: percent as u8 })
    }

    /// Parse one wire token such as `A90`.
    pub fn parse_token(token: &str) -> Option<Self> {
        let caps = TAG_TOKEN.captures(token)?;
        Self::from_parts(&caps[1], &caps[2])
    }
}

/// Scan loosely formatted model output for `{code}{percent}` candidates, in order of appearance.
pub fn extract_candidates(text: &str) -> Vec<SectorTag> {
    TAG_IN_TEXT
        .captures_iter(text)
        .filter(|caps| {
            let end = caps.get(2).map_or(0, |m| m.end());
            !text[end..].starts_with(|c: char| c.is_ascii_digit())
        })
        .filter_map(|caps| SectorTag::from_parts(&caps[1], &caps[2]))
        .collect()
}

/// Ordered, duplicate-free tag list, highest confidence first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet(Vec<SectorTag>);

impl TagSet {
    /// Keep candidates at or above `threshold`, one per code (highest wins), sorted descending.
    pub fn from_candidates(candidates: impl IntoIterator<Item = SectorTag>, threshold: u8) -> Self {
        let mut tags: Vec<SectorTag> = candidates
            .into_iter()
            .filter(|t| t.percent >= threshold)
            .collect();
        // Stable sort keeps the first-seen tag ahead on equal percent.
        tags.sort_by(|a, b| b.percent.cmp(&a.percent));

        let mut seen = [false; 12];
        tags.retain(|t| !std::mem::replace(&mut seen[t.code.index()], true));
        TagSet(tags)
    }

    /// Parse a stored tag string. Tokens that are not `[A-L]` followed by 0-100 are skipped.
    pub fn parse(s: &str) -> Self {
        Self::from_candidates(s.split(',').filter_map(|t| SectorTag::parse_token(t.trim())), 0)
    }

    pub fn tags(&self) -> &[SectorTag] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, code: SectorCode) -> bool {
        self.0.iter().any(|t| t.code == code)
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(code: SectorCode, percent: u8) -> SectorTag {
        SectorTag { code, percent }
    }

    #[test]
    fn test_code_char_round_trip() {
        for code in SectorCode::ALL {
            assert_eq!(SectorCode::from_char(code.as_char()), Some(code));
        }
        assert_eq!(SectorCode::from_char('M'), None);
        assert_eq!(SectorCode::from_char('a'), None);
    }

    #[test]
    fn test_from_label_uses_sector_map() {
        assert_eq!(SectorCode::from_label("Nursing Care"), Some(SectorCode::A));
        assert_eq!(SectorCode::from_label("  hotel "), Some(SectorCode::H));
        assert_eq!(SectorCode::from_label("Food & Beverage Manufacturing"), Some(SectorCode::K));
        assert_eq!(SectorCode::from_label("Restaurant"), Some(SectorCode::L));
        assert_eq!(SectorCode::from_label("Space Mining"), None);
    }

    #[test]
    fn test_every_code_has_canonical_label() {
        for code in SectorCode::ALL {
            assert_eq!(SectorCode::from_label(code.label()), Some(code));
        }
    }

    #[test]
    fn test_serialize_format() {
        let set = TagSet::from_candidates(vec![tag(SectorCode::K, 70), tag(SectorCode::A, 95)], 0);
        assert_eq!(set.to_string(), "A95,K70");
        assert_eq!(TagSet::default().to_string(), "");
    }

    #[test]
    fn test_round_trip() {
        let cases = vec![
            vec![],
            vec![tag(SectorCode::A, 100)],
            vec![tag(SectorCode::A, 95), tag(SectorCode::K, 70)],
            vec![tag(SectorCode::L, 100), tag(SectorCode::C, 55), tag(SectorCode::B, 0)],
            vec![tag(SectorCode::H, 80), tag(SectorCode::D, 80), tag(SectorCode::J, 7)],
        ];
        for tags in cases {
            let set = TagSet(tags.clone());
            let parsed = TagSet::parse(&set.to_string());
            assert_eq!(parsed.tags(), tags.as_slice());
        }
    }

    #[test]
    fn test_parse_ignores_invalid_tokens() {
        let set = TagSet::parse("A90,M80,K75,Z1,B101,c50,,D");
        assert_eq!(set.to_string(), "A90,K75");
    }

    #[test]
    fn test_parse_normalizes_order_and_duplicates() {
        let set = TagSet::parse("K40, A90,K75");
        assert_eq!(set.to_string(), "A90,K75");
    }

    #[test]
    fn test_from_candidates_threshold_and_dedupe() {
        let candidates = vec![
            tag(SectorCode::D, 50),
            tag(SectorCode::A, 90),
            tag(SectorCode::A, 60),
            tag(SectorCode::K, 49),
        ];
        let set = TagSet::from_candidates(candidates, 50);
        assert_eq!(set.to_string(), "A90,D50");
        assert!(set.contains(SectorCode::D));
        assert!(!set.contains(SectorCode::K));
    }

    #[test]
    fn test_extract_candidates_from_free_text() {
        let text = r#"Based on job postings: "A95,K80,D50". Also C 40 and COVID19 noise, L75%."#;
        let found = extract_candidates(text);
        assert_eq!(
            found,
            vec![
                tag(SectorCode::A, 95),
                tag(SectorCode::K, 80),
                tag(SectorCode::D, 50),
                tag(SectorCode::L, 75),
            ]
        );
    }

    #[test]
    fn test_extract_candidates_next_to_japanese_text() {
        let found = extract_candidates("推定：介護A90、外食L75です");
        assert_eq!(found, vec![tag(SectorCode::A, 90), tag(SectorCode::L, 75)]);

        let found = extract_candidates("分野は「K80」と「C60」");
        assert_eq!(found, vec![tag(SectorCode::K, 80), tag(SectorCode::C, 60)]);
    }

    #[test]
    fn test_extract_candidates_ignores_longer_numbers() {
        assert_eq!(extract_candidates("A1000 B2024"), vec![]);
        assert_eq!(extract_candidates("E60B70"), vec![tag(SectorCode::E, 60)]);
    }

    #[test]
    fn test_extract_candidates_drops_out_of_range() {
        let found = extract_candidates("H90, L750, I40");
        assert_eq!(found, vec![tag(SectorCode::H, 90), tag(SectorCode::I, 40)]);
    }
}
