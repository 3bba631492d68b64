use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

// --- Reference tables ---

#[derive(Debug, Clone, Copy)]
pub struct SswField {
    pub id: &'static str,
    pub jp_exam: &'static str,
    pub jp_field: &'static str,
    pub jobs: &'static [&'static str],
}

pub const SSW_FIELDS: &[SswField] = &[
    SswField {
        id: "caregiver",
        jp_exam: "介護技能評価試験、介護日本語評価試験",
        jp_field: "介護",
        jobs: &["介護職員（特別養護老人ホーム等）", "訪問介護員", "デイサービススタッフ", "グループホームスタッフ", "リハビリ助手"],
    },
    SswField {
        id: "food_service",
        jp_exam: "外食業特定技能1号技能測定試験",
        jp_field: "外食業",
        jobs: &["調理スタッフ", "調理補助", "キッチンスタッフ", "ホールスタッフ", "ファストフードクルー", "バリスタ・カフェスタッフ"],
    },
    SswField {
        id: "agriculture",
        jp_exam: "農業技能測定試験1号",
        jp_field: "農業",
        jobs: &["農業作業員（野菜栽培）", "農業作業員（果樹栽培）", "農業作業員（稲作）", "施設園芸作業員", "養鶏場作業員", "酪農・畜産作業員"],
    },
    SswField {
        id: "food_manufacturing",
        jp_exam: "飲食料品製造業特定技能1号技能測定試験",
        jp_field: "飲食料品製造業",
        jobs: &["食品製造作業員", "清涼飲料水製造作業員", "水産・食肉加工", "パン・菓子製造", "包装ラインオペレーター", "品質管理スタッフ"],
    },
    SswField {
        id: "auto_repair",
        jp_exam: "自動車整備分野特定技能1号評価試験",
        jp_field: "自動車整備",
        jobs: &["自動車整備士", "点検・整備スタッフ", "大型・ディーゼル整備士", "車検・検査員", "タイヤ交換・整備士"],
    },
    SswField {
        id: "fishery_aquaculture",
        jp_exam: "1号漁業技能測定試験(養殖業)",
        jp_field: "漁業（養殖業）",
        jobs: &["養殖作業員（魚類）", "養殖作業員（貝類）", "養殖作業員（海藻）", "種苗生産スタッフ", "生簀管理作業員"],
    },
    SswField {
        id: "fishery_fishing",
        jp_exam: "1号漁業技能測定試験(漁業)",
        jp_field: "漁業（漁業）",
        jobs: &["漁船甲板員", "沖合漁業従事者", "沿岸漁業従事者", "漁具・網作業員", "船上加工スタッフ"],
    },
    SswField {
        id: "construction",
        jp_exam: "建設分野特定技能1号評価試験",
        jp_field: "建設",
        jobs: &["多能工", "建築大工", "鉄筋施工", "溶接工", "建設機械施工", "コンクリート仕上げ", "とび職"],
    },
    SswField {
        id: "accommodation",
        jp_exam: "宿泊分野特定技能1号評価試験",
        jp_field: "宿泊",
        jobs: &["ホテルフロント", "客室清掃・ハウスキーピング", "コンシェルジュ", "旅館業務（仲居等）", "宴会スタッフ", "ホテルレストランサービス"],
    },
    SswField {
        id: "manufacturing",
        jp_exam: "製造分野特定技能1号評価試験",
        jp_field: "素形材・産業機械・電気電子情報関連製造業",
        jobs: &["組立・加工スタッフ", "機械加工オペレーター", "金属プレス加工", "電子機器組立て", "品質管理スタッフ", "梱包・出荷作業員"],
    },
];

/// (id, name as written in Japanese)
pub const JAPANESE_LEVELS: &[(&str, &str)] = &[
    ("n1", "JLPT N1"),
    ("n2", "JLPT N2"),
    ("n3", "JLPT N3"),
    ("n4", "JLPT N4"),
    ("n5", "JLPT N5"),
    ("jft", "JFT-Basic A2"),
    ("nat1", "NAT-TEST 1級"),
    ("nat2", "NAT-TEST 2級"),
    ("nat3", "NAT-TEST 3級"),
    ("nat4", "NAT-TEST 4級"),
    ("nat5", "NAT-TEST 5級"),
];

pub fn find_field(id: &str) -> Option<&'static SswField> {
    SSW_FIELDS.iter().find(|f| f.id == id)
}

pub fn find_level(id: &str) -> Option<&'static str> {
    JAPANESE_LEVELS.iter().find(|(l, _)| *l == id).map(|(_, jp)| *jp)
}

// --- Applicant profile ---

static KATAKANA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\x{30A0}-\x{30FF}\s]+$").expect("valid katakana regex"));

static COMPANY_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\s+(Company\s+Limited|Co\.,\s*Ltd\.?|Ltd\.?|Inc\.?|K\.K\.?|Corp\.?|Corporation))\s*$")
        .expect("valid company suffix regex")
});

static YEAR_MONTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").expect("valid year-month regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicantProfile {
    pub country: String,
    pub nickname_kana: String,
    pub ssw_field: String,
    pub experienced: bool,
    pub jlpt: String,
    /// `YYYY-MM`
    pub jlpt_passed: Option<String>,
    pub ssw_cert: String,
    pub ssw_cert_passed: Option<String>,
    pub desired_job: String,
    pub full_name_kana: String,
    pub full_name: String,
    pub address: String,
    pub email: String,
    pub phone: String,
}

impl Default for ApplicantProfile {
    fn default() -> Self {
        Self {
            country: "インドネシア".to_string(),
            nickname_kana: String::new(),
            ssw_field: String::new(),
            experienced: false,
            jlpt: String::new(),
            jlpt_passed: None,
            ssw_cert: String::new(),
            ssw_cert_passed: None,
            desired_job: String::new(),
            full_name_kana: String::new(),
            full_name: String::new(),
            address: "インドネシア".to_string(),
            email: String::new(),
            phone: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn is_katakana(s: &str) -> bool {
    KATAKANA.is_match(s)
}

impl ApplicantProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid profile JSON: {}", path.display()))
    }

    /// Every problem at once, empty when the profile is usable.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        let mut push = |field, message: &str| {
            errors.push(FieldError { field, message: message.to_string() })
        };

        if !is_katakana(&self.nickname_kana) {
            push("nickname_kana", "must be katakana (e.g. ヤマダ)");
        }
        if !is_katakana(&self.full_name_kana) {
            push("full_name_kana", "must be katakana");
        }
        if find_field(&self.ssw_field).is_none() {
            push("ssw_field", "choose an SSW field");
        }
        if find_level(&self.jlpt).is_none() {
            push("jlpt", "choose a language certificate");
        }
        if find_field(&self.ssw_cert).is_none() {
            push("ssw_cert", "choose an SSW certificate");
        }
        let job = self.desired_job.trim();
        if job.is_empty() {
            push("desired_job", "choose the job you want");
        } else if let Some(field) = find_field(&self.ssw_field) {
            if !field.jobs.contains(&job) {
                push("desired_job", "choose a job listed for the selected SSW field");
            }
        }
        if self.email.trim().is_empty() {
            push("email", "email is required");
        }
        for (field, value) in [("jlpt_passed", &self.jlpt_passed), ("ssw_cert_passed", &self.ssw_cert_passed)] {
            if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                if !YEAR_MONTH.is_match(v.trim()) {
                    push(field, "use YYYY-MM");
                }
            }
        }
        errors
    }

    /// Japanese application email addressed to `company_name`.
    pub fn render(&self, company_name: &str) -> Result<String> {
        let errors = self.validate();
        if !errors.is_empty() {
            let listed = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            return Err(anyhow!("Profile is incomplete: {}", listed));
        }

        let field = find_field(&self.ssw_field).map(|f| f.jp_field).unwrap_or_default();
        let cert = find_field(&self.ssw_cert).map(|f| f.jp_exam).unwrap_or_default();
        let level = find_level(&self.jlpt).unwrap_or_default();
        let experience = if self.experienced { "経験者" } else { "未経験" };

        Ok(format!(
            "株式会社{company}\n\
             採用ご担当者様\n\
             \n\
             はじめまして。\n\
             {country}国籍の{nickname}と申します。\n\
             \n\
             特定技能「{field}」で就職先を探しております。{experience}でも応募可能な求人をご紹介いただくことは可能でしょうか。\n\
             \n\
             日本語力：{level}（{level_date} 合格）\n\
             資格：{cert}（{cert_date} 合格）\n\
             希望職種：{job}\n\
             \n\
             体を動かす仕事や、\n\
             シフト勤務は問題ありません。\n\
             日本で長く働きたいと考えています。\n\
             \n\
             入社時期や在留資格の手続きについては、\n\
             会社の方針に従います。\n\
             \n\
             履歴書（CV）を添付いたします。ご確認のほどよろしくお願いいたします。\n\
             \n\
             氏名：{name_kana}\n\
             ({name}）\n\
             住所：{address}\n\
             メール：{email}\n\
             電話：{phone}（WhatsApp可）",
            company = clean_company_name(company_name),
            country = self.country,
            nickname = self.nickname_kana.trim(),
            field = field,
            experience = experience,
            level = level,
            level_date = format_jp_month(self.jlpt_passed.as_deref()),
            cert = cert,
            cert_date = format_jp_month(self.ssw_cert_passed.as_deref()),
            job = self.desired_job.trim(),
            name_kana = self.full_name_kana.trim(),
            name = self.full_name.trim(),
            address = self.address,
            email = self.email.trim(),
            phone = self.phone.trim(),
        ))
    }
}

/// Strip a trailing legal suffix such as `Co., Ltd.` or `K.K.`.
pub fn clean_company_name(name: &str) -> String {
    COMPANY_SUFFIX.replace(name.trim(), "").into_owned()
}

/// `2024-07` -> `2024年07月`; missing -> `----年--月`.
pub fn format_jp_month(value: Option<&str>) -> String {
    match value.map(str::trim).and_then(|v| YEAR_MONTH.captures(v)) {
        Some(caps) => format!("{}年{}月", &caps[1], &caps[2]),
        None => "----年--月".to_string(),
    }
}
