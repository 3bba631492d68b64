use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ai::{extract_json, CompletionClient, CompletionRequest, Credential, ProviderKind};
use crate::backend::Backend;
use crate::models::CompanyRecord;
use crate::sector::{extract_candidates, SectorCode, SectorTag, TagSet};

/// Minimum confidence a sector needs to be kept.
pub const DEFAULT_THRESHOLD: u8 = 50;

const SEARCH_HANDOFF_URL: &str = "https://www.google.com/search";

// --- Configuration ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Scan the reply for `A90`-style tokens.
    #[default]
    FreeText,
    /// Ask for `{sectors: [{category, score}]}` and validate it.
    Structured,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub threshold: u8,
    pub output_mode: OutputMode,
    /// Tried in order, first = primary.
    pub credentials: Vec<Credential>,
    pub gemini_models: Vec<String>,
    pub openai_models: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            output_mode: OutputMode::default(),
            credentials: Vec::new(),
            gemini_models: ProviderKind::Gemini.default_models(),
            openai_models: ProviderKind::OpenAI.default_models(),
        }
    }
}

impl ClassifierConfig {
    pub fn models_for(&self, provider: ProviderKind) -> &[String] {
        match provider {
            ProviderKind::Gemini => &self.gemini_models,
            ProviderKind::OpenAI => &self.openai_models,
        }
    }
}

// --- Attempt log ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(String),
    NoCandidates,
    Error(String),
}

impl AttemptOutcome {
    fn name(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::NoCandidates => "no_candidates",
            AttemptOutcome::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub credential: String,
    pub provider: ProviderKind,
    pub model: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub tags: TagSet,
    pub attempts: Vec<Attempt>,
}

// --- Classifier ---

pub struct Classifier<C> {
    client: C,
    config: ClassifierConfig,
    schema: Value,
}

impl<C: CompletionClient> Classifier<C> {
    pub fn new(client: C, config: ClassifierConfig) -> Self {
        Self {
            client,
            config,
            schema: sector_schema(),
        }
    }

    /// Tag string for `company`, or `""` when every attempt came up empty.
    pub async fn classify(&self, company: &CompanyRecord) -> String {
        self.run(company).await.tags.to_string()
    }

    /// Walk credentials, then each credential's models, until one yields qualifying tags.
    pub async fn run(&self, company: &CompanyRecord) -> Classification {
        let prompt = build_prompt(company, self.config.threshold, self.config.output_mode);
        let schema = match self.config.output_mode {
            OutputMode::Structured => Some(&self.schema),
            OutputMode::FreeText => None,
        };

        let mut attempts = Vec::new();
        for credential in &self.config.credentials {
            for model in self.config.models_for(credential.provider) {
                let request = CompletionRequest {
                    prompt: &prompt,
                    model,
                    credential,
                    web_search: true,
                    schema,
                };
                let outcome = match self.attempt(&request).await {
                    Ok(tags) if tags.is_empty() => AttemptOutcome::NoCandidates,
                    Ok(tags) => AttemptOutcome::Success(tags.to_string()),
                    Err(e) => AttemptOutcome::Error(format!("{:#}", e)),
                };
                log_attempt(company.id, credential, model, &outcome);

                let done = match &outcome {
                    AttemptOutcome::Success(tags) => Some(TagSet::parse(tags)),
                    _ => None,
                };
                attempts.push(Attempt {
                    credential: credential.label.clone(),
                    provider: credential.provider,
                    model: model.clone(),
                    outcome,
                });
                if let Some(tags) = done {
                    return Classification { tags, attempts };
                }
            }
        }

        tracing::info!(
            company_id = company.id,
            attempts = attempts.len(),
            "classification exhausted every credential and model"
        );
        Classification { tags: TagSet::default(), attempts }
    }

    async fn attempt(&self, request: &CompletionRequest<'_>) -> Result<TagSet> {
        let text = self.client.complete(request).await?;
        let candidates = match self.config.output_mode {
            OutputMode::FreeText => extract_candidates(&text),
            OutputMode::Structured => parse_structured(&text)?,
        };
        Ok(TagSet::from_candidates(candidates, self.config.threshold))
    }
}

fn log_attempt(company_id: i64, credential: &Credential, model: &str, outcome: &AttemptOutcome) {
    match outcome {
        AttemptOutcome::Success(tags) => tracing::info!(
            company_id,
            credential = %credential.label,
            provider = %credential.provider,
            model,
            outcome = outcome.name(),
            tags = %tags,
            "classification attempt"
        ),
        AttemptOutcome::NoCandidates => tracing::info!(
            company_id,
            credential = %credential.label,
            provider = %credential.provider,
            model,
            outcome = outcome.name(),
            "classification attempt"
        ),
        AttemptOutcome::Error(error) => tracing::warn!(
            company_id,
            credential = %credential.label,
            provider = %credential.provider,
            model,
            outcome = outcome.name(),
            error = %error,
            "classification attempt"
        ),
    }
}

// --- Prompt ---

fn sector_legend() -> String {
    SectorCode::ALL
        .iter()
        .map(|code| format!("{}: {}", code, code.label()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(company: &CompanyRecord, threshold: u8, mode: OutputMode) -> String {
    let output_rules = match mode {
        OutputMode::FreeText => "Return ONLY the codes followed immediately by the percentage \
             (for example \"A95,K80,D50\"), separated by commas and sorted by percentage, highest first. \
             If nothing qualifies, return an empty string."
            .to_string(),
        OutputMode::Structured => format!(
            "Return JSON of the form {{\"sectors\": [{{\"category\": <label>, \"score\": <0-100>}}]}} \
             where <label> is exactly one of: {}. If nothing qualifies, return {{\"sectors\": []}}.",
            SectorCode::ALL.map(|c| format!("\"{}\"", c.label())).join(", ")
        ),
    };

    format!(
        "Analyze this Japanese Registered Support Organization (TSK).\n\
         Company Name: {name}\n\
         Address: {address}\n\
         Registration Number: {reg}\n\n\
         Task: use web search (prioritise Japanese sources, the official website and job postings) \
         to identify which Specified Skilled Worker sectors they handle or recruit for. \
         Assign each sector a confidence percentage (0-100) based on the strength of the evidence.\n\n\
         Sector codes:\n{legend}\n\n\
         Only report sectors with a confidence of {threshold}% or higher.\n\
         {output_rules}",
        name = company.display_name(),
        address = company.display_address(),
        reg = company.reg_number,
        legend = sector_legend(),
        threshold = threshold,
        output_rules = output_rules,
    )
}

// --- Structured output ---

/// JSON schema for structured replies: one object per sector, enumerated category, integer score.
pub fn sector_schema() -> Value {
    let labels: Vec<&str> = SectorCode::ALL.iter().map(|c| c.label()).collect();
    json!({
        "type": "object",
        "properties": {
            "sectors": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "category": { "type": "string", "enum": labels },
                        "score": { "type": "integer" }
                    },
                    "required": ["category", "score"]
                }
            }
        },
        "required": ["sectors"]
    })
}

#[derive(Debug, Deserialize)]
struct StructuredReply {
    sectors: Vec<StructuredSector>,
}

#[derive(Debug, Deserialize)]
struct StructuredSector {
    category: String,
    score: i64,
}

/// Validate a structured reply. Any entry outside the schema fails the whole attempt.
pub fn parse_structured(text: &str) -> Result<Vec<SectorTag>> {
    let payload = extract_json(text).ok_or_else(|| anyhow!("No JSON object in reply"))?;
    let reply: StructuredReply =
        serde_json::from_str(payload).context("Reply does not match the sector schema")?;

    reply
        .sectors
        .into_iter()
        .map(|s| {
            let code = SectorCode::from_label(&s.category)
                .ok_or_else(|| anyhow!("Unknown sector category: {:?}", s.category))?;
            let percent = u8::try_from(s.score)
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| anyhow!("Score out of range for {}: {}", s.category, s.score))?;
            Ok(SectorTag { code, percent })
        })
        .collect()
}

// --- Investigate ---

#[derive(Debug, Clone)]
pub struct Investigation {
    pub tags: String,
    pub tags_written: bool,
    pub search_url: String,
    pub attempts: Vec<Attempt>,
}

/// Classify, persist non-empty tags, then build the external research hand-off.
pub async fn investigate<B: Backend, C: CompletionClient>(
    backend: &B,
    classifier: &Classifier<C>,
    company: &CompanyRecord,
    write_back: bool,
) -> Result<Investigation> {
    let classification = classifier.run(company).await;
    let tags = classification.tags.to_string();

    let mut tags_written = false;
    if write_back && !tags.is_empty() {
        match backend.update_tags(company.id, &tags).await {
            Ok(()) => {
                tags_written = true;
                tracing::info!(company_id = company.id, tags = %tags, "tags saved");
            }
            Err(e) => tracing::warn!(company_id = company.id, error = %e, "tag write-back failed"),
        }
    }

    Ok(Investigation {
        tags,
        tags_written,
        search_url: search_url(company)?,
        attempts: classification.attempts,
    })
}

pub fn research_prompt(company: &CompanyRecord) -> String {
    let ceo = if company.representative.trim().is_empty() {
        String::new()
    } else {
        format!(", Representative: {}", company.representative)
    };
    let prompt = format!(
        "Research the Japanese Registered Support Organization \"{name}\" thoroughly, searching in Japanese. \
         Verify it is the right company: Registration No. {reg}, Address: {address}{ceo}. \
         Back every claim with a working source URL. Answer four points: \
         1. Digital footprint: official Instagram, Facebook, LinkedIn or X accounts with links. \
         2. Likely Specified Skilled Worker job fields with an accuracy percentage and the job posting that supports each. \
         3. How to apply: the direct contact or inquiry form URL, any HR email, and the steps to apply. \
         4. Reputation: Google Maps reviews, local news and any blacklist or scandal mentions, with sources.",
        name = company.display_name(),
        reg = company.reg_number,
        address = company.display_address(),
        ceo = ceo,
    );
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn search_url(company: &CompanyRecord) -> Result<String> {
    let url = reqwest::Url::parse_with_params(
        SEARCH_HANDOFF_URL,
        &[("q", research_prompt(company).as_str()), ("udm", "50")],
    )
    .context("Failed to build search URL")?;
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MemoryBackend;
    use crate::models::tests::company;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays canned replies in order and records each call.
    #[derive(Default)]
    struct ScriptedClient {
        replies: RefCell<VecDeque<Result<String>>>,
        calls: RefCell<Vec<(String, String, bool, bool)>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                calls: RefCell::default(),
            }
        }
    }

    impl CompletionClient for ScriptedClient {
        async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String> {
            self.calls.borrow_mut().push((
                request.credential.label.clone(),
                request.model.to_string(),
                request.web_search,
                request.schema.is_some(),
            ));
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("429 Too Many Requests")))
        }
    }

    fn config(threshold: u8, mode: OutputMode) -> ClassifierConfig {
        let key = |provider, label: &str| Credential {
            provider,
            label: label.to_string(),
            api_key: format!("key-{}", label),
        };
        ClassifierConfig {
            threshold,
            output_mode: mode,
            credentials: vec![
                key(ProviderKind::Gemini, "gemini#1"),
                key(ProviderKind::Gemini, "gemini#2"),
                key(ProviderKind::OpenAI, "openai#1"),
            ],
            gemini_models: vec!["flash".into(), "flash-lite".into()],
            openai_models: vec!["gpt-4o-mini".into()],
        }
    }

    fn sakura() -> CompanyRecord {
        company(1, "Sakura Support", "Minato-ku, Tokyo")
    }

    #[tokio::test]
    async fn test_exhaustion_returns_empty_and_writes_nothing() {
        let client = ScriptedClient::new(vec![
            Err(anyhow!("503 Service Unavailable")),
            Ok("I could not find any information about this company.".into()),
            Ok(String::new()),
            Err(anyhow!("quota exceeded")),
            Ok("A10,B20".into()),
        ]);
        let classifier = Classifier::new(client, config(50, OutputMode::FreeText));
        let backend = MemoryBackend::with_companies(vec![sakura()]);

        let result = investigate(&backend, &classifier, &sakura(), true).await.unwrap();
        assert_eq!(result.tags, "");
        assert!(!result.tags_written);
        assert!(backend.tag_writes.borrow().is_empty());

        // 2 gemini keys x 2 models + 1 openai key x 1 model, every one logged.
        assert_eq!(result.attempts.len(), 5);
        assert_eq!(classifier.client.calls.borrow().len(), 5);
        assert!(result.attempts.iter().all(|a| !matches!(a.outcome, AttemptOutcome::Success(_))));
        assert!(result.search_url.contains("udm=50"));
    }

    #[tokio::test]
    async fn test_fallback_order_and_stop_on_success() {
        let client = ScriptedClient::new(vec![
            Err(anyhow!("503")),
            Err(anyhow!("404 model not found")),
            Ok("Evidence suggests K70, A95 and maybe D30.".into()),
            Ok("C99".into()),
        ]);
        let classifier = Classifier::new(client, config(50, OutputMode::FreeText));

        assert_eq!(classifier.classify(&sakura()).await, "A95,K70");
        let calls = classifier.client.calls.borrow();
        let order: Vec<(&str, &str)> = calls.iter().map(|c| (c.0.as_str(), c.1.as_str())).collect();
        assert_eq!(
            order,
            vec![("gemini#1", "flash"), ("gemini#1", "flash-lite"), ("gemini#2", "flash")]
        );
        assert!(calls.iter().all(|c| c.2 && !c.3));
    }

    #[tokio::test]
    async fn test_below_threshold_reply_advances() {
        let client = ScriptedClient::new(vec![Ok("A40,K45".into()), Ok("A40,K60,K80".into())]);
        let classifier = Classifier::new(client, config(50, OutputMode::FreeText));

        let result = classifier.run(&sakura()).await;
        assert_eq!(result.tags.to_string(), "K80");
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::NoCandidates);
        assert_eq!(result.attempts[1].outcome, AttemptOutcome::Success("K80".into()));
    }

    #[tokio::test]
    async fn test_threshold_is_configurable() {
        let client = ScriptedClient::new(vec![Ok("A95,K70,D50".into())]);
        let classifier = Classifier::new(client, config(75, OutputMode::FreeText));
        assert_eq!(classifier.classify(&sakura()).await, "A95");
    }

    #[tokio::test]
    async fn test_structured_mode() {
        let client = ScriptedClient::new(vec![
            Ok(r#"{"sectors": [{"category": "Space Mining", "score": 90}]}"#.into()),
            Ok("```json\n{\"sectors\": [{\"category\": \"Food Service\", \"score\": 85}, {\"category\": \"Hotel\", \"score\": 60}]}\n```".into()),
        ]);
        let classifier = Classifier::new(client, config(50, OutputMode::Structured));

        let result = classifier.run(&sakura()).await;
        assert_eq!(result.tags.to_string(), "L85,H60");
        assert!(matches!(result.attempts[0].outcome, AttemptOutcome::Error(_)));
        assert!(classifier.client.calls.borrow().iter().all(|c| c.3));
    }

    #[tokio::test]
    async fn test_write_back_failure_is_not_fatal() {
        let client = ScriptedClient::new(vec![Ok("C80".into())]);
        let classifier = Classifier::new(client, config(50, OutputMode::FreeText));
        let backend = MemoryBackend::with_companies(vec![sakura()]);
        backend.fail_update_tags.set(true);

        let result = investigate(&backend, &classifier, &sakura(), true).await.unwrap();
        assert_eq!(result.tags, "C80");
        assert!(!result.tags_written);
        assert_eq!(*backend.tag_writes.borrow(), vec![(1, "C80".to_string())]);
    }

    #[tokio::test]
    async fn test_investigate_writes_tags() {
        let client = ScriptedClient::new(vec![Ok("A90".into())]);
        let classifier = Classifier::new(client, config(50, OutputMode::FreeText));
        let backend = MemoryBackend::with_companies(vec![sakura()]);

        let result = investigate(&backend, &classifier, &sakura(), true).await.unwrap();
        assert!(result.tags_written);
        assert_eq!(backend.companies.borrow()[0].tags.as_deref(), Some("A90"));

        let client = ScriptedClient::new(vec![Ok("B90".into())]);
        let classifier = Classifier::new(client, config(50, OutputMode::FreeText));
        let dry = investigate(&backend, &classifier, &sakura(), false).await.unwrap();
        assert_eq!(dry.tags, "B90");
        assert!(!dry.tags_written);
        assert_eq!(backend.companies.borrow()[0].tags.as_deref(), Some("A90"));
    }

    #[tokio::test]
    async fn test_no_credentials_means_no_attempts() {
        let mut cfg = config(50, OutputMode::FreeText);
        cfg.credentials.clear();
        let classifier = Classifier::new(ScriptedClient::default(), cfg);
        let result = classifier.run(&sakura()).await;
        assert!(result.tags.is_empty());
        assert!(result.attempts.is_empty());
    }

    #[test]
    fn test_parse_structured_rejections() {
        assert!(parse_structured("no json").is_err());
        assert!(parse_structured(r#"{"sectors": [{"category": "Construction", "score": 101}]}"#).is_err());
        assert!(parse_structured(r#"{"sectors": [{"category": "Construction", "score": -1}]}"#).is_err());
        assert!(parse_structured(r#"{"sectors": [{"category": "Construction"}]}"#).is_err());
        let tags = parse_structured(r#"{"sectors": [{"category": "construction", "score": 77}]}"#).unwrap();
        assert_eq!(tags, vec![SectorTag { code: SectorCode::C, percent: 77 }]);
    }

    #[test]
    fn test_prompt_contents() {
        let prompt = build_prompt(&sakura(), 65, OutputMode::FreeText);
        assert!(prompt.contains("Sakura Support"));
        assert!(prompt.contains("Minato-ku, Tokyo"));
        assert!(prompt.contains("65%"));
        assert!(prompt.contains("L: Food Service"));
        assert!(prompt.contains("web search"));

        let structured = build_prompt(&sakura(), 50, OutputMode::Structured);
        assert!(structured.contains("\"Nursing Care\""));
    }

    #[test]
    fn test_schema_enumerates_every_label() {
        let schema = sector_schema();
        let labels = schema["properties"]["sectors"]["items"]["properties"]["category"]["enum"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(labels, 12);
    }

    #[test]
    fn test_search_url() {
        let url = search_url(&sakura()).unwrap();
        assert!(url.starts_with("https://www.google.com/search?q="));
        assert!(url.ends_with("&udm=50"));
        let parsed = reqwest::Url::parse(&url).unwrap();
        let q = parsed.query_pairs().find(|(k, _)| k == "q").unwrap().1.into_owned();
        assert!(q.contains("\"Sakura Support\""));
        assert!(!q.contains("  "));
    }
}
