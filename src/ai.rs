use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// --- Provider model ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    #[serde(rename = "openai")]
    OpenAI,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAI => "openai",
        }
    }

    /// Model priority list used when the configuration names none.
    pub fn default_models(self) -> Vec<String> {
        let models: &[&str] = match self {
            ProviderKind::Gemini => &["gemini-2.5-flash", "gemini-2.0-flash", "gemini-2.0-flash-exp"],
            ProviderKind::OpenAI => &["gpt-4o-mini"],
        };
        models.iter().map(|m| m.to_string()).collect()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One API key. `label` is what appears in logs; the key never does.
#[derive(Clone)]
pub struct Credential {
    pub provider: ProviderKind,
    pub label: String,
    pub api_key: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("label", &self.label)
            .field("api_key", &mask_key(&self.api_key))
            .finish()
    }
}

/// Keep the last four characters, hide the rest.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub prompt: &'a str,
    pub model: &'a str,
    pub credential: &'a Credential,
    pub web_search: bool,
    pub schema: Option<&'a Value>,
}

pub trait CompletionClient {
    /// Raw completion text for one (credential, model) attempt.
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String>;
}

/// Dispatches on the credential's provider.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String> {
        let text = match request.credential.provider {
            ProviderKind::Gemini => self.complete_gemini(request).await?,
            ProviderKind::OpenAI => self.complete_openai(request).await?,
        };
        if text.trim().is_empty() {
            return Err(anyhow!("Empty response from {}", request.model));
        }
        Ok(text)
    }
}

async fn check_status(response: reqwest::Response, api: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    Err(anyhow!("{} API request failed with status {}: {}", api, status, error_text))
}

// --- Gemini provider ---

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

fn gemini_request(request: &CompletionRequest<'_>) -> GeminiRequest {
    let tools = if request.web_search {
        vec![serde_json::json!({ "google_search": {} })]
    } else {
        Vec::new()
    };
    // Grounded calls cannot also carry a response schema; the caller extracts JSON from text.
    let schema = request.schema.filter(|_| !request.web_search).cloned();
    GeminiRequest {
        contents: vec![GeminiContent {
            parts: vec![GeminiPart { text: request.prompt.to_string() }],
        }],
        tools,
        generation_config: GeminiGenerationConfig {
            temperature: 0.1,
            response_mime_type: schema.as_ref().map(|_| "application/json".to_string()),
            response_schema: schema,
        },
    }
}

fn gemini_text(response: GeminiResponse) -> Result<String> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No candidates in Gemini API response"))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    Ok(text)
}

impl HttpCompletionClient {
    async fn complete_gemini(&self, request: &CompletionRequest<'_>) -> Result<String> {
        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, request.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &request.credential.api_key)
            .json(&gemini_request(request))
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        let api_response: GeminiResponse = check_status(response, "Gemini")
            .await?
            .json()
            .await
            .context("Failed to parse Gemini API response")?;
        gemini_text(api_response)
    }
}

// --- OpenAI provider (Responses API) ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/responses";

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    input: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    output: Vec<OpenAIOutputItem>,
}

#[derive(Debug, Deserialize)]
struct OpenAIOutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Vec<OpenAIContentBlock>,
}

#[derive(Debug, Deserialize)]
struct OpenAIContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

fn openai_request(request: &CompletionRequest<'_>) -> OpenAIRequest {
    let (tools, tool_choice) = if request.web_search {
        (vec![serde_json::json!({ "type": "web_search" })], Some("auto".to_string()))
    } else {
        (Vec::new(), None)
    };
    let text = request.schema.map(|schema| {
        serde_json::json!({
            "format": {
                "type": "json_schema",
                "name": "sector_analysis",
                "schema": schema,
                "strict": false,
            }
        })
    });
    OpenAIRequest {
        model: request.model.to_string(),
        input: request.prompt.to_string(),
        tools,
        tool_choice,
        text,
    }
}

fn openai_text(response: OpenAIResponse) -> String {
    let searched = response.output.iter().any(|item| item.item_type == "web_search_call");
    tracing::debug!(web_search_used = searched, "openai response");
    response
        .output
        .into_iter()
        .filter(|item| item.item_type == "message")
        .flat_map(|item| item.content)
        .filter(|block| block.block_type == "output_text")
        .map(|block| block.text)
        .collect()
}

impl HttpCompletionClient {
    async fn complete_openai(&self, request: &CompletionRequest<'_>) -> Result<String> {
        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", request.credential.api_key))
            .json(&openai_request(request))
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        let api_response: OpenAIResponse = check_status(response, "OpenAI")
            .await?
            .json()
            .await
            .context("Failed to parse OpenAI API response")?;
        Ok(openai_text(api_response))
    }
}

/// JSON payload from a model reply: a fenced ```json block, else the outermost braces.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credential(provider: ProviderKind) -> Credential {
        Credential {
            provider,
            label: format!("{}#1", provider),
            api_key: "sk-secret-1234".to_string(),
        }
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-secret-1234"), "**********1234");
        assert_eq!(mask_key("abc"), "***");
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn test_credential_debug_hides_key() {
        let debug = format!("{:?}", credential(ProviderKind::Gemini));
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("gemini#1"));
    }

    #[test]
    fn test_provider_kind_serde() {
        assert_eq!(serde_json::to_value(ProviderKind::OpenAI).unwrap(), json!("openai"));
        let kind: ProviderKind = serde_json::from_value(json!("gemini")).unwrap();
        assert_eq!(kind, ProviderKind::Gemini);
        assert!(!ProviderKind::Gemini.default_models().is_empty());
    }

    #[test]
    fn test_gemini_request_grounded() {
        let cred = credential(ProviderKind::Gemini);
        let schema = json!({"type": "object"});
        let request = CompletionRequest {
            prompt: "Analyze",
            model: "gemini-2.0-flash",
            credential: &cred,
            web_search: true,
            schema: Some(&schema),
        };
        let body = serde_json::to_value(gemini_request(&request)).unwrap();
        assert_eq!(body["tools"], json!([{"google_search": {}}]));
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Analyze");
        assert!(body["generationConfig"].get("responseSchema").is_none());

        let ungrounded = CompletionRequest { web_search: false, ..request };
        let body = serde_json::to_value(gemini_request(&ungrounded)).unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseSchema"], schema);
    }

    #[test]
    fn test_gemini_text_joins_parts() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "A90,"}, {"text": "K70"}]}}]
        }))
        .unwrap();
        assert_eq!(gemini_text(response).unwrap(), "A90,K70");

        let empty: GeminiResponse = serde_json::from_value(json!({})).unwrap();
        assert!(gemini_text(empty).is_err());
    }

    #[test]
    fn test_openai_request_shape() {
        let cred = credential(ProviderKind::OpenAI);
        let schema = json!({"type": "object"});
        let request = CompletionRequest {
            prompt: "Analyze",
            model: "gpt-4o-mini",
            credential: &cred,
            web_search: true,
            schema: Some(&schema),
        };
        let body = serde_json::to_value(openai_request(&request)).unwrap();
        assert_eq!(body["tools"], json!([{"type": "web_search"}]));
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["text"]["format"]["type"], "json_schema");
        assert_eq!(body["text"]["format"]["schema"], schema);
    }

    #[test]
    fn test_openai_text_skips_tool_calls() {
        let response: OpenAIResponse = serde_json::from_value(json!({
            "output": [
                {"type": "web_search_call", "id": "ws_1", "status": "completed"},
                {"type": "message", "content": [{"type": "output_text", "text": "H90, L75"}]}
            ]
        }))
        .unwrap();
        assert_eq!(openai_text(response), "H90, L75");
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("Result: {\"sectors\": []} done"), Some("{\"sectors\": []}"));
        assert_eq!(extract_json("no json here"), None);
    }
}
