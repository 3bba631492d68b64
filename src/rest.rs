use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::backend::Backend;
use crate::like::DeviceId;
use crate::models::{
    validate_json_rows, CompanyRecord, LeaderboardRow, LikeOutcome, RawCompanyRow, RawLeaderboardRow,
};
use crate::query::CompiledQuery;

const COMPANY_TABLE: &str = "tsk_id";
const LIKES_TABLE: &str = "tsk_likes";
const LEADERBOARD_TABLE: &str = "leaderboard_data";
const TOGGLE_RPC: &str = "toggle_tsk_like";

/// Hosted PostgREST store.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    auth: HeaderMap,
    base_url: String,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(anyhow!("Backend URL is empty. Set TSK_BACKEND_URL or backend.url in the config."));
        }
        if api_key.trim().is_empty() {
            return Err(anyhow!("Backend key is empty. Set TSK_BACKEND_KEY or backend.api_key in the config."));
        }

        let mut auth = HeaderMap::new();
        auth.insert("apikey", HeaderValue::from_str(api_key).context("Invalid backend key")?);
        auth.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).context("Invalid backend key")?,
        );
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Request builder carrying the project key headers.
    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client.request(method, url).headers(self.auth.clone())
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc_url(&self, name: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, name)
    }

    fn search_request(&self, query: &CompiledQuery) -> Result<reqwest::Request> {
        self.request(Method::GET, self.table_url(COMPANY_TABLE))
            .query(&query.to_postgrest())
            .header("Prefer", "count=exact")
            .build()
            .context("Failed to build search request")
    }

    fn liked_ids_request(&self, device: &DeviceId, company_ids: &[i64]) -> Result<reqwest::Request> {
        let ids = company_ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        self.request(Method::GET, self.table_url(LIKES_TABLE))
            .query(&[
                ("select", "tsk_id".to_string()),
                ("device_id", format!("eq.{}", device)),
                ("tsk_id", format!("in.({})", ids)),
            ])
            .build()
            .context("Failed to build likes request")
    }

    async fn fetch_companies(&self, pairs: &[(&str, String)]) -> Result<Vec<CompanyRecord>> {
        let response = self
            .request(Method::GET, self.table_url(COMPANY_TABLE))
            .query(pairs)
            .send()
            .await
            .context("Failed to reach backend")?;
        let rows: Vec<Value> = check_status(response, COMPANY_TABLE)
            .await?
            .json()
            .await
            .context("Failed to parse company rows")?;
        Ok(validate_json_rows::<RawCompanyRow, _>(rows, "company"))
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    Err(anyhow!("{} request failed with status {}: {}", what, status, error_text))
}

/// Total from a PostgREST `Content-Range` header such as `0-19/45` or `*/0`.
fn parse_content_range(value: &str) -> Result<u64> {
    let (_, total) = value
        .rsplit_once('/')
        .ok_or_else(|| anyhow!("Malformed Content-Range: {:?}", value))?;
    total
        .trim()
        .parse::<u64>()
        .with_context(|| format!("Content-Range has no exact count: {:?}", value))
}

#[derive(Debug, Deserialize)]
struct LikeRow {
    tsk_id: i64,
}

impl Backend for RestBackend {
    async fn search(&self, query: &CompiledQuery) -> Result<(Vec<CompanyRecord>, u64)> {
        let request = self.search_request(query)?;
        let response = self
            .client
            .execute(request)
            .await
            .context("Failed to reach backend")?;
        let response = check_status(response, COMPANY_TABLE).await?;

        let range = response
            .headers()
            .get(CONTENT_RANGE)
            .ok_or_else(|| anyhow!("Search response carries no Content-Range header"))?
            .to_str()
            .context("Content-Range is not text")?
            .to_string();
        let total = parse_content_range(&range)?;

        let rows: Vec<Value> = response.json().await.context("Failed to parse company rows")?;
        Ok((validate_json_rows::<RawCompanyRow, _>(rows, "company"), total))
    }

    async fn toggle_like(&self, device: &DeviceId, company_id: i64) -> Result<LikeOutcome> {
        let response = self
            .request(Method::POST, self.rpc_url(TOGGLE_RPC))
            .json(&json!({
                "target_tsk_id": company_id,
                "user_device_id": device.as_str(),
            }))
            .send()
            .await
            .context("Failed to reach backend")?;
        check_status(response, TOGGLE_RPC)
            .await?
            .json::<LikeOutcome>()
            .await
            .context("Unexpected toggle_tsk_like response")
    }

    async fn liked_ids(&self, device: &DeviceId, company_ids: &[i64]) -> Result<HashSet<i64>> {
        if company_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let request = self.liked_ids_request(device, company_ids)?;
        let response = self
            .client
            .execute(request)
            .await
            .context("Failed to reach backend")?;
        let rows: Vec<LikeRow> = check_status(response, LIKES_TABLE)
            .await?
            .json()
            .await
            .context("Failed to parse like rows")?;
        Ok(rows.into_iter().map(|r| r.tsk_id).collect())
    }

    async fn update_tags(&self, company_id: i64, tags: &str) -> Result<()> {
        let response = self
            .request(Method::PATCH, self.table_url(COMPANY_TABLE))
            .query(&[("id", format!("eq.{}", company_id))])
            .header("Prefer", "return=minimal")
            .json(&json!({ "tags": tags }))
            .send()
            .await
            .context("Failed to reach backend")?;
        check_status(response, COMPANY_TABLE).await?;
        Ok(())
    }

    async fn get_company(&self, company_id: i64) -> Result<Option<CompanyRecord>> {
        let records = self
            .fetch_companies(&[
                ("select", "*".to_string()),
                ("id", format!("eq.{}", company_id)),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(records.into_iter().next())
    }

    async fn leaderboard(&self) -> Result<Vec<LeaderboardRow>> {
        let response = self
            .request(Method::GET, self.table_url(LEADERBOARD_TABLE))
            .query(&[("select", "*"), ("order", "total_tsk.desc")])
            .send()
            .await
            .context("Failed to reach backend")?;
        let rows: Vec<Value> = check_status(response, LEADERBOARD_TABLE)
            .await?
            .json()
            .await
            .context("Failed to parse leaderboard rows")?;
        Ok(validate_json_rows::<RawLeaderboardRow, _>(rows, "leaderboard"))
    }

    async fn top_liked(&self, limit: usize) -> Result<Vec<CompanyRecord>> {
        self.fetch_companies(&[
            ("select", "*".to_string()),
            ("order", "total_likes.desc,id.asc".to_string()),
            ("limit", limit.to_string()),
        ])
        .await
    }
}
