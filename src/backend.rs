use anyhow::Result;
use std::collections::HashSet;

use crate::like::DeviceId;
use crate::models::{CompanyRecord, LeaderboardRow, LikeOutcome, SearchFilters};
use crate::query::{self, CompiledQuery};

/// Table-query and remote-procedure primitives of the data store.
pub trait Backend {
    /// Run a compiled search; returns the requested slice and the total match count.
    async fn search(&self, query: &CompiledQuery) -> Result<(Vec<CompanyRecord>, u64)>;

    /// Atomic server-side toggle of the (device, company) like row and `total_likes`.
    async fn toggle_like(&self, device: &DeviceId, company_id: i64) -> Result<LikeOutcome>;

    async fn liked_ids(&self, device: &DeviceId, company_ids: &[i64]) -> Result<HashSet<i64>>;

    async fn update_tags(&self, company_id: i64, tags: &str) -> Result<()>;

    async fn get_company(&self, company_id: i64) -> Result<Option<CompanyRecord>>;

    async fn leaderboard(&self) -> Result<Vec<LeaderboardRow>>;

    async fn top_liked(&self, limit: usize) -> Result<Vec<CompanyRecord>>;
}

#[derive(Debug, Clone)]
pub struct SearchPage {
    pub records: Vec<CompanyRecord>,
    pub total: u64,
    pub page: u32,
}

impl SearchPage {
    pub fn total_pages(&self) -> u64 {
        query::total_pages(self.total)
    }
}

pub async fn search<B: Backend>(backend: &B, page: u32, filters: &SearchFilters) -> Result<SearchPage> {
    let compiled = query::compile(page, filters)?;
    let (records, total) = backend.search(&compiled).await?;
    tracing::debug!(page, total, returned = records.len(), "search");
    Ok(SearchPage { records, total, page })
}
