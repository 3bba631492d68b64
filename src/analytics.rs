use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::Backend;
use crate::models::{CompanyRecord, LeaderboardRow};
use crate::sector::SectorCode;

pub const TOP_LIKED_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Overview {
    pub total_companies: i64,
    pub total_analyzed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub overview: Overview,
    pub rows: Vec<LeaderboardRow>,
    pub top_liked: Vec<CompanyRecord>,
    pub timestamp: DateTime<Utc>,
}

pub async fn get_analytics<B: Backend>(backend: &B) -> Result<Analytics> {
    let mut rows = backend.leaderboard().await.context("Failed to load leaderboard")?;
    rows.sort_by(|a, b| {
        b.total_companies
            .cmp(&a.total_companies)
            .then_with(|| a.prefecture.cmp(&b.prefecture))
    });
    let top_liked = backend
        .top_liked(TOP_LIKED_LIMIT)
        .await
        .context("Failed to load most liked companies")?;

    let overview = summarize(&rows);
    tracing::debug!(
        prefectures = rows.len(),
        total = overview.total_companies,
        analyzed = overview.total_analyzed,
        "analytics loaded"
    );

    Ok(Analytics {
        overview,
        rows,
        top_liked,
        timestamp: Utc::now(),
    })
}

pub fn summarize(rows: &[LeaderboardRow]) -> Overview {
    rows.iter().fold(Overview::default(), |acc, row| Overview {
        total_companies: acc.total_companies + row.total_companies,
        total_analyzed: acc.total_analyzed + row.total_analyzed,
    })
}

impl Overview {
    /// Share of companies with tags, 0.0 when there are none.
    pub fn analyzed_ratio(&self) -> f64 {
        if self.total_companies == 0 {
            0.0
        } else {
            self.total_analyzed as f64 / self.total_companies as f64
        }
    }
}

impl Analytics {
    /// National count per sector, largest first.
    pub fn sector_totals(&self) -> Vec<(SectorCode, i64)> {
        let mut totals: Vec<(SectorCode, i64)> = SectorCode::ALL
            .iter()
            .map(|&code| (code, self.rows.iter().map(|r| r.sector_count(code)).sum()))
            .collect();
        totals.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        totals
    }

    pub fn analyzed_ratio(&self) -> f64 {
        self.overview.analyzed_ratio()
    }
}
