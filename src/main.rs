mod ai;
mod analytics;
mod backend;
mod classifier;
mod config;
mod db;
mod email;
mod like;
mod models;
mod query;
mod rest;
mod sector;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use ai::HttpCompletionClient;
use backend::Backend;
use classifier::{AttemptOutcome, Classifier};
use config::{BackendKind, Config};
use db::Database;
use email::ApplicantProfile;
use like::{DeviceId, LikeButton};
use models::{
    find_language, find_prefecture, CompanyRecord, DateSort, LanguageState, LeaderboardRow,
    LikeOutcome, RawCompanyRow, SearchFilters, LANGUAGES,
};
use query::CompiledQuery;
use rest::RestBackend;

#[derive(Parser)]
#[command(name = "tsk-finder")]
#[command(about = "Search Japan's Registered Support Organizations and tag them by SSW sector")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the local database
    Init,

    /// Import company rows from a JSON array into the local database
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },

    /// Search the directory
    Search {
        /// Text matched against names and addresses
        #[arg(short, long, default_value = "")]
        query: String,

        /// Prefecture (repeatable)
        #[arg(short, long = "prefecture")]
        prefectures: Vec<String>,

        /// Supported language to require (repeatable)
        #[arg(short, long = "language")]
        languages: Vec<String>,

        /// Supported language to exclude (repeatable)
        #[arg(short = 'x', long = "exclude-language")]
        exclude: Vec<String>,

        /// Only organizations offering mandatory (legal) support
        #[arg(long)]
        legal: bool,

        /// Only organizations offering optional support
        #[arg(long)]
        optional: bool,

        /// Sort by support start date instead of likes
        #[arg(long, value_enum)]
        sort: Option<DateSort>,

        /// Page number, starting at 1
        #[arg(long, default_value_t = 1)]
        page: u32,
    },

    /// Show one organization
    Show {
        /// Company ID
        id: i64,
    },

    /// Like or unlike an organization from this device
    Like {
        /// Company ID
        id: i64,
    },

    /// Classify an organization's sectors with AI web search
    Classify {
        /// Company ID
        id: i64,

        /// Do not save the resulting tags
        #[arg(long)]
        no_write: bool,
    },

    /// Classify organizations that have no sector tags yet (local database)
    TagPending {
        /// Maximum number of organizations to classify
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show per-prefecture and per-sector statistics
    Analytics,

    /// Manage the precomputed leaderboard
    Leaderboard {
        #[command(subcommand)]
        command: LeaderboardCommands,
    },

    /// Generate a Japanese application email for an organization
    Email {
        /// Company ID
        id: i64,

        /// Applicant profile JSON
        #[arg(short, long)]
        profile: PathBuf,
    },

    /// Show this device's identity token
    Device,

    /// Show the effective configuration (keys masked)
    Config,
}

#[derive(Subcommand)]
enum LeaderboardCommands {
    /// Recompute leaderboard rows from the companies table
    Refresh,
}

// --- Backend selection ---

enum AnyBackend {
    Local(Database),
    Remote(RestBackend),
}

impl Backend for AnyBackend {
    async fn search(&self, query: &CompiledQuery) -> Result<(Vec<CompanyRecord>, u64)> {
        match self {
            AnyBackend::Local(db) => db.search(query).await,
            AnyBackend::Remote(rest) => rest.search(query).await,
        }
    }

    async fn toggle_like(&self, device: &DeviceId, company_id: i64) -> Result<LikeOutcome> {
        match self {
            AnyBackend::Local(db) => db.toggle_like(device, company_id).await,
            AnyBackend::Remote(rest) => rest.toggle_like(device, company_id).await,
        }
    }

    async fn liked_ids(&self, device: &DeviceId, company_ids: &[i64]) -> Result<HashSet<i64>> {
        match self {
            AnyBackend::Local(db) => db.liked_ids(device, company_ids).await,
            AnyBackend::Remote(rest) => rest.liked_ids(device, company_ids).await,
        }
    }

    async fn update_tags(&self, company_id: i64, tags: &str) -> Result<()> {
        match self {
            AnyBackend::Local(db) => db.update_tags(company_id, tags).await,
            AnyBackend::Remote(rest) => rest.update_tags(company_id, tags).await,
        }
    }

    async fn get_company(&self, company_id: i64) -> Result<Option<CompanyRecord>> {
        match self {
            AnyBackend::Local(db) => db.get_company(company_id).await,
            AnyBackend::Remote(rest) => rest.get_company(company_id).await,
        }
    }

    async fn leaderboard(&self) -> Result<Vec<LeaderboardRow>> {
        match self {
            AnyBackend::Local(db) => db.leaderboard().await,
            AnyBackend::Remote(rest) => rest.leaderboard().await,
        }
    }

    async fn top_liked(&self, limit: usize) -> Result<Vec<CompanyRecord>> {
        match self {
            AnyBackend::Local(db) => db.top_liked(limit).await,
            AnyBackend::Remote(rest) => rest.top_liked(limit).await,
        }
    }
}

fn local_db_path(config: &Config) -> Result<PathBuf> {
    match &config.backend.db_path {
        Some(path) => Ok(path.clone()),
        None => Database::default_path(),
    }
}

fn open_local(config: &Config) -> Result<Database> {
    let db = Database::open(&local_db_path(config)?)?;
    db.ensure_initialized()?;
    Ok(db)
}

fn open_backend(config: &Config) -> Result<AnyBackend> {
    match config.backend.kind {
        BackendKind::Sqlite => Ok(AnyBackend::Local(open_local(config)?)),
        BackendKind::Rest => {
            let url = config.backend.url.as_deref().unwrap_or_default();
            let key = config.backend.api_key.as_deref().unwrap_or_default();
            Ok(AnyBackend::Remote(RestBackend::new(url, key)?))
        }
    }
}

async fn require_company<B: Backend>(backend: &B, id: i64) -> Result<CompanyRecord> {
    backend
        .get_company(id)
        .await?
        .ok_or_else(|| anyhow!("Company #{} not found", id))
}

fn build_classifier(config: &Config, config_path: &Path) -> Result<Classifier<HttpCompletionClient>> {
    let classifier_config = config.classifier_config();
    if classifier_config.credentials.is_empty() {
        return Err(anyhow!(
            "No AI keys configured. Set GEMINI_API_KEYS or OPENAI_API_KEY, or add keys to {}",
            config_path.display()
        ));
    }
    Ok(Classifier::new(HttpCompletionClient::new(), classifier_config))
}

fn device() -> Result<DeviceId> {
    DeviceId::load_or_create(&DeviceId::default_path()?)
}

// --- Filters ---

fn build_filters(
    query: String,
    prefectures: &[String],
    languages: &[String],
    exclude: &[String],
    legal: bool,
    optional: bool,
    sort: Option<DateSort>,
) -> Result<SearchFilters> {
    let mut filters = SearchFilters::new(query, legal, optional, sort);

    for p in prefectures {
        let name = find_prefecture(p).ok_or_else(|| anyhow!("Unknown prefecture '{}'", p))?;
        filters.prefectures.insert(name.to_string());
    }

    let lookup = |name: &str| {
        find_language(name).ok_or_else(|| {
            anyhow!("Unknown language '{}'. Available: {}", name, LANGUAGES.join(", "))
        })
    };
    for l in languages {
        filters.set_language_state(lookup(l)?, LanguageState::Included);
    }
    for l in exclude {
        let lang = lookup(l)?;
        if filters.language_state(lang) == LanguageState::Included {
            return Err(anyhow!("'{}' cannot be both required and excluded", lang));
        }
        filters.set_language_state(lang, LanguageState::Excluded);
    }

    Ok(filters)
}

// --- Output ---

fn describe_tags(company: &CompanyRecord) -> String {
    let tags = company.tag_set();
    if tags.is_empty() {
        return "-".to_string();
    }
    tags.tags()
        .iter()
        .map(|t| format!("{} {}%", t.code.label(), t.percent))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_company(company: &CompanyRecord) {
    println!("Company #{}", company.id);
    println!("Name: {}", company.display_name());
    if company.is_branch() {
        println!("Head office: {}", company.company_name);
    }
    println!("Registration: {}", company.reg_number);
    if let Some(date) = company.reg_date {
        println!("Registered: {}", date);
    }
    println!("Address: 〒{} {}", company.display_zipcode(), company.display_address());
    println!("Phone: {}", company.phone);
    println!("Representative: {}", company.representative);
    if let Some(lang) = &company.language {
        println!("Languages: {}", lang);
    }
    println!(
        "Support: legal={} optional={}",
        company.has_legal_support(),
        company.has_optional_support()
    );
    if let Some(start) = company.support_start_date {
        println!("Support since: {}", start);
    }
    println!("Likes: {}", company.total_likes);
    println!("Sectors: {}", describe_tags(company));
    if let Some(note) = &company.note {
        println!("\n--- Note ---\n{}", note);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load_effective(&config_path)?;

    match cli.command {
        Commands::Init => {
            let db = Database::open(&local_db_path(&config)?)?;
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Import { file } => {
            let db = open_local(&config)?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read import file: {}", file.display()))?;
            let rows: Vec<Value> = serde_json::from_str(&raw)
                .with_context(|| format!("Expected a JSON array of rows in {}", file.display()))?;
            let total = rows.len();
            let records: Vec<CompanyRecord> =
                models::validate_json_rows::<RawCompanyRow, _>(rows, "company");
            for record in &records {
                db.upsert_company(record)?;
            }
            println!("Imported {} of {} rows ({} skipped).", records.len(), total, total - records.len());
        }

        Commands::Search {
            query,
            prefectures,
            languages,
            exclude,
            legal,
            optional,
            sort,
            page,
        } => {
            let filters = build_filters(query, &prefectures, &languages, &exclude, legal, optional, sort)?;
            let backend = open_backend(&config)?;
            let result = backend::search(&backend, page, &filters).await?;

            if result.records.is_empty() {
                println!("No organizations found.");
            } else {
                let device = device()?;
                let liked = like::liked_on_page(&backend, &device, &result.records).await;
                println!(
                    "{:<7} {:>6} {:<32} {:<28} {:<12} {:<14}",
                    "ID", "LIKES", "NAME", "ADDRESS", "SINCE", "SECTORS"
                );
                println!("{}", "-".repeat(104));
                for company in &result.records {
                    let likes = format!(
                        "{}{}",
                        if liked.contains(&company.id) { "*" } else { "" },
                        company.total_likes
                    );
                    println!(
                        "{:<7} {:>6} {:<32} {:<28} {:<12} {:<14}",
                        company.id,
                        likes,
                        truncate(company.display_name(), 30),
                        truncate(company.display_address(), 26),
                        company
                            .support_start_date
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        company.tags.as_deref().unwrap_or("-"),
                    );
                }
            }
            println!(
                "\nPage {} of {} ({} matches)",
                result.page,
                result.total_pages().max(1),
                result.total
            );
        }

        Commands::Show { id } => {
            let backend = open_backend(&config)?;
            match backend.get_company(id).await? {
                Some(company) => print_company(&company),
                None => println!("Company #{} not found.", id),
            }
        }

        Commands::Like { id } => {
            let backend = open_backend(&config)?;
            let device = device()?;
            let company = require_company(&backend, id).await?;
            let liked = like::liked_on_page(&backend, &device, std::slice::from_ref(&company)).await;

            let mut button = LikeButton::for_company(&company, &liked);
            if button.click(&backend, &device).await {
                let verb = if button.liked { "Liked" } else { "Unliked" };
                println!("{} '{}' ({} likes)", verb, company.display_name(), button.count);
            } else {
                println!("Could not update like for #{}; nothing changed.", id);
            }
        }

        Commands::Classify { id, no_write } => {
            let backend = open_backend(&config)?;
            let company = require_company(&backend, id).await?;
            let classifier = build_classifier(&config, &config_path)?;

            println!("Investigating '{}'...", company.display_name());
            let result = classifier::investigate(&backend, &classifier, &company, !no_write).await?;

            println!("\n{:<12} {:<8} {:<22} {:<14}", "CREDENTIAL", "PROVIDER", "MODEL", "OUTCOME");
            println!("{}", "-".repeat(60));
            for attempt in &result.attempts {
                let outcome = match &attempt.outcome {
                    AttemptOutcome::Success(tags) => format!("ok {}", tags),
                    AttemptOutcome::NoCandidates => "no sectors".to_string(),
                    AttemptOutcome::Error(e) => format!("error: {}", truncate(e, 40)),
                };
                println!(
                    "{:<12} {:<8} {:<22} {}",
                    attempt.credential,
                    attempt.provider,
                    truncate(&attempt.model, 20),
                    outcome
                );
            }

            if result.tags.is_empty() {
                println!("\nNo sector classification available.");
            } else {
                println!("\nTags: {}", result.tags);
                if result.tags_written {
                    println!("Saved to company #{}.", id);
                } else if !no_write {
                    println!("Tags could not be saved (see log).");
                }
            }
            println!("\nDeep research: {}", result.search_url);
        }

        Commands::TagPending { limit } => {
            if config.backend.kind != BackendKind::Sqlite {
                return Err(anyhow!("tag-pending works on the local database only."));
            }
            let db = open_local(&config)?;
            let classifier = build_classifier(&config, &config_path)?;
            let pending = db.untagged_companies(limit)?;
            if pending.is_empty() {
                println!("Every organization already has sector tags.");
                return Ok(());
            }

            let mut tagged = 0;
            for company in &pending {
                let tags = classifier.classify(company).await;
                if tags.is_empty() {
                    println!("#{:<6} {:<32} no sectors", company.id, truncate(company.display_name(), 30));
                    continue;
                }
                match db.update_tags(company.id, &tags).await {
                    Ok(()) => {
                        tagged += 1;
                        println!("#{:<6} {:<32} {}", company.id, truncate(company.display_name(), 30), tags);
                    }
                    Err(e) => tracing::warn!(company_id = company.id, error = %e, "tag write-back failed"),
                }
            }
            println!("\nTagged {} of {} organizations.", tagged, pending.len());
        }

        Commands::Analytics => {
            let backend = open_backend(&config)?;
            let data = analytics::get_analytics(&backend).await?;

            println!("Organizations: {}", data.overview.total_companies);
            println!(
                "Analyzed:      {} ({:.1}%)",
                data.overview.total_analyzed,
                data.analyzed_ratio() * 100.0
            );
            println!("As of:         {}", data.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));

            println!("\n{:<12} {:>8} {:>9}", "PREFECTURE", "TOTAL", "ANALYZED");
            println!("{}", "-".repeat(31));
            for row in data.rows.iter().filter(|r| r.total_companies > 0) {
                println!("{:<12} {:>8} {:>9}", row.prefecture, row.total_companies, row.total_analyzed);
            }

            println!("\n{:<4} {:<32} {:>8}", "CODE", "SECTOR", "COUNT");
            println!("{}", "-".repeat(46));
            for (code, count) in data.sector_totals() {
                println!("{:<4} {:<32} {:>8}", code.to_string(), code.label(), count);
            }

            if !data.top_liked.is_empty() {
                println!("\nMost liked:");
                for (i, company) in data.top_liked.iter().enumerate() {
                    println!(
                        "  {}. #{} {} ({} likes)",
                        i + 1,
                        company.id,
                        company.display_name(),
                        company.total_likes
                    );
                }
            }
        }

        Commands::Leaderboard { command } => match command {
            LeaderboardCommands::Refresh => {
                if config.backend.kind != BackendKind::Sqlite {
                    return Err(anyhow!(
                        "The hosted backend maintains its own leaderboard; refresh works on the local database only."
                    ));
                }
                let db = open_local(&config)?;
                let rows = db.refresh_leaderboard()?;
                println!("Leaderboard refreshed ({} prefectures).", rows);
            }
        },

        Commands::Email { id, profile } => {
            let applicant = ApplicantProfile::load(&profile)?;
            let backend = open_backend(&config)?;
            let company = require_company(&backend, id).await?;
            println!("{}", applicant.render(&company.company_name)?);
        }

        Commands::Device => {
            let path = DeviceId::default_path()?;
            let device = DeviceId::load_or_create(&path)?;
            println!("{}", device);
            println!("(stored at {})", path.display());
        }

        Commands::Config => {
            println!("# {}", config_path.display());
            println!("{}", serde_json::to_string_pretty(&config.masked())?);
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
