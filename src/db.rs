use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection, Transaction, TransactionBehavior};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::backend::Backend;
use crate::like::DeviceId;
use crate::models::{
    validate_rows, CompanyRecord, LeaderboardRow, LikeOutcome, RawCompanyRow, RawLeaderboardRow,
    prefecture_of, PREFECTURES,
};
use crate::query::CompiledQuery;
use crate::sector::SectorCode;

const COMPANY_COLUMNS: &str = "id, office_type, reg_number, reg_date, company_name, zipcode, address, \
     phone, representative, branch_name, branch_zipcode, branch_address, support_legal, \
     support_optional, support_start_date, language, note, total_likes, tags";

const SECTOR_COLUMNS: [&str; 12] = [
    "ssw_a", "ssw_b", "ssw_c", "ssw_d", "ssw_e", "ssw_f", "ssw_g", "ssw_h", "ssw_i", "ssw_j",
    "ssw_k", "ssw_l",
];

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn, path: PathBuf::from(":memory:") };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "tsk-finder") {
            Ok(proj_dirs.data_dir().join("tsk.db"))
        } else {
            Ok(PathBuf::from("tsk.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY,
                office_type TEXT NOT NULL DEFAULT 'Head Office',
                reg_number TEXT NOT NULL UNIQUE,
                reg_date TEXT,
                company_name TEXT NOT NULL,
                zipcode TEXT,
                address TEXT,
                phone TEXT,
                representative TEXT,
                branch_name TEXT,
                branch_zipcode TEXT,
                branch_address TEXT,
                support_legal TEXT,
                support_optional TEXT,
                support_start_date TEXT,
                language TEXT,
                note TEXT,
                total_likes INTEGER NOT NULL DEFAULT 0 CHECK (total_likes >= 0),
                tags TEXT
            );

            CREATE TABLE IF NOT EXISTS company_likes (
                device_id TEXT NOT NULL,
                company_id INTEGER NOT NULL REFERENCES companies(id),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (device_id, company_id)
            );

            CREATE TABLE IF NOT EXISTS leaderboard_data (
                prefecture TEXT PRIMARY KEY,
                total_tsk INTEGER NOT NULL DEFAULT 0,
                total_tags_analyzed INTEGER NOT NULL DEFAULT 0,
                ssw_a INTEGER NOT NULL DEFAULT 0,
                ssw_b INTEGER NOT NULL DEFAULT 0,
                ssw_c INTEGER NOT NULL DEFAULT 0,
                ssw_d INTEGER NOT NULL DEFAULT 0,
                ssw_e INTEGER NOT NULL DEFAULT 0,
                ssw_f INTEGER NOT NULL DEFAULT 0,
                ssw_g INTEGER NOT NULL DEFAULT 0,
                ssw_h INTEGER NOT NULL DEFAULT 0,
                ssw_i INTEGER NOT NULL DEFAULT 0,
                ssw_j INTEGER NOT NULL DEFAULT 0,
                ssw_k INTEGER NOT NULL DEFAULT 0,
                ssw_l INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_companies_likes ON companies(total_likes);
            CREATE INDEX IF NOT EXISTS idx_companies_start ON companies(support_start_date);
            CREATE INDEX IF NOT EXISTS idx_likes_company ON company_likes(company_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='companies'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'tsk-finder init' first."));
        }
        Ok(())
    }

    // --- Company operations ---

    /// Insert or refresh a company by registration number. Likes and tags are kept on refresh.
    pub fn upsert_company(&self, company: &CompanyRecord) -> Result<()> {
        let raw = RawCompanyRow::from_record(company);
        self.conn.execute(
            "INSERT INTO companies (id, office_type, reg_number, reg_date, company_name, zipcode,
                 address, phone, representative, branch_name, branch_zipcode, branch_address,
                 support_legal, support_optional, support_start_date, language, note, total_likes, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(reg_number) DO UPDATE SET
                 office_type = excluded.office_type,
                 reg_date = excluded.reg_date,
                 company_name = excluded.company_name,
                 zipcode = excluded.zipcode,
                 address = excluded.address,
                 phone = excluded.phone,
                 representative = excluded.representative,
                 branch_name = excluded.branch_name,
                 branch_zipcode = excluded.branch_zipcode,
                 branch_address = excluded.branch_address,
                 support_legal = excluded.support_legal,
                 support_optional = excluded.support_optional,
                 support_start_date = excluded.support_start_date,
                 language = excluded.language,
                 note = excluded.note",
            params![
                company.id,
                raw.office_type,
                raw.reg_number,
                raw.reg_date,
                raw.company_name,
                raw.zipcode,
                raw.address,
                raw.phone,
                raw.representative,
                raw.branch_name,
                raw.branch_zipcode,
                raw.branch_address,
                raw.support_legal,
                raw.support_optional,
                raw.support_start_date,
                raw.language,
                raw.note,
                company.total_likes,
                raw.tags,
            ],
        )?;
        Ok(())
    }

    pub fn count_companies(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn find_companies(&self, query: &CompiledQuery) -> Result<(Vec<CompanyRecord>, u64)> {
        let sql = query.to_sql();

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM companies WHERE {}", sql.where_clause),
            params_from_iter(sql.params.iter()),
            |row| row.get(0),
        )?;

        let select = format!(
            "SELECT {} FROM companies WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
            COMPANY_COLUMNS, sql.where_clause, sql.order_clause, sql.limit, sql.offset
        );
        let records = self.select_companies(&select, params_from_iter(sql.params.iter()))?;
        Ok((records, total as u64))
    }

    pub fn company_by_id(&self, id: i64) -> Result<Option<CompanyRecord>> {
        let sql = format!("SELECT {} FROM companies WHERE id = ?1", COMPANY_COLUMNS);
        Ok(self.select_companies(&sql, [id])?.into_iter().next())
    }

    pub fn top_liked_companies(&self, limit: usize) -> Result<Vec<CompanyRecord>> {
        let sql = format!(
            "SELECT {} FROM companies ORDER BY total_likes DESC, id ASC LIMIT ?1",
            COMPANY_COLUMNS
        );
        self.select_companies(&sql, [limit as i64])
    }

    pub fn all_companies(&self) -> Result<Vec<CompanyRecord>> {
        let sql = format!("SELECT {} FROM companies ORDER BY id", COMPANY_COLUMNS);
        self.select_companies(&sql, [])
    }

    /// Companies never classified, lowest id first.
    pub fn untagged_companies(&self, limit: usize) -> Result<Vec<CompanyRecord>> {
        let sql = format!(
            "SELECT {} FROM companies WHERE tags IS NULL OR tags = '' ORDER BY id LIMIT ?1",
            COMPANY_COLUMNS
        );
        self.select_companies(&sql, [limit as i64])
    }

    pub fn set_tags(&self, company_id: i64, tags: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE companies SET tags = ?1 WHERE id = ?2",
            params![tags, company_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("Company #{} not found", company_id));
        }
        Ok(())
    }

    fn select_companies<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<CompanyRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, Self::row_to_raw_company)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read companies")?;
        Ok(validate_rows(rows, "company"))
    }

    fn row_to_raw_company(row: &rusqlite::Row) -> rusqlite::Result<RawCompanyRow> {
        Ok(RawCompanyRow {
            id: Some(Value::from(row.get::<_, i64>(0)?)),
            office_type: row.get(1)?,
            reg_number: row.get(2)?,
            reg_date: row.get(3)?,
            company_name: row.get(4)?,
            zipcode: row.get(5)?,
            address: row.get(6)?,
            phone: row.get(7)?,
            representative: row.get(8)?,
            branch_name: row.get(9)?,
            branch_zipcode: row.get(10)?,
            branch_address: row.get(11)?,
            support_legal: row.get(12)?,
            support_optional: row.get(13)?,
            support_start_date: row.get(14)?,
            language: row.get(15)?,
            note: row.get(16)?,
            total_likes: Some(Value::from(row.get::<_, i64>(17)?)),
            tags: row.get(18)?,
        })
    }

    // --- Like operations ---

    /// Flip the membership row and adjust the counter inside one write transaction.
    pub fn toggle_like_atomic(&self, device: &DeviceId, company_id: i64) -> Result<LikeOutcome> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM companies WHERE id = ?1",
            [company_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(anyhow!("Company #{} not found", company_id));
        }

        let removed = tx.execute(
            "DELETE FROM company_likes WHERE device_id = ?1 AND company_id = ?2",
            params![device.as_str(), company_id],
        )?;
        let liked = removed == 0;
        if liked {
            tx.execute(
                "INSERT INTO company_likes (device_id, company_id) VALUES (?1, ?2)",
                params![device.as_str(), company_id],
            )?;
            tx.execute(
                "UPDATE companies SET total_likes = total_likes + 1 WHERE id = ?1",
                [company_id],
            )?;
        } else {
            tx.execute(
                "UPDATE companies SET total_likes = MAX(total_likes - 1, 0) WHERE id = ?1",
                [company_id],
            )?;
        }

        let total: i64 = tx.query_row(
            "SELECT total_likes FROM companies WHERE id = ?1",
            [company_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(LikeOutcome { liked, total })
    }

    pub fn liked_company_ids(&self, device: &DeviceId, company_ids: &[i64]) -> Result<HashSet<i64>> {
        if company_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = (0..company_ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT company_id FROM company_likes WHERE device_id = ?1 AND company_id IN ({})",
            placeholders
        );

        let mut values: Vec<rusqlite::types::Value> = vec![device.as_str().to_string().into()];
        values.extend(company_ids.iter().map(|id| rusqlite::types::Value::from(*id)));

        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, i64>(0))?
            .collect::<Result<HashSet<_>, _>>()
            .context("Failed to read likes")?;
        Ok(ids)
    }

    // --- Leaderboard ---

    pub fn leaderboard_rows(&self) -> Result<Vec<LeaderboardRow>> {
        let sql = format!(
            "SELECT prefecture, total_tsk, total_tags_analyzed, {} FROM leaderboard_data
             ORDER BY total_tsk DESC, prefecture ASC",
            SECTOR_COLUMNS.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawLeaderboardRow {
                    prefecture: row.get(0)?,
                    total_tsk: row.get(1)?,
                    total_tags_analyzed: row.get(2)?,
                    ssw_a: row.get(3)?,
                    ssw_b: row.get(4)?,
                    ssw_c: row.get(5)?,
                    ssw_d: row.get(6)?,
                    ssw_e: row.get(7)?,
                    ssw_f: row.get(8)?,
                    ssw_g: row.get(9)?,
                    ssw_h: row.get(10)?,
                    ssw_i: row.get(11)?,
                    ssw_j: row.get(12)?,
                    ssw_k: row.get(13)?,
                    ssw_l: row.get(14)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read leaderboard")?;
        Ok(validate_rows(rows, "leaderboard"))
    }

    /// Recompute the per-prefecture snapshot from the companies table.
    pub fn refresh_leaderboard(&self) -> Result<usize> {
        let rows = compute_leaderboard(&self.all_companies()?);

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM leaderboard_data", [])?;
        let insert = format!(
            "INSERT INTO leaderboard_data (prefecture, total_tsk, total_tags_analyzed, {})
             VALUES (?1, ?2, ?3, {})",
            SECTOR_COLUMNS.join(", "),
            (4..16).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
        );
        for row in &rows {
            let mut values: Vec<rusqlite::types::Value> = vec![
                row.prefecture.clone().into(),
                row.total_companies.into(),
                row.total_analyzed.into(),
            ];
            values.extend(row.sector_counts.iter().map(|c| rusqlite::types::Value::from(*c)));
            tx.execute(&insert, params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

/// One row per prefecture. Each company counts once, under the prefecture of its display address.
pub fn compute_leaderboard(companies: &[CompanyRecord]) -> Vec<LeaderboardRow> {
    let mut rows: Vec<LeaderboardRow> = PREFECTURES
        .iter()
        .map(|(prefecture, _)| LeaderboardRow {
            prefecture: prefecture.to_string(),
            total_companies: 0,
            total_analyzed: 0,
            sector_counts: [0; 12],
        })
        .collect();

    for company in companies {
        let Some(prefecture) = prefecture_of(company.display_address()) else {
            tracing::debug!(company_id = company.id, "no prefecture in address");
            continue;
        };
        let Some(row) = rows.iter_mut().find(|r| r.prefecture == prefecture) else {
            continue;
        };
        row.total_companies += 1;
        let tags = company.tag_set();
        if !tags.is_empty() {
            row.total_analyzed += 1;
        }
        for code in SectorCode::ALL {
            if tags.contains(code) {
                row.sector_counts[code.index()] += 1;
            }
        }
    }
    rows
}

impl Backend for Database {
    async fn search(&self, query: &CompiledQuery) -> Result<(Vec<CompanyRecord>, u64)> {
        self.find_companies(query)
    }

    async fn toggle_like(&self, device: &DeviceId, company_id: i64) -> Result<LikeOutcome> {
        self.toggle_like_atomic(device, company_id)
    }

    async fn liked_ids(&self, device: &DeviceId, company_ids: &[i64]) -> Result<HashSet<i64>> {
        self.liked_company_ids(device, company_ids)
    }

    async fn update_tags(&self, company_id: i64, tags: &str) -> Result<()> {
        self.set_tags(company_id, tags)
    }

    async fn get_company(&self, company_id: i64) -> Result<Option<CompanyRecord>> {
        self.company_by_id(company_id)
    }

    async fn leaderboard(&self) -> Result<Vec<LeaderboardRow>> {
        self.leaderboard_rows()
    }

    async fn top_liked(&self, limit: usize) -> Result<Vec<CompanyRecord>> {
        self.top_liked_companies(limit)
    }
}
