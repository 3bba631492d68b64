use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::backend::Backend;
use crate::models::CompanyRecord;

// --- Device identity ---

/// Opaque per-browser token. Not an identity proof, only "this installation".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Random version-4 UUID string.
    pub fn generate() -> Self {
        let mut bytes: [u8; 16] = rand::thread_rng().r#gen();
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        DeviceId(format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        ))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(anyhow!("Invalid device id: {:?}", raw));
        }
        Ok(DeviceId(trimmed.to_string()))
    }

    /// Read the persisted token, creating and saving a new one on first use.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read device id file: {}", path.display()))?;
            if let Ok(id) = Self::parse(&raw) {
                return Ok(id);
            }
            tracing::warn!(path = %path.display(), "device id file is corrupt, issuing a new id");
        }

        let id = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &id.0)
            .with_context(|| format!("Failed to write device id file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "created new device id");
        Ok(id)
    }

    pub fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "tsk-finder") {
            Ok(proj_dirs.data_dir().join("device_id"))
        } else {
            Ok(PathBuf::from("device_id"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Like toggle (client side) ---

/// Local like state for one company card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeButton {
    pub company_id: i64,
    pub liked: bool,
    pub count: i64,
}

impl LikeButton {
    pub fn new(company_id: i64, liked: bool, count: i64) -> Self {
        Self { company_id, liked, count }
    }

    pub fn for_company(company: &CompanyRecord, liked_ids: &HashSet<i64>) -> Self {
        Self::new(company.id, liked_ids.contains(&company.id), company.total_likes)
    }

    /// Optimistically flip, then settle on the server's answer or roll back.
    /// Returns whether the server accepted the toggle.
    pub async fn click<B: Backend>(&mut self, backend: &B, device: &DeviceId) -> bool {
        let before = *self;

        self.liked = !before.liked;
        self.count = if before.liked { (before.count - 1).max(0) } else { before.count + 1 };

        match backend.toggle_like(device, self.company_id).await {
            Ok(outcome) => {
                self.liked = outcome.liked;
                self.count = outcome.total;
                true
            }
            Err(e) => {
                tracing::warn!(company_id = self.company_id, error = %e, "like toggle failed, reverting");
                *self = before;
                false
            }
        }
    }
}

/// Liked ids among the visible records. A failed lookup shows nothing as liked.
pub async fn liked_on_page<B: Backend>(
    backend: &B,
    device: &DeviceId,
    records: &[CompanyRecord],
) -> HashSet<i64> {
    if records.is_empty() {
        return HashSet::new();
    }
    let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
    match backend.liked_ids(device, &ids).await {
        Ok(liked) => liked,
        Err(e) => {
            tracing::warn!(error = %e, "could not load liked state");
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MemoryBackend;
    use crate::models::tests::company;
    use tempfile::tempdir;

    fn backend_with_likes(total_likes: i64) -> MemoryBackend {
        let mut c = company(1, "Sakura", "Tokyo");
        c.total_likes = total_likes;
        MemoryBackend::with_companies(vec![c])
    }

    #[test]
    fn test_generate_format_and_uniqueness() {
        let a = DeviceId::generate();
        let b = DeviceId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert_eq!(a.as_str().chars().nth(14), Some('4'));
        assert_eq!(a.as_str().matches('-').count(), 4);
    }

    #[test]
    fn test_load_or_create_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("device_id");

        let first = DeviceId::load_or_create(&path).unwrap();
        let second = DeviceId::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first.as_str());
    }

    #[test]
    fn test_load_or_create_replaces_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_id");
        std::fs::write(&path, "   \n").unwrap();

        let id = DeviceId::load_or_create(&path).unwrap();
        assert_eq!(DeviceId::load_or_create(&path).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_blank() {
        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse("two words").is_err());
        assert_eq!(DeviceId::parse(" abc\n").unwrap().as_str(), "abc");
    }

    #[tokio::test]
    async fn test_click_settles_on_server_state() {
        let backend = backend_with_likes(41);
        let device = DeviceId::generate();
        let mut button = LikeButton::new(1, false, 41);

        assert!(button.click(&backend, &device).await);
        assert_eq!(button, LikeButton::new(1, true, 42));

        assert!(button.click(&backend, &device).await);
        assert_eq!(button, LikeButton::new(1, false, 41));
    }

    #[tokio::test]
    async fn test_click_overwrites_stale_local_count() {
        // Another device liked in the meantime; the server total wins.
        let backend = backend_with_likes(10);
        let device = DeviceId::generate();
        let mut button = LikeButton::new(1, false, 7);

        button.click(&backend, &device).await;
        assert_eq!(button, LikeButton::new(1, true, 11));
    }

    #[tokio::test]
    async fn test_click_reverts_on_failure_from_both_states() {
        let backend = backend_with_likes(5);
        backend.fail_toggle.set(true);
        let device = DeviceId::generate();

        for start in [LikeButton::new(1, false, 5), LikeButton::new(1, true, 5)] {
            let mut button = start;
            assert!(!button.click(&backend, &device).await);
            assert_eq!(button, start);
        }
        assert_eq!(backend.companies.borrow()[0].total_likes, 5);
    }

    #[tokio::test]
    async fn test_two_devices_share_counter() {
        let backend = backend_with_likes(0);
        let (alice, bob) = (DeviceId::generate(), DeviceId::generate());

        let mut a = LikeButton::new(1, false, 0);
        let mut b = LikeButton::new(1, false, 0);
        a.click(&backend, &alice).await;
        b.click(&backend, &bob).await;
        assert_eq!(b, LikeButton::new(1, true, 2));

        a.click(&backend, &alice).await;
        assert_eq!(a, LikeButton::new(1, false, 1));
    }

    #[tokio::test]
    async fn test_liked_on_page_degrades_to_empty() {
        let backend = backend_with_likes(0);
        let device = DeviceId::generate();
        let records = backend.companies.borrow().clone();

        LikeButton::new(1, false, 0).click(&backend, &device).await;
        assert!(liked_on_page(&backend, &device, &records).await.contains(&1));

        backend.fail_liked_ids.set(true);
        assert!(liked_on_page(&backend, &device, &records).await.is_empty());

        let button = LikeButton::for_company(&records[0], &HashSet::from([1]));
        assert!(button.liked);
    }
}
