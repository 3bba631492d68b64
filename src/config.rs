use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ai::{mask_key, Credential, ProviderKind};
use crate::classifier::{ClassifierConfig, OutputMode, DEFAULT_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Rest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub keys: Vec<String>,
    /// Empty means the provider's built-in priority list.
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub threshold: u8,
    pub output_mode: OutputMode,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            output_mode: OutputMode::default(),
            providers: vec![
                ProviderConfig { kind: ProviderKind::Gemini, keys: Vec::new(), models: Vec::new() },
                ProviderConfig { kind: ProviderKind::OpenAI, keys: Vec::new(), models: Vec::new() },
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub classifier: ClassifierSettings,
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "tsk-finder") {
            Ok(proj_dirs.config_dir().join("config.json"))
        } else {
            Ok(PathBuf::from("config.json"))
        }
    }

    /// Read the file if it exists; a missing file means all defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// File settings with environment overrides applied.
    pub fn load_effective(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = var("TSK_BACKEND_URL") {
            self.backend.url = Some(url);
            self.backend.kind = BackendKind::Rest;
        }
        if let Some(key) = var("TSK_BACKEND_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(keys) = var("GEMINI_API_KEYS") {
            let keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            self.provider_mut(ProviderKind::Gemini).keys = keys;
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            self.provider_mut(ProviderKind::OpenAI).keys = vec![key];
        }
        if let Some(threshold) = var("TSK_TAG_THRESHOLD") {
            self.classifier.threshold = threshold
                .parse()
                .with_context(|| format!("TSK_TAG_THRESHOLD is not a number: {:?}", threshold))?;
        }
        self.validate()
    }

    fn provider_mut(&mut self, kind: ProviderKind) -> &mut ProviderConfig {
        let providers = &mut self.classifier.providers;
        let index = match providers.iter().position(|p| p.kind == kind) {
            Some(i) => i,
            None => {
                providers.push(ProviderConfig { kind, keys: Vec::new(), models: Vec::new() });
                providers.len() - 1
            }
        };
        &mut providers[index]
    }

    fn validate(&self) -> Result<()> {
        if self.classifier.threshold > 100 {
            return Err(anyhow!(
                "classifier.threshold must be between 0 and 100, got {}",
                self.classifier.threshold
            ));
        }
        Ok(())
    }

    /// Credentials in provider order, then key order.
    pub fn classifier_config(&self) -> ClassifierConfig {
        let mut config = ClassifierConfig {
            threshold: self.classifier.threshold,
            output_mode: self.classifier.output_mode,
            ..ClassifierConfig::default()
        };
        for provider in &self.classifier.providers {
            config.credentials.extend(provider.keys.iter().enumerate().map(|(i, key)| Credential {
                provider: provider.kind,
                label: format!("{}#{}", provider.kind, i + 1),
                api_key: key.clone(),
            }));
            if !provider.models.is_empty() {
                match provider.kind {
                    ProviderKind::Gemini => config.gemini_models = provider.models.clone(),
                    ProviderKind::OpenAI => config.openai_models = provider.models.clone(),
                }
            }
        }
        config
    }

    /// Copy safe to print.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.backend.api_key = copy.backend.api_key.as_deref().map(mask_key);
        for provider in &mut copy.classifier.providers {
            provider.keys = provider.keys.iter().map(|k| mask_key(k)).collect();
        }
        copy
    }
}
