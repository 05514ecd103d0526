use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dupcheck_core::{
    validate_threshold, BudgetSettings, ComparisonMode, DEFAULT_PRE_SCREEN_REDUCTION,
};
use dupcheck_llm::{LlmProvider, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};

use crate::pricing::PricingConfig;

pub const DEFAULT_CONFIG_PATH: &str = "dupcheck.toml";
pub const DEFAULT_DATABASE: &str = "dupcheck.sqlite";

#[derive(Debug, Clone, Deserialize)]
pub struct DupcheckConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckConfig {
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,
    #[serde(default = "default_mode")]
    pub default_mode: ComparisonMode,
    #[serde(default = "default_reduction")]
    pub hybrid_threshold_reduction: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens_per_text")]
    pub max_tokens_per_text: usize,
    #[serde(default)]
    pub use_batch_api: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after a failed judge request, on top of the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

fn default_threshold() -> f32 {
    0.7
}

fn default_mode() -> ComparisonMode {
    ComparisonMode::VectorOnly
}

fn default_reduction() -> f32 {
    DEFAULT_PRE_SCREEN_REDUCTION
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens_per_text() -> usize {
    2000
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

impl Default for DupcheckConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            check: CheckConfig::default(),
            judge: JudgeConfig::default(),
            budget: BudgetSettings::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
            default_mode: default_mode(),
            hybrid_threshold_reduction: default_reduction(),
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            max_tokens_per_text: default_max_tokens_per_text(),
            use_batch_api: false,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl JudgeConfig {
    pub fn provider(&self) -> Result<LlmProvider> {
        LlmProvider::from_str(&self.provider)
            .ok_or_else(|| anyhow!("unknown judge provider {}", self.provider))
    }
}

impl DupcheckConfig {
    /// Reads `path` (a missing file means defaults) and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str(&contents).map_err(|e| anyhow!("invalid config: {e}"))?
        } else {
            Self::default()
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Path from `DUPCHECK_CONFIG`, else `dupcheck.toml` in the working directory.
    pub fn default_path() -> PathBuf {
        env::var("DUPCHECK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(db) = var("DUPCHECK_DB") {
            self.database = PathBuf::from(db);
        }
        if let Some(provider) = var("DUPCHECK_PROVIDER") {
            self.judge.provider = provider;
        }
        if let Some(model) = var("DUPCHECK_MODEL") {
            self.judge.model = model;
        }
        if let Some(reduction) = var("DUPCHECK_HYBRID_REDUCTION") {
            self.check.hybrid_threshold_reduction = reduction
                .parse()
                .map_err(|_| anyhow!("DUPCHECK_HYBRID_REDUCTION must be a number, got {reduction}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.check.default_threshold)
            .map_err(|err| anyhow!("check.default_threshold: {err}"))?;
        if !(0.0..=1.0).contains(&self.check.hybrid_threshold_reduction) {
            return Err(anyhow!(
                "check.hybrid_threshold_reduction must be between 0 and 1"
            ));
        }
        self.judge.provider()?;
        if self.judge.max_tokens_per_text == 0 {
            return Err(anyhow!("judge.max_tokens_per_text must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DupcheckConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.check.default_threshold, 0.7);
        assert_eq!(config.check.default_mode, ComparisonMode::VectorOnly);
        assert_eq!(config.judge.model, "gpt-4o-mini");
        assert_eq!(config.judge.max_retries, 3);
        assert_eq!(config.budget.alert_threshold_percent, 80.0);
    }

    #[test]
    fn file_sections_are_parsed() {
        let config: DupcheckConfig = toml::from_str(
            r#"
            database = "/var/lib/dupcheck.sqlite"

            [check]
            default_threshold = 0.85
            default_mode = "hybrid"

            [judge]
            provider = "deepseek"
            model = "deepseek-chat"
            use_batch_api = true
            max_retries = 5

            [budget]
            monthly_limit = 25.0
            enforce = true

            [pricing.deepseek.deepseek-chat]
            prompt_per_1m = 0.27
            completion_per_1m = 1.10
            "#,
        )
        .unwrap();
        assert_eq!(config.check.default_mode, ComparisonMode::Hybrid);
        assert_eq!(config.check.hybrid_threshold_reduction, 0.25);
        assert_eq!(config.judge.provider().unwrap(), LlmProvider::Deepseek);
        assert!(config.judge.use_batch_api);
        assert_eq!(config.judge.max_retries, 5);
        assert_eq!(config.budget.monthly_limit, 25.0);
        assert!(!config.budget.alerts_enabled);
        assert!(config.pricing.lookup("deepseek", "deepseek-chat").is_some());
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DUPCHECK_DB", "/tmp/other.sqlite"),
            ("DUPCHECK_PROVIDER", "local"),
            ("DUPCHECK_HYBRID_REDUCTION", "0.1"),
        ]);
        let mut config = DupcheckConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database, PathBuf::from("/tmp/other.sqlite"));
        assert_eq!(config.judge.provider().unwrap(), LlmProvider::Local);
        assert_eq!(config.check.hybrid_threshold_reduction, 0.1);

        let bad = HashMap::from([("DUPCHECK_HYBRID_REDUCTION", "lots")]);
        let mut config = DupcheckConfig::default();
        assert!(config.apply_env(|key| bad.get(key).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn out_of_range_default_threshold_is_rejected() {
        let mut config = DupcheckConfig::default();
        config.check.default_threshold = 0.2;
        assert!(config.validate().is_err());
    }
}
