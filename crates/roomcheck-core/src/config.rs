//! Configuration loader, typed settings and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars
//! (nested keys separated by `__`, e.g. `APP_JUDGE__TIMEOUT_SECS=10`).
//! Path values go through `expand_path`, which expands `~` and `${VAR}`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::Error;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::load_from(Path::new("."), &env_name)
    }

    /// Load `config.toml` and the per-environment overlay from `dir`.
    pub fn load_from(dir: &Path, env_name: &str) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(dir.join("config.toml")));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.app()?.validate()?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// The whole typed configuration.
    pub fn app(&self) -> anyhow::Result<AppConfig> {
        self.figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to extract configuration: {}", e))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub detector: DetectorConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub judge: JudgeConfig,
    pub store: StoreConfig,
}

/// Where candle models run. `auto` takes Metal when the build has it and a GPU answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Metal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Directory holding the CLIP `model.safetensors` and `tokenizer.json`.
    pub model_dir: Option<String>,
    pub confidence_threshold: f32,
    pub vocabulary: String,
    pub device: DeviceKind,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            confidence_threshold: 0.3,
            vocabulary: "residence-hall-v1".to_string(),
            device: DeviceKind::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model_dir: Option<String>,
    pub max_len: usize,
    pub use_fake: bool,
    pub device: DeviceKind,
}

impl Default for EmbeddingConfig {
    fn default() -> Self { Self { model_dir: None, max_len: 256, use_fake: false, device: DeviceKind::Auto } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub min_fragment_chars: usize,
    pub embed_batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self { Self { min_fragment_chars: 20, embed_batch_size: 32 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub k_per_label: usize,
    pub use_category_hint: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self { Self { k_per_label: 3, use_category_hint: true } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub endpoint: String,
    pub model: String,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub max_new_tokens: u32,
    pub temperature: f32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api-inference.huggingface.co".to_string(),
            model: "mistralai/Mistral-7B-Instruct-v0.2".to_string(),
            api_token: None,
            timeout_secs: 30,
            max_attempts: 3,
            max_new_tokens: 512,
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// LanceDB directory for persisted rule indexes; `None` keeps indexes in memory only.
    pub lancedb_dir: Option<String>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let t = self.detector.confidence_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(Error::InvalidConfig(format!("detector.confidence_threshold {t} outside [0,1]")));
        }
        if self.judge.max_attempts == 0 {
            return Err(Error::InvalidConfig("judge.max_attempts must be at least 1".into()));
        }
        if self.judge.timeout_secs == 0 {
            return Err(Error::InvalidConfig("judge.timeout_secs must be at least 1".into()));
        }
        if self.index.embed_batch_size == 0 {
            return Err(Error::InvalidConfig("index.embed_batch_size must be at least 1".into()));
        }
        if self.retrieval.k_per_label == 0 {
            return Err(Error::InvalidConfig("retrieval.k_per_label must be at least 1".into()));
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let mut cfg = AppConfig::default();
        cfg.detector.confidence_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn plain_paths_pass_through_expansion() {
        assert_eq!(expand_path("models/clip"), PathBuf::from("models/clip"));
        assert_eq!(expand_path("/opt/models"), PathBuf::from("/opt/models"));
    }
}
