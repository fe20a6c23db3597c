//! Application configuration for indexsync.
//!
//! User config lives at `~/.indexsync/indexsync.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{IndexSyncError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "indexsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".indexsync";

// ---------------------------------------------------------------------------
// Config structs (matching indexsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Job record settings.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Pipeline working directories.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Downstream vector index.
    #[serde(default)]
    pub index: IndexConfig,

    /// Remote content sources, processed in order.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// `[jobs]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Root directory holding one sub-directory per job category.
    #[serde(default = "default_jobs_dir")]
    pub dir: PathBuf,

    /// Log events buffered in memory before an append + flush.
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,

    /// Poll interval for control markers while paused, and for live monitoring.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which an untouched running/paused job counts as stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            dir: default_jobs_dir(),
            log_buffer: default_log_buffer(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl JobsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("var/jobs")
}
fn default_log_buffer() -> usize {
    20
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_stale_after_secs() -> u64 {
    300
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-source local copies, artifacts and manifests live under here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("var/data")
}

/// `[index]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Base URL of the index service.
    #[serde(default = "default_index_url")]
    pub url: String,

    /// Target index name.
    #[serde(default = "default_index_name")]
    pub index: String,

    /// Name of the env var holding the index API key (never store the key itself).
    #[serde(default = "default_index_key_env")]
    pub api_key_env: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            index: default_index_name(),
            api_key_env: default_index_key_env(),
        }
    }
}

fn default_index_url() -> String {
    "http://127.0.0.1:8108".into()
}
fn default_index_name() -> String {
    "documents".into()
}
fn default_index_key_env() -> String {
    "INDEXSYNC_INDEX_KEY".into()
}

/// How items of a source are turned into publishable text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// HTML pages, converted to Markdown.
    Html,
    /// Markdown documents, published as-is.
    Markdown,
    /// Plain text documents, published as-is.
    Text,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Html => write!(f, "html"),
            SourceKind::Markdown => write!(f, "markdown"),
            SourceKind::Text => write!(f, "text"),
        }
    }
}

/// `[[sources]]` entry: one remote content source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name, also used as the on-disk directory and job object id.
    pub name: String,
    /// Content type family of the source.
    pub kind: SourceKind,
    /// Base URL of the content API for this source.
    pub url: String,
    /// Name of the env var holding the bearer token, if the source needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    /// Requested page size when enumerating the remote manifest.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    100
}

impl AppConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.index.url).map_err(|e| {
            IndexSyncError::config(format!("invalid index url '{}': {e}", self.index.url))
        })?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty()
                || source.name.starts_with('.')
                || source.name.contains(['/', '\\', '[', ']'])
            {
                return Err(IndexSyncError::config(format!(
                    "invalid source name '{}'",
                    source.name
                )));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(IndexSyncError::config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            Url::parse(&source.url).map_err(|e| {
                IndexSyncError::config(format!(
                    "invalid url for source '{}': {e}",
                    source.name
                ))
            })?;
        }
        Ok(())
    }

    /// Look up a source by name.
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.indexsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| IndexSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.indexsync/indexsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| IndexSyncError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        IndexSyncError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| IndexSyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| IndexSyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IndexSyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a secret from the named env var. Empty values count as unset.
pub fn read_secret(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Some(val),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("poll_interval_ms"));
        assert!(toml_str.contains("INDEXSYNC_INDEX_KEY"));
    }

    #[test]
    fn config_with_sources() {
        let toml_str = r#"
[jobs]
dir = "/tmp/jobs"
log_buffer = 5

[[sources]]
name = "handbook"
kind = "html"
url = "https://content.example.com/api/sites/handbook"
token_env = "HANDBOOK_TOKEN"

[[sources]]
name = "notes"
kind = "markdown"
url = "https://content.example.com/api/sites/notes"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].kind, SourceKind::Html);
        assert_eq!(config.sources[1].page_size, 100);
        assert_eq!(config.jobs.log_buffer, 5);
        assert_eq!(config.jobs.stale_after_secs, 300);
        assert!(config.validate().is_ok());
        assert!(config.source("notes").is_some());
    }

    #[test]
    fn validate_rejects_duplicate_sources() {
        let source = SourceConfig {
            name: "dup".into(),
            kind: SourceKind::Text,
            url: "https://example.com".into(),
            token_env: None,
            page_size: 10,
        };
        let config = AppConfig {
            sources: vec![source.clone(), source],
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate source name"));
    }

    #[test]
    fn validate_rejects_path_like_names() {
        let config = AppConfig {
            sources: vec![SourceConfig {
                name: "../escape".into(),
                kind: SourceKind::Text,
                url: "https://example.com".into(),
                token_env: None,
                page_size: 10,
            }],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_from_jobs_config() {
        let jobs = JobsConfig {
            poll_interval_ms: 0,
            ..JobsConfig::default()
        };
        assert_eq!(jobs.poll_interval(), Duration::from_millis(1));
        assert_eq!(jobs.stale_after(), Duration::from_secs(300));
    }

    #[test]
    fn missing_secret_is_none() {
        assert!(read_secret("INDEXSYNC_TEST_NONEXISTENT_KEY_12345").is_none());
    }
}
