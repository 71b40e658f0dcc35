//! Configuration loader and validator for the xkcd sync job.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub http: Http,
    pub sources: Sources,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub save_dir: String,
    /// Pause after every item that touched the network.
    pub courtesy_delay_ms: u64,
}

/// Outbound HTTP settings handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Http {
    pub user_agent: String,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sources {
    pub comics: SourceSettings,
    pub whatif: SourceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSettings {
    pub enabled: bool,
    pub base_url: String,
}

impl App {
    /// Expand a leading `~/` in `save_dir`.
    pub fn resolved_save_dir(&self) -> PathBuf {
        if let Some(rest) = self.save_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Path::new(&home).join(rest);
            }
        }
        PathBuf::from(&self.save_dir)
    }

    pub fn courtesy_delay(&self) -> Duration {
        Duration::from_millis(self.courtesy_delay_ms)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.save_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.save_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_save_dir())
    }

    /// Default SQLite location inside the save directory.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/xkcd.db", self.app.resolved_save_dir().display())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, the built-in defaults are used.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let cfg = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        }
        None => serde_yaml::from_str(example())?,
    };
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.save_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.save_dir must be non-empty"));
    }
    if cfg.app.courtesy_delay_ms == 0 {
        return Err(ConfigError::Invalid("app.courtesy_delay_ms must be > 0"));
    }

    if cfg.http.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("http.user_agent must be non-empty"));
    }
    if cfg.http.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("http.timeout_seconds must be > 0"));
    }
    if let Some(proxy) = cfg.http.proxy.as_deref() {
        if Url::parse(proxy).is_err() {
            return Err(ConfigError::Invalid("http.proxy must be a valid URL"));
        }
    }

    if Url::parse(&cfg.sources.comics.base_url).is_err() {
        return Err(ConfigError::Invalid("sources.comics.base_url must be a valid URL"));
    }
    if Url::parse(&cfg.sources.whatif.base_url).is_err() {
        return Err(ConfigError::Invalid("sources.whatif.base_url must be a valid URL"));
    }

    Ok(())
}

/// Returns the example YAML content, also used as the built-in defaults.
pub fn example() -> &'static str {
    r#"app:
  save_dir: "./data"
  courtesy_delay_ms: 1000

http:
  user_agent: "xkcd-sync/0.1 (+https://xkcd.com/json.html)"
  timeout_seconds: 30
  proxy: null

sources:
  comics:
    enabled: true
    base_url: "https://xkcd.com/"
  whatif:
    enabled: true
    base_url: "https://what-if.xkcd.com/"
"#
}
