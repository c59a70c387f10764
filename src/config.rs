// Configuration: one explicit value resolved at startup and passed by
// reference into the gateway, the stream consumer and the upload
// pipeline. Layers, lowest priority first:
//   defaults -> TOML file -> environment -> command line flags.
// The command line layer is applied by `cli`, which owns the flags.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.twitter.com/";
pub const DEFAULT_UPLOAD_URL: &str = "https://upload.twitter.com/1.1/media/upload.json";
pub const DEFAULT_USER_AGENT: &str = concat!("ctw/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_BACKOFF_INITIAL_SECS: u64 = 2;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 120;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("parse {key}: {reason}")]
    Env { key: String, reason: String },
    #[error("could not determine the user config directory")]
    NoConfigDir,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub base_url: String,
    pub upload_url: String,
    pub bearer_token: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub stream: StreamSettings,
    pub pretty: bool,
}

/// Reconnect tuning for the stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Reset the backoff after a connection stayed up this long.
    /// `None` keeps growing the backoff for the whole session.
    pub backoff_reset_after: Option<Duration>,
    /// Treat the connection as dead when nothing arrives for this long.
    pub stall_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            backoff_initial: Duration::from_secs(DEFAULT_BACKOFF_INITIAL_SECS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            backoff_reset_after: None,
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: DEFAULT_BASE_URL.into(),
            upload_url: DEFAULT_UPLOAD_URL.into(),
            bearer_token: None,
            user_agent: DEFAULT_USER_AGENT.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            stream: StreamSettings::default(),
            pretty: false,
        }
    }
}

/// On-disk shape of `config.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub auth: AuthSection,
    pub http: HttpSection,
    pub stream: StreamSection,
    pub output: OutputSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub bearer_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub base_url: Option<String>,
    pub upload_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub backoff_initial_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub backoff_reset_after_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub pretty: Option<bool>,
}

/// `~/.config/ctw/config.toml` (platform equivalent via `dirs`).
pub fn default_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(dir.join("ctw").join("config.toml"))
}

impl FileConfig {
    /// Load a config file. A missing file yields `None` so callers can
    /// decide whether that matters.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let parsed = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(parsed))
    }
}

impl Config {
    /// Resolve defaults, the config file and the environment.
    ///
    /// `explicit_path` comes from `--config`; when given, the file must exist.
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match explicit_path {
            Some(path) => Some(
                FileConfig::load(path)?
                    .ok_or_else(|| ConfigError::NotFound(path.to_path_buf()))?,
            ),
            // No config directory (e.g. a bare container) just means no file.
            None => match default_path() {
                Ok(path) => FileConfig::load(&path)?,
                Err(_) => None,
            },
        };
        if file.is_some() {
            tracing::debug!("loaded config file");
        }

        let mut config = Config::default();
        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(token) = non_empty(file.auth.bearer_token) {
            self.bearer_token = Some(token);
        }
        if let Some(url) = non_empty(file.http.base_url) {
            self.base_url = url;
        }
        if let Some(url) = non_empty(file.http.upload_url) {
            self.upload_url = url;
        }
        if let Some(agent) = non_empty(file.http.user_agent) {
            self.user_agent = agent;
        }
        if let Some(secs) = file.http.timeout_secs.filter(|s| *s > 0) {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stream.backoff_initial_secs.filter(|s| *s > 0) {
            self.stream.backoff_initial = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stream.backoff_max_secs.filter(|s| *s > 0) {
            self.stream.backoff_max = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stream.backoff_reset_after_secs.filter(|s| *s > 0) {
            self.stream.backoff_reset_after = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = file.stream.stall_timeout_secs.filter(|s| *s > 0) {
            self.stream.stall_timeout = Duration::from_secs(secs);
        }
        if let Some(pretty) = file.output.pretty {
            self.pretty = pretty;
        }
    }

    /// Apply environment overrides through a lookup function so tests do
    /// not have to touch the real process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(token) = get("BEARER_TOKEN") {
            self.bearer_token = Some(token);
        }
        if let Some(agent) = get("USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(url) = get("CTW_BASE_URL") {
            self.base_url = url;
        }
        if let Some(url) = get("CTW_UPLOAD_URL") {
            self.upload_url = url;
        }
        if let Some(value) = get("CTW_TIMEOUT") {
            self.timeout = parse_secs("CTW_TIMEOUT", &value)?;
        }
        if let Some(value) = get("CTW_STREAM_BACKOFF_MAX") {
            self.stream.backoff_max = parse_secs("CTW_STREAM_BACKOFF_MAX", &value)?;
        }
        if let Some(value) = get("CTW_PRETTY") {
            self.pretty = value.parse().map_err(|_| ConfigError::Env {
                key: "CTW_PRETTY".into(),
                reason: format!("expected true or false, got {value:?}"),
            })?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Whole seconds, optionally suffixed with `s`. Zero is rejected: a zero
/// timeout or backoff ceiling is never usable.
fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::Env {
        key: key.into(),
        reason: format!("expected a positive number of seconds, got {value:?}"),
    };
    let secs: u64 = value.trim_end_matches('s').parse().map_err(|_| invalid())?;
    if secs == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}
