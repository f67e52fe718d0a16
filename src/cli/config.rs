//! Rentguard configuration file handling
//!
//! TOML file with four sections: `[authority]`, `[session]`, `[rate_limit]`
//! and `[logging]`. Every field has a default, so an empty file is valid.
//!
//! `RENTGUARD_BASE_URL` and `RENTGUARD_ANON_KEY` override the authority
//! section after loading.

use rentguard::authority::HttpAuthorityConfig;
use rentguard::gatekeeper::{ActionClass, MonitorConfig, RateLimitConfig};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_BASE_URL: &str = "http://localhost:54321";

pub const ENV_BASE_URL: &str = "RENTGUARD_BASE_URL";
pub const ENV_ANON_KEY: &str = "RENTGUARD_ANON_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to generate secret")]
    Random,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RentguardConfig {
    #[serde(default)]
    pub authority: AuthorityConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote authority connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Public anon key; safe to ship in a client
    #[serde(default)]
    pub anon_key: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_warning_threshold")]
    pub warning_threshold_secs: u64,

    /// Refresh automatically when this close to expiry (off when unset)
    pub auto_refresh_margin_secs: Option<u64>,

    /// Session cache file (default: data dir)
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Secret the identifier masking key is derived from
    pub identifier_secret: Option<String>,

    /// Stands in for the subject when nobody is signed in
    pub installation_id: Option<String>,

    /// Per-class limits replacing the built-in presets, keyed by class name
    #[serde(default)]
    pub overrides: BTreeMap<String, ClassLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLimit {
    pub max_requests: u32,
    pub window_secs: u64,
    pub progressive_backoff: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directives
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    30
}

fn default_warning_threshold() -> u64 {
    300
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            anon_key: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            warning_threshold_secs: default_warning_threshold(),
            auto_refresh_margin_secs: None,
            cache_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl AuthorityConfig {
    pub fn http_config(&self) -> HttpAuthorityConfig {
        HttpAuthorityConfig {
            base_url: self.base_url.clone(),
            anon_key: self.anon_key.clone(),
            timeout_secs: self.request_timeout_secs,
            ..Default::default()
        }
    }
}

impl SessionConfig {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            warning_threshold: Duration::from_secs(self.warning_threshold_secs),
            auto_refresh_margin: self.auto_refresh_margin_secs.map(Duration::from_secs),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(default_session_cache_path)
    }
}

impl RateLimitSettings {
    /// Limit for `class`: the configured override, else the preset.
    pub fn limit_for(&self, class: ActionClass) -> RateLimitConfig {
        let preset = RateLimitConfig::for_class(class);
        match self.overrides.get(class.name()) {
            Some(limit) => RateLimitConfig {
                max_requests: limit.max_requests,
                window_secs: limit.window_secs,
                progressive_backoff: limit
                    .progressive_backoff
                    .unwrap_or(preset.progressive_backoff),
            },
            None => preset,
        }
    }
}

impl RentguardConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: RentguardConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, then apply environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.authority.base_url = base_url;
        }
        if let Some(anon_key) = lookup(ENV_ANON_KEY).filter(|v| !v.is_empty()) {
            self.authority.anon_key = anon_key;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        for (name, limit) in &self.rate_limit.overrides {
            name.parse::<ActionClass>().map_err(ConfigError::Invalid)?;
            if limit.max_requests == 0 || limit.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.overrides.{}: max_requests and window_secs must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        write_file(path, &contents)
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(identifier_secret: &str, installation_id: &str) -> String {
        format!(
            r#"# Rentguard Client Configuration

[authority]
# Backend project URL
base_url = "{base_url}"

# Public anon key (overridable with {env_key})
anon_key = ""

# Whole-request transport timeout
request_timeout_secs = 30

[session]
# How often the cached session is checked
poll_interval_secs = 30

# Warn this long before expiry
warning_threshold_secs = 300

# Refresh automatically this long before expiry (disabled when unset)
# auto_refresh_margin_secs = 600

# Session cache file (defaults to the user data directory)
# cache_path = "/path/to/session.json"

[rate_limit]
# Key material for masking user ids in rate-limit identifiers.
# Keep it private; changing it resets every rate-limit window.
identifier_secret = "{identifier_secret}"

# Used in place of a user id when nobody is signed in
installation_id = "{installation_id}"

# Per-class overrides of the built-in limits
# [rate_limit.overrides.auth]
# max_requests = 5
# window_secs = 900
# progressive_backoff = true

[logging]
# Log level or filter directives: trace, debug, info, warn, error
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/rentguard/rentguard.log"
"#,
            base_url = DEFAULT_BASE_URL,
            env_key = ENV_ANON_KEY,
            identifier_secret = identifier_secret,
            installation_id = installation_id,
        )
    }

    /// Create and save a default configuration file with fresh secrets
    pub fn create_default(config_path: &Path) -> Result<(), ConfigError> {
        let secret = generate_secret()?;
        let installation_id = uuid::Uuid::new_v4().to_string();
        write_file(
            config_path,
            &Self::generate_default_toml(&secret, &installation_id),
        )
    }
}

/// 32 random bytes, hex-encoded
pub fn generate_secret() -> Result<String, ConfigError> {
    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| ConfigError::Random)?;
    Ok(hex::encode(bytes))
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    // Create parent directory if needed
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, contents).map_err(write_err)
}

/// Default config file: `<config dir>/rentguard/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rentguard")
        .join("config.toml")
}

/// Default session cache: `<data dir>/rentguard/session.json`
pub fn default_session_cache_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rentguard")
        .join("session.json")
}
