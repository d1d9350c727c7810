//! Configuration module for Tus Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::upload::DEFAULT_MAX_SIZE;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("HOOK_HOST", "hooks.internal");
/// let result = expand_env_vars("http://${HOOK_HOST}/done");
/// assert_eq!(result, "http://hooks.internal/done");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tus: TusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub expiration: ExpirationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Configuration with every section at its default
    pub fn with_address(address: &str) -> Self {
        Self {
            server: ServerConfig {
                address: address.to_string(),
            },
            tus: TusConfig::default(),
            storage: StorageConfig::default(),
            expiration: ExpirationConfig::default(),
            auth: AuthConfig::default(),
            hooks: HooksConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tus.path_prefix.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "tus.path_prefix '{}' must start with '/'",
                self.tus.path_prefix
            )));
        }

        if self.tus.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "tus.max_size must be greater than zero".into(),
            ));
        }

        if self.storage.backend == StorageBackend::Filesystem
            && self.storage.files_dir.as_os_str().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "storage.files_dir cannot be empty for the filesystem backend".into(),
            ));
        }

        if self.expiration.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "expiration.ttl_secs must be greater than zero".into(),
            ));
        }

        if self.auth.enabled {
            let jwt = self.auth.jwt.as_ref().ok_or_else(|| {
                ConfigError::ValidationError("auth.enabled requires auth.jwt".into())
            })?;
            if jwt.secret.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "auth.jwt.secret cannot be empty".into(),
                ));
            }
            match jwt.algorithm.to_uppercase().as_str() {
                "HS256" | "RS256" | "ES256" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid JWT algorithm '{}': must be HS256, RS256 or ES256",
                        other
                    )))
                }
            }
        }

        if let Some(ref webhook) = self.hooks.completion_webhook {
            if !is_valid_http_url(&webhook.url) {
                return Err(ConfigError::ValidationError(
                    "Invalid completion webhook URL: must start with http:// or https://".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
}

// ============================================================================
// Protocol Configuration
// ============================================================================

/// tus protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TusConfig {
    /// Resource path prefix, e.g. `/files`
    #[serde(default = "default_path_prefix", deserialize_with = "deserialize_prefix")]
    pub path_prefix: String,
    /// Largest accepted upload in bytes (`Tus-Max-Size`)
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Require `Content-Type: application/offset+octet-stream` on chunks
    #[serde(default = "default_strict_content_type")]
    pub strict_content_type: bool,
}

impl Default for TusConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            max_size: default_max_size(),
            strict_content_type: default_strict_content_type(),
        }
    }
}

fn default_path_prefix() -> String {
    "/files".to_string()
}

fn default_max_size() -> u64 {
    DEFAULT_MAX_SIZE
}

fn default_strict_content_type() -> bool {
    true
}

/// Normalize a path prefix to `/name` (leading slash, no trailing slash)
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    format!("/{}", trimmed)
}

fn deserialize_prefix<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(normalize_prefix(&s))
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Directory holding payloads and sidecar records
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            files_dir: default_files_dir(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Filesystem
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("/tmp/files")
}

// ============================================================================
// Expiration Configuration
// ============================================================================

/// When `expiresAt` is assigned to a new upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Every upload expires `ttl_secs` after creation, chunk or no chunk
    OnCreate,
    /// Expiry starts with the first chunk; uploads that never receive one
    /// are never reaped
    OnFirstChunk,
}

/// Expiration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationConfig {
    /// Upload time-to-live. Default: 5 days
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_expiry_policy")]
    pub policy: ExpiryPolicy,
    /// Seconds between reaper sweeps, 0 disables the reaper. Default: 3600
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl ExpirationConfig {
    pub fn ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.ttl_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        chrono::Duration::seconds(secs)
    }
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            policy: default_expiry_policy(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    5 * 24 * 60 * 60
}

fn default_expiry_policy() -> ExpiryPolicy {
    ExpiryPolicy::OnCreate
}

fn default_sweep_interval() -> u64 {
    3600
}

// ============================================================================
// Auth and Hooks
// ============================================================================

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
}

/// JWT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HMAC secret, or PEM public key for RS256/ES256. Supports ${VAR} expansion.
    #[serde(deserialize_with = "deserialize_with_env")]
    pub secret: String,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

/// Hook configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// POST a JSON document when an upload completes
    #[serde(default)]
    pub completion_webhook: Option<WebhookHookConfig>,
    /// Log every completed upload when no webhook is set
    #[serde(default)]
    pub log_completions: bool,
}

/// Completion webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookHookConfig {
    #[serde(deserialize_with = "deserialize_with_env")]
    pub url: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

// ============================================================================
// Observability
// ============================================================================

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset. Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}
