//! Service configuration
//!
//! Loading hierarchy: environment (`SABT_` prefix) > optional config file >
//! defaults. Secrets (tokens, signing keys) are read from environment
//! variables whose names are themselves configurable.

use serde::Deserialize;
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors; these map to exit code 2
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(String),

    #[error("CONFIG_TZ_INVALID: {0} is not a valid IANA timezone")]
    InvalidTimezone(String),
}

fn default_service_name() -> String {
    "sabt".to_string()
}

fn default_metrics_namespace() -> String {
    "sabt".to_string()
}

fn default_timezone() -> String {
    sabt_clock::DEFAULT_TIMEZONE.to_string()
}

fn default_output_dir() -> String {
    "./exports".to_string()
}

fn default_true() -> bool {
    true
}

/// Rate limit tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_namespace")]
    pub namespace: String,
    #[serde(default = "RateLimitConfig::default_requests")]
    pub requests: i64,
    #[serde(default = "RateLimitConfig::default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "RateLimitConfig::default_penalty_seconds")]
    pub penalty_seconds: u64,
}

impl RateLimitConfig {
    fn default_namespace() -> String {
        "sabt".to_string()
    }
    fn default_requests() -> i64 {
        30
    }
    fn default_window_seconds() -> u64 {
        60
    }
    fn default_penalty_seconds() -> u64 {
        120
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            namespace: Self::default_namespace(),
            requests: Self::default_requests(),
            window_seconds: Self::default_window_seconds(),
            penalty_seconds: Self::default_penalty_seconds(),
        }
    }
}

/// Token and signing-key sources
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Env var holding the metrics token
    #[serde(default = "AuthConfig::default_metrics_token_env")]
    pub metrics_token_env: String,
    /// Env var holding the bearer token table (JSON array)
    #[serde(default = "AuthConfig::default_tokens_env")]
    pub tokens_env: String,
    /// Env var holding the signing key set (JSON array)
    #[serde(default = "AuthConfig::default_signing_keys_env")]
    pub signing_keys_env: String,
    /// Signing key file used by the rotate-keys controller command
    #[serde(default)]
    pub signing_keys_file: Option<String>,
    #[serde(default = "AuthConfig::default_download_ttl")]
    pub download_url_ttl_seconds: u64,
}

impl AuthConfig {
    fn default_metrics_token_env() -> String {
        "METRICS_TOKEN".to_string()
    }
    fn default_tokens_env() -> String {
        "TOKENS".to_string()
    }
    fn default_signing_keys_env() -> String {
        "DOWNLOAD_SIGNING_KEYS".to_string()
    }
    fn default_download_ttl() -> u64 {
        900
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            metrics_token_env: Self::default_metrics_token_env(),
            tokens_env: Self::default_tokens_env(),
            signing_keys_env: Self::default_signing_keys_env(),
            signing_keys_file: None,
            download_url_ttl_seconds: Self::default_download_ttl(),
        }
    }
}

/// Redis connection settings; absent DSN selects the in-memory store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub dsn: Option<String>,
    #[serde(default = "RedisConfig::default_namespace")]
    pub namespace: String,
}

impl RedisConfig {
    fn default_namespace() -> String {
        "sabt".to_string()
    }
}

/// Allocation engine tuning
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AllocationSettings {
    #[serde(default)]
    pub fast_fail: bool,
    #[serde(default)]
    pub trace_limit_rejected: Option<usize>,
}

/// Export job tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "ExportConfig::default_max_retries")]
    pub max_retries: u32,
}

impl ExportConfig {
    fn default_max_retries() -> u32 {
        3
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_retries: Self::default_max_retries(),
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_metrics_namespace")]
    pub metrics_namespace: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub allocation: AllocationSettings,
    #[serde(default = "AppConfig::default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    #[serde(default = "AppConfig::default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default)]
    pub enable_debug_logs: bool,
    #[serde(default)]
    pub enable_diagnostics: bool,
    #[serde(default = "default_true")]
    pub excel_mode: bool,
}

impl AppConfig {
    fn default_readiness_timeout_ms() -> u64 {
        500
    }
    fn default_health_timeout_ms() -> u64 {
        200
    }

    /// Load from the optional `sabt.toml` file plus `SABT_`-prefixed
    /// environment overrides (`SABT_RATELIMIT__REQUESTS=5`).
    pub fn load() -> ConfigResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("sabt").required(false))
            .add_source(
                config::Environment::with_prefix("SABT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|err| ConfigError::Load(err.to_string()))?;
        let app: Self = settings
            .try_deserialize()
            .map_err(|err| ConfigError::Load(err.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        sabt_clock::validate_timezone(&self.timezone)
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))?;
        if self.ratelimit.requests < 1 || self.ratelimit.window_seconds == 0 {
            return Err(ConfigError::Load(
                "ratelimit.requests and ratelimit.window_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Value of an indirected secret env var, trimmed and zero-width free
    pub fn secret_from_env(&self, var_name: &str) -> String {
        sabt_text::normalize_token(std::env::var(var_name).ok().as_deref())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            metrics_namespace: default_metrics_namespace(),
            timezone: default_timezone(),
            ratelimit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
            redis: RedisConfig::default(),
            export: ExportConfig::default(),
            allocation: AllocationSettings::default(),
            readiness_timeout_ms: Self::default_readiness_timeout_ms(),
            health_timeout_ms: Self::default_health_timeout_ms(),
            enable_debug_logs: false,
            enable_diagnostics: false,
            excel_mode: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timezone, "Asia/Tehran");
        assert_eq!(config.ratelimit.requests, 30);
        assert_eq!(config.auth.download_url_ttl_seconds, 900);
    }

    #[test]
    fn bad_timezone_is_a_config_error() {
        let config = AppConfig {
            timezone: "Nowhere/Void".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn zero_requests_rejected() {
        let config = AppConfig {
            ratelimit: RateLimitConfig {
                requests: 0,
                ..RateLimitConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
