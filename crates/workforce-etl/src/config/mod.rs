use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the loader.
///
/// The API and database sections are optional at load time so that commands
/// which only touch one side (e.g. `migrate`) do not demand the other's secrets.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub api: Option<ApiConfig>,
    pub database: Option<DatabaseConfig>,
    pub pipeline: PipelineConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let api = match optional("WFM_API_BASE_URL") {
            Some(base_url) => Some(ApiConfig::from_env(base_url)?),
            None => None,
        };
        let database = optional("DATABASE_URL").map(|url| DatabaseConfig { url });

        let pipeline = PipelineConfig {
            batch_size: parse_or("ETL_BATCH_SIZE", 500usize)?.max(1),
            max_range_days: parse_or("ETL_MAX_RANGE_DAYS", 31u32)?.max(1),
        };

        let telemetry = TelemetryConfig {
            log_level: env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::from_str(
                &env::var("APP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()),
            ),
        };

        Ok(Self {
            environment,
            api,
            database,
            pipeline,
            telemetry,
        })
    }

    pub fn require_api(&self) -> Result<&ApiConfig, ConfigError> {
        self.api.as_ref().ok_or(ConfigError::Missing {
            name: "WFM_API_BASE_URL",
        })
    }

    pub fn require_database(&self) -> Result<&DatabaseConfig, ConfigError> {
        self.database
            .as_ref()
            .ok_or(ConfigError::Missing { name: "DATABASE_URL" })
    }
}

/// Connection and pacing settings for the workforce API.
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token_path: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub page_size: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub calls_per_minute: u32,
    pub token_refresh_buffer: Duration,
    pub quota_floor: u32,
}

impl ApiConfig {
    fn from_env(base_url: String) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token_path: env::var("WFM_TOKEN_PATH").unwrap_or_else(|_| "/oauth/token".to_string()),
            client_id: required("WFM_CLIENT_ID")?,
            client_secret: required("WFM_CLIENT_SECRET")?,
            username: required("WFM_USERNAME")?,
            password: required("WFM_PASSWORD")?,
            page_size: parse_or("WFM_PAGE_SIZE", 100u32)?.max(1),
            max_retries: parse_or("WFM_MAX_RETRIES", 3u32)?,
            retry_delay: Duration::from_millis(parse_or("WFM_RETRY_DELAY_MS", 1_000u64)?),
            request_timeout: Duration::from_secs(parse_or("WFM_REQUEST_TIMEOUT_SECS", 30u64)?),
            calls_per_minute: parse_or("WFM_CALLS_PER_MINUTE", 60u32)?.max(1),
            token_refresh_buffer: Duration::from_secs(parse_or(
                "WFM_TOKEN_REFRESH_BUFFER_SECS",
                60u64,
            )?),
            quota_floor: parse_or("WFM_QUOTA_FLOOR", 5u32)?,
        })
    }

    pub fn token_url(&self) -> String {
        format!("{}/{}", self.base_url, self.token_path.trim_start_matches('/'))
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("token_path", &self.token_path)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("request_timeout", &self.request_timeout)
            .field("calls_per_minute", &self.calls_per_minute)
            .field("token_refresh_buffer", &self.token_refresh_buffer)
            .field("quota_floor", &self.quota_floor)
            .finish()
    }
}

/// Warehouse connection settings.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Load sizing shared by the orchestrator and fact loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_range_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_range_days: 31,
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing { name: &'static str },
    Invalid { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing { name } => write!(f, "{name} must be set"),
            ConfigError::Invalid { name, value } => {
                write!(f, "{name} has an invalid value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing { name })
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_LOG_LEVEL",
        "APP_LOG_FORMAT",
        "WFM_API_BASE_URL",
        "WFM_TOKEN_PATH",
        "WFM_CLIENT_ID",
        "WFM_CLIENT_SECRET",
        "WFM_USERNAME",
        "WFM_PASSWORD",
        "WFM_PAGE_SIZE",
        "WFM_MAX_RETRIES",
        "WFM_RETRY_DELAY_MS",
        "WFM_REQUEST_TIMEOUT_SECS",
        "WFM_CALLS_PER_MINUTE",
        "WFM_TOKEN_REFRESH_BUFFER_SECS",
        "WFM_QUOTA_FLOOR",
        "DATABASE_URL",
        "ETL_BATCH_SIZE",
        "ETL_MAX_RANGE_DAYS",
    ];

    fn reset_env() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    fn set_api_credentials() {
        env::set_var("WFM_API_BASE_URL", "https://wfm.example.com/api/v1/");
        env::set_var("WFM_CLIENT_ID", "etl");
        env::set_var("WFM_CLIENT_SECRET", "s3cret");
        env::set_var("WFM_USERNAME", "loader");
        env::set_var("WFM_PASSWORD", "hunter2");
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert!(config.api.is_none());
        assert!(config.database.is_none());
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.telemetry.format, LogFormat::Compact);
    }

    #[test]
    fn api_section_requires_credentials_once_base_url_is_set() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("WFM_API_BASE_URL", "https://wfm.example.com");

        match AppConfig::load() {
            Err(ConfigError::Missing {
                name: "WFM_CLIENT_ID",
            }) => {}
            other => panic!("expected missing client id, got {other:?}"),
        }
    }

    #[test]
    fn api_section_parses_overrides_and_builds_token_url() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        set_api_credentials();
        env::set_var("WFM_PAGE_SIZE", "250");
        env::set_var("WFM_RETRY_DELAY_MS", "50");

        let config = AppConfig::load().expect("config loads");
        let api = config.require_api().expect("api configured");
        assert_eq!(api.base_url, "https://wfm.example.com/api/v1");
        assert_eq!(api.token_url(), "https://wfm.example.com/api/v1/oauth/token");
        assert_eq!(api.page_size, 250);
        assert_eq!(api.retry_delay, Duration::from_millis(50));
        assert_eq!(api.max_retries, 3);
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_variable() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ETL_BATCH_SIZE", "lots");

        match AppConfig::load() {
            Err(ConfigError::Invalid { name, value }) => {
                assert_eq!(name, "ETL_BATCH_SIZE");
                assert_eq!(value, "lots");
            }
            other => panic!("expected invalid value, got {other:?}"),
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        set_api_credentials();
        env::set_var("DATABASE_URL", "postgres://etl:pw@localhost/warehouse");

        let config = AppConfig::load().expect("config loads");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("etl:pw"));
        assert!(config.require_database().is_ok());
    }
}
