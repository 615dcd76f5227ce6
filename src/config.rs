//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig, RetryPolicy};

/// Default service tag written on every message log entry.
pub const DEFAULT_SERVICE_TAG: &str = "SRR";

/// Default number of inbound messages fed back into the prompt.
pub const DEFAULT_HISTORY_WINDOW: usize = 3;

/// Intake (dialogue engine) configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Tag stored in the `servicio` column of the message log.
    pub service_tag: String,
    /// How many recent inbound messages the prompt carries.
    pub history_window: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            service_tag: DEFAULT_SERVICE_TAG.to_string(),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub retry: RetryPolicy,
    pub intake: IntakeConfig,
    pub db_path: PathBuf,
    pub cli_user: String,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Build the configuration from `PETBOT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("PETBOT_LLM_BACKEND") {
            Ok(raw) => LlmBackend::from_str(&raw).map_err(|message| {
                ConfigError::InvalidValue {
                    key: "PETBOT_LLM_BACKEND".to_string(),
                    message,
                }
            })?,
            Err(_) => LlmBackend::Gemini,
        };

        let api_key = std::env::var("PETBOT_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .map_err(|_| ConfigError::MissingEnvVar("PETBOT_API_KEY".to_string()))?;

        let model = std::env::var("PETBOT_MODEL")
            .unwrap_or_else(|_| backend.default_model().to_string());

        let temperature: f64 = parse_env("PETBOT_TEMPERATURE", 0.7)?;

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_env("PETBOT_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: Duration::from_millis(parse_env(
                "PETBOT_BASE_DELAY_MS",
                retry_defaults.base_delay.as_millis() as u64,
            )?),
            ..retry_defaults
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PETBOT_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let intake = IntakeConfig {
            service_tag: std::env::var("PETBOT_SERVICE_TAG")
                .unwrap_or_else(|_| DEFAULT_SERVICE_TAG.to_string()),
            history_window: parse_env("PETBOT_HISTORY_WINDOW", DEFAULT_HISTORY_WINDOW)?,
        };

        Ok(Self {
            llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key),
                model,
                temperature,
            },
            retry,
            intake,
            db_path: std::env::var("PETBOT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/petbot.db")),
            cli_user: std::env::var("PETBOT_CLI_USER")
                .unwrap_or_else(|_| "local-user".to_string()),
            log_dir: std::env::var("PETBOT_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Read and parse an optional environment variable, falling back to `default`.
fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
