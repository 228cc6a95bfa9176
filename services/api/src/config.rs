use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use vocab_core::phase::{PhaseId, default_order, parse_order};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Chat completion backends. Both are reached through an OpenAI-compatible API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub prompt_server_url: Option<String>,
    pub prompt_namespace: String,
    pub prompt_env: String,
    pub prompt_locale: String,
    pub prompt_cache_ttl: Duration,
    pub phase_order: Vec<PhaseId>,
    pub phase_max_turns: u32,
    pub phase_max_duration: Duration,
    pub farewell_timeout: Duration,
    pub warm_return_after: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:3000");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let provider = match var_or("LLM_PROVIDER", "openai").to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not 'openai' or 'gemini'", other),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = var_or("CHAT_MODEL", "gpt-4.1");

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = PathBuf::from(var_or("PROMPTS_PATH", "./prompts"));
        let prompt_server_url = std::env::var("PROMPT_SERVER_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let phase_order = match std::env::var("PHASE_ORDER") {
            Ok(raw) => {
                let order = parse_order(&raw);
                if order.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "PHASE_ORDER".to_string(),
                        "no phase ids given".to_string(),
                    ));
                }
                order
            }
            Err(_) => default_order(),
        };

        let phase_max_turns = parse_var("PHASE_MAX_TURNS", 40u32)?;
        if phase_max_turns == 0 {
            return Err(ConfigError::InvalidValue(
                "PHASE_MAX_TURNS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let warm_return_hours = parse_var("WARM_RETURN_AFTER_HOURS", 24u64)?;
        let warm_return_after = warm_return_hours
            .checked_mul(60 * 60)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "WARM_RETURN_AFTER_HOURS".to_string(),
                    format!("{} hours is too large", warm_return_hours),
                )
            })?;

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            database_url,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            log_level,
            prompts_path,
            prompt_server_url,
            prompt_namespace: var_or("PROMPT_NAMESPACE", "public"),
            prompt_env: var_or("PROMPT_ENV", "dev"),
            prompt_locale: var_or("PROMPT_LOCALE", "zh-CN"),
            prompt_cache_ttl: Duration::from_secs(parse_var("PROMPT_CACHE_TTL_SECS", 300u64)?),
            phase_order,
            phase_max_turns,
            phase_max_duration: Duration::from_secs(parse_var("PHASE_MAX_SECS", 900u64)?),
            farewell_timeout: Duration::from_secs(parse_var("FAREWELL_TIMEOUT_SECS", 15u64)?),
            warm_return_after,
            retry_max_attempts: parse_var("RETRY_MAX_ATTEMPTS", 3u32)?,
            retry_base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", 200u64)?),
        })
    }
}
