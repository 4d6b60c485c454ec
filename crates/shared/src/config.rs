use std::env;

use thiserror::Error;

use crate::chat::ChatSettings;
use crate::config_env::{
    optional_trimmed_env, parse_bool_env, parse_f32_env, parse_list_env, parse_u32_env,
    parse_u64_env, parse_usize_env, require_env,
};
use crate::documents::DocumentLimits;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_DATABASE_URL: &str = "sqlite://data/chat_history.db?mode=rwc";
const DEFAULT_CREDENTIAL_SALT: &str = "docchat-credential-salt-v1";
const DEFAULT_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:8080",
    "http://127.0.0.1:8080",
];

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub credential_secret: String,
    pub credential_salt: String,
    pub cors_origins: Vec<String>,
    pub rate_limit_requests: usize,
    pub rate_limit_window_seconds: u64,
    pub session_max_age_seconds: u64,
    pub session_sweep_interval_seconds: u64,
    pub documents: DocumentLimits,
    pub chat: ChatSettings,
    pub llm: LlmConfig,
}

/// Outbound completion provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub chat_completions_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub simulation_mode: bool,
    pub simulation_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            chat_completions_url: DEFAULT_CHAT_COMPLETIONS_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_ms: 30_000,
            max_retries: 2,
            retry_base_backoff_ms: 1_000,
            retry_max_backoff_ms: 10_000,
            simulation_mode: false,
            simulation_delay_ms: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid number in env var {0}")]
    ParseFloat(String),
    #[error("invalid boolean in env var {0}")]
    ParseBool(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let chat_defaults = ChatSettings::default();
        let document_defaults = DocumentLimits::default();

        let config = Self {
            bind_addr: env::var("API_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            database_url: optional_trimmed_env("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: parse_u32_env("DATABASE_MAX_CONNECTIONS", 5)?,
            credential_secret: require_env("CREDENTIAL_ENCRYPTION_SECRET")?,
            credential_salt: optional_trimmed_env("CREDENTIAL_ENCRYPTION_SALT")
                .unwrap_or_else(|| DEFAULT_CREDENTIAL_SALT.to_string()),
            cors_origins: parse_list_env("CORS_ORIGINS", DEFAULT_CORS_ORIGINS),
            rate_limit_requests: parse_usize_env("RATE_LIMIT_REQUESTS", 10)?,
            rate_limit_window_seconds: parse_u64_env("RATE_LIMIT_WINDOW_SECONDS", 60)?,
            session_max_age_seconds: parse_u64_env("SESSION_MAX_AGE_SECONDS", 24 * 3600)?,
            session_sweep_interval_seconds: parse_u64_env("SESSION_SWEEP_INTERVAL_SECONDS", 3600)?,
            documents: DocumentLimits {
                max_document_bytes: parse_usize_env(
                    "MAX_DOCUMENT_SIZE",
                    document_defaults.max_document_bytes,
                )?,
                max_chunk_chars: parse_usize_env(
                    "MAX_CHUNK_SIZE",
                    document_defaults.max_chunk_chars,
                )?,
            },
            chat: ChatSettings {
                history_fetch_limit: parse_u32_env(
                    "HISTORY_CONTEXT_LIMIT",
                    chat_defaults.history_fetch_limit,
                )?,
                history_prompt_turns: parse_usize_env(
                    "HISTORY_PROMPT_TURNS",
                    chat_defaults.history_prompt_turns,
                )?,
                document_context_chars: parse_usize_env(
                    "DOCUMENT_CONTEXT_CHARS",
                    chat_defaults.document_context_chars,
                )?,
                max_tokens: parse_u32_env("LLM_MAX_TOKENS", chat_defaults.max_tokens)?,
                temperature: parse_f32_env("LLM_TEMPERATURE", chat_defaults.temperature)?,
                ..chat_defaults
            },
            llm: parse_llm_config()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.credential_secret.trim().len() < 16 {
            return Err(ConfigError::InvalidConfiguration(
                "CREDENTIAL_ENCRYPTION_SECRET must be at least 16 characters".to_string(),
            ));
        }
        if self.rate_limit_requests == 0 || self.rate_limit_window_seconds == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "RATE_LIMIT_REQUESTS and RATE_LIMIT_WINDOW_SECONDS must be > 0".to_string(),
            ));
        }
        if self.documents.max_document_bytes == 0 || self.documents.max_chunk_chars == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "MAX_DOCUMENT_SIZE and MAX_CHUNK_SIZE must be > 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_TEMPERATURE must be between 0.0 and 2.0".to_string(),
            ));
        }
        if !self.llm.chat_completions_url.starts_with("http://")
            && !self.llm.chat_completions_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_CHAT_COMPLETIONS_URL must start with http:// or https://".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_llm_config() -> Result<LlmConfig, ConfigError> {
    let defaults = LlmConfig::default();

    Ok(LlmConfig {
        chat_completions_url: optional_trimmed_env("LLM_CHAT_COMPLETIONS_URL")
            .unwrap_or(defaults.chat_completions_url),
        model: optional_trimmed_env("LLM_MODEL").unwrap_or(defaults.model),
        timeout_ms: parse_u64_env("LLM_TIMEOUT_MS", defaults.timeout_ms)?,
        max_retries: parse_u32_env("LLM_MAX_RETRIES", defaults.max_retries)?,
        retry_base_backoff_ms: parse_u64_env(
            "LLM_RETRY_BASE_BACKOFF_MS",
            defaults.retry_base_backoff_ms,
        )?,
        retry_max_backoff_ms: parse_u64_env(
            "LLM_RETRY_MAX_BACKOFF_MS",
            defaults.retry_max_backoff_ms,
        )?,
        simulation_mode: parse_bool_env("LLM_SIMULATION_MODE", defaults.simulation_mode)?,
        simulation_delay_ms: parse_u64_env("LLM_SIMULATION_DELAY_MS", defaults.simulation_delay_ms)?,
    })
}
