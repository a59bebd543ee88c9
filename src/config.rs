use std::env;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::services::gmail_service::GMAIL_API_BASE;

pub fn init_logging() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
}

pub const MODEL_NAME: &str = "llama3.2";
pub const SYSTEM_PROMPT: &str = "You are a helpful, concise assistant that manages the user's Gmail inbox.";

const OLLAMA_HOST: &str = "http://localhost";
const OLLAMA_PORT: u16 = 11434;
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Scopes requested during login.
pub const GOOGLE_SCOPES: &[&str] = &[
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
];

#[derive(Clone, Debug)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

#[derive(Clone, Debug)]
pub struct OllamaConfig {
    pub host: String,
    pub port: u16,
    pub model: String,
    pub timeout: Duration,
}

/// Limits used when the orchestrator talks to the mailbox.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub default_fetch_count: u32,
    pub max_fetch_count: u32,
    /// Size of the listing used to turn "#2" into an id.
    pub ordinal_refetch_limit: u32,
    pub categorize_batch: u32,
    pub digest_batch: u32,
    pub digest_query: String,
    pub query_context_turns: usize,
    pub history_window: usize,
    pub body_preview_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            default_fetch_count: 5,
            max_fetch_count: 50,
            ordinal_refetch_limit: 10,
            categorize_batch: 20,
            digest_batch: 20,
            digest_query: "newer_than:1d".to_string(),
            query_context_turns: 5,
            history_window: 10,
            body_preview_chars: 500,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_host: String,
    pub api_port: u16,
    pub gmail_api_base: String,
    pub mailbox_timeout: Duration,
    pub google: GoogleOAuthConfig,
    pub ollama: OllamaConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let google = GoogleOAuthConfig {
            client_id: required("GOOGLE_CLIENT_ID")?,
            client_secret: required("GOOGLE_CLIENT_SECRET")?,
            redirect_uri: url_var("GOOGLE_REDIRECT_URI", None)?,
            auth_url: url_var("GOOGLE_AUTH_URL", Some(GOOGLE_AUTH_URL))?,
            token_url: url_var("GOOGLE_TOKEN_URL", Some(GOOGLE_TOKEN_URL))?,
            userinfo_url: url_var("GOOGLE_USERINFO_URL", Some(GOOGLE_USERINFO_URL))?,
        };

        let ollama = OllamaConfig {
            host: url_var("OLLAMA_HOST", Some(OLLAMA_HOST))?.trim_end_matches('/').to_string(),
            port: parsed("OLLAMA_PORT", OLLAMA_PORT)?,
            model: optional("MODEL_NAME").unwrap_or_else(|| MODEL_NAME.to_string()),
            timeout: Duration::from_secs(parsed("AI_TIMEOUT_SECS", 60u64)?),
        };

        Ok(AppConfig {
            api_host: optional("API_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            api_port: parsed("API_PORT", 8000u16)?,
            gmail_api_base: url_var("GMAIL_API_BASE", Some(GMAIL_API_BASE))?,
            mailbox_timeout: Duration::from_secs(parsed("MAILBOX_TIMEOUT_SECS", 10u64)?),
            google,
            ollama,
            orchestrator: OrchestratorConfig::default(),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &str) -> Result<String> {
    optional(key).ok_or_else(|| anyhow!("{} must be set", key))
}

fn url_var(key: &str, default: Option<&str>) -> Result<String> {
    let value = match (optional(key), default) {
        (Some(v), _) => v,
        (None, Some(d)) => d.to_string(),
        (None, None) => return Err(anyhow!("{} must be set", key)),
    };
    Url::parse(&value).with_context(|| format!("{} is not a valid URL: {}", key, value))?;
    Ok(value)
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw.parse::<T>()
            .map_err(|e| anyhow!("{} has invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}
