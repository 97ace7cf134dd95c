use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;

use crate::constants::{DEFAULT_API_URL, DEFAULT_AUTHORIZE_URL, DEFAULT_CLIENT_ID, DEFAULT_TOKEN_URL};
use crate::error::ProxyError;

/// Prefix shared by every configuration variable
pub const ENV_PREFIX: &str = "ANTHROPIC_PROXY_";

/// CORS configuration mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsMode {
    /// Only allow localhost origins (default)
    LocalhostOnly,
    /// Allow all origins
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

/// OAuth client settings for the upstream authorization server
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub token_file: PathBuf,
    pub oauth: OAuthConfig,
    /// Base URL of the upstream API, without the `/messages` suffix
    pub api_url: String,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    /// Extra `alias=model` pairs layered over the built-in table
    pub model_aliases: Vec<(String, String)>,
    pub cors_mode: CorsMode,
    /// Optional shared key required on `/v1/*`
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ProxyError> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Build the configuration from a variable lookup keyed by unprefixed names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ProxyError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(var("PORT"), "PORT", 8100)?;
        let log_level = var("LOG_LEVEL")
            .map(|l| l.to_lowercase())
            .unwrap_or_else(|| "info".to_string());

        let token_file = var("TOKEN_FILE").map(PathBuf::from).unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("anthropic-max-proxy")
                .join("tokens.json")
        });

        let oauth = OAuthConfig {
            client_id: var("CLIENT_ID").unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            authorize_url: var("OAUTH_URL").unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string()),
            token_url: var("TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
        };

        let api_url = var("API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let request_timeout =
            Duration::from_secs(parse_or(var("REQUEST_TIMEOUT_SECS"), "REQUEST_TIMEOUT_SECS", 120)?);
        let stream_idle_timeout = Duration::from_secs(parse_or(
            var("STREAM_IDLE_TIMEOUT_SECS"),
            "STREAM_IDLE_TIMEOUT_SECS",
            120,
        )?);

        let model_aliases = match var("MODEL_ALIASES") {
            Some(raw) => parse_model_aliases(&raw)?,
            None => Vec::new(),
        };

        // "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match var("CORS_ORIGINS").as_deref() {
            Some("*") => CorsMode::AllowAll,
            Some("localhost") | None => CorsMode::LocalhostOnly,
            Some(origins) => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
        };

        Ok(Self {
            host,
            port,
            log_level,
            token_file,
            oauth,
            api_url,
            request_timeout,
            stream_idle_timeout,
            model_aliases,
            cors_mode,
            api_key: var("API_KEY"),
        })
    }

    pub fn messages_url(&self) -> String {
        format!("{}/messages", self.api_url)
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    name: &str,
    default: T,
) -> Result<T, ProxyError> {
    match value {
        Some(v) => v.trim().parse().map_err(|_| {
            ProxyError::ConfigError(format!("{ENV_PREFIX}{name} has an invalid value: {v}"))
        }),
        None => Ok(default),
    }
}

/// Parse `alias=model-id,alias2=model-id2`
fn parse_model_aliases(raw: &str) -> Result<Vec<(String, String)>, ProxyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (alias, model) = entry
                .split_once('=')
                .map(|(a, m)| (a.trim(), m.trim()))
                .filter(|(a, m)| !a.is_empty() && !m.is_empty())
                .ok_or_else(|| {
                    ProxyError::ConfigError(format!(
                        "{ENV_PREFIX}MODEL_ALIASES entry must look like alias=model, got: {entry}"
                    ))
                })?;
            Ok((alias.to_string(), model.to_string()))
        })
        .collect()
}
