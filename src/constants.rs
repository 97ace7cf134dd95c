/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta features required for OAuth-authenticated subscription access
pub const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20,claude-code-20250219,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";

/// User agent string for upstream requests
pub const USER_AGENT: &str = concat!("anthropic-max-proxy/", env!("CARGO_PKG_VERSION"));

/// Public OAuth client ID used by Claude subscription clients
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1";

pub const OAUTH_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
pub const OAUTH_SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Tokens closer than this to expiry are refreshed before use (seconds)
pub const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

/// Used when the caller sends neither `max_tokens` nor `max_completion_tokens`
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Fixed `created` timestamp reported by `/v1/models`
pub const MODELS_CREATED_AT: u64 = 1_700_000_000;
