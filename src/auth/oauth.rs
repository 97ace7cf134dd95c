use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use utoipa::ToSchema;

use super::storage::{CredentialRecord, TokenStore};
use crate::config::OAuthConfig;
use crate::constants::{OAUTH_REDIRECT_URI, OAUTH_SCOPES, TOKEN_REFRESH_MARGIN_SECS};
use crate::error::{AuthStep, ProxyError};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
    token_type: Option<String>,
}

impl TokenResponse {
    fn into_record(
        self,
        previous_refresh: Option<&str>,
        now: u64,
    ) -> Result<CredentialRecord, ProxyError> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .ok_or_else(|| ProxyError::AuthExchangeFailed("token response has no refresh_token".into()))?;

        Ok(CredentialRecord {
            access_token: self.access_token,
            refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: now + self.expires_in.max(1),
        })
    }
}

/// Why a token-endpoint call did not produce tokens
enum TokenError {
    /// The endpoint answered with a 4xx: the grant itself was refused
    Rejected { status: u16, body: String },
    /// Anything else (network, timeout, 5xx, garbage response)
    Transport(ProxyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    PendingAuthorization,
    Authenticated,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthStatus {
    pub state: AuthState,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_expired: Option<bool>,
    /// Set while the in-memory credential differs from the stored one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
}

/// What the operator needs to continue a freshly started flow.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone)]
struct PendingAuthorization {
    verifier: String,
    state: String,
}

#[derive(Debug, Default)]
struct Session {
    record: Option<CredentialRecord>,
    pending: Option<PendingAuthorization>,
    /// Set when a refresh was rejected; cleared by a new flow or logout
    refresh_failure: Option<String>,
    /// Set when `record` could not be written to the store
    persist_error: Option<String>,
}

impl Session {
    fn state(&self) -> AuthState {
        if self.pending.is_some() {
            AuthState::PendingAuthorization
        } else if self.record.is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    fn missing_credentials(&self) -> ProxyError {
        if let Some(reason) = &self.refresh_failure {
            ProxyError::RefreshFailed(reason.clone())
        } else if self.pending.is_some() {
            ProxyError::AuthRequired {
                step: AuthStep::Callback,
            }
        } else {
            ProxyError::AuthRequired {
                step: AuthStep::Start,
            }
        }
    }
}

/// Outcome of the last refresh, handed to callers that queued behind it.
#[derive(Default)]
struct RefreshSlot {
    last: Option<Result<String, ProxyError>>,
}

/// Owns the OAuth state machine and the credential record.
///
/// Every mutation of the credential (exchange, refresh, logout) runs under
/// `refresh_gate`. Callers that saw the stale token before a refresh
/// finished take its outcome from the gate, success or failure, so at most
/// one refresh reaches the token endpoint per expiry no matter how many
/// requests observe the stale token.
pub struct OAuthManager {
    client: Client,
    config: OAuthConfig,
    store: TokenStore,
    request_timeout: Duration,
    session: RwLock<Session>,
    refresh_gate: Mutex<RefreshSlot>,
    /// Bumped under `refresh_gate` each time a refresh completes
    refresh_generation: AtomicU64,
}

impl OAuthManager {
    pub async fn new(
        client: Client,
        config: OAuthConfig,
        store: TokenStore,
        request_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let record = store.load().await?;
        if record.is_some() {
            info!("Loaded OAuth credentials from {}", store.path().display());
        } else {
            warn!("No OAuth credentials found. Visit /auth/start to begin the OAuth flow.");
        }

        Ok(Self {
            client,
            config,
            store,
            request_timeout,
            session: RwLock::new(Session {
                record,
                ..Session::default()
            }),
            refresh_gate: Mutex::new(RefreshSlot::default()),
            refresh_generation: AtomicU64::new(0),
        })
    }

    fn random_token() -> String {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn generate_challenge(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let hash = hasher.finalize();
        URL_SAFE_NO_PAD.encode(hash)
    }

    /// Begin a new authorization flow, replacing any pending one.
    pub async fn start_flow(&self) -> AuthorizationRequest {
        let verifier = Self::random_token();
        let state = Self::random_token();
        let challenge = Self::generate_challenge(&verifier);

        let url = format!(
            "{}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
            self.config.authorize_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(OAUTH_REDIRECT_URI),
            urlencoding::encode(OAUTH_SCOPES),
            challenge,
            state
        );

        let mut session = self.session.write().await;
        session.pending = Some(PendingAuthorization {
            verifier,
            state: state.clone(),
        });
        session.refresh_failure = None;
        info!("OAuth flow started, waiting for authorization code");

        AuthorizationRequest { url, state }
    }

    /// Exchange a `code#state` string pasted by the operator for credentials.
    pub async fn complete_flow(&self, code: &str) -> Result<CredentialRecord, ProxyError> {
        let (actual_code, state) = split_code(code)?;

        let pending = self.session.read().await.pending.clone().ok_or(
            ProxyError::AuthRequired {
                step: AuthStep::Start,
            },
        )?;

        if !bool::from(state.as_bytes().ct_eq(pending.state.as_bytes())) {
            return Err(ProxyError::AuthExchangeFailed(
                "state does not match the pending authorization flow".into(),
            ));
        }

        let body = json!({
            "code": actual_code,
            "state": state,
            "grant_type": "authorization_code",
            "client_id": self.config.client_id,
            "redirect_uri": OAUTH_REDIRECT_URI,
            "code_verifier": pending.verifier,
        });

        let token = match self.request_token(&body).await {
            Ok(t) => t,
            Err(TokenError::Rejected { status, body }) => {
                warn!("Authorization code rejected ({status})");
                return Err(ProxyError::AuthExchangeFailed(format!(
                    "token endpoint returned {status}: {}",
                    truncate(&body)
                )));
            }
            Err(TokenError::Transport(e)) => return Err(e),
        };

        let record = token.into_record(None, now_secs())?;

        let _gate = self.refresh_gate.lock().await;
        {
            let session = self.session.read().await;
            if session.pending.as_ref().map(|p| p.state.as_str()) != Some(state) {
                return Err(ProxyError::AuthExchangeFailed(
                    "authorization flow was restarted during the exchange".into(),
                ));
            }
        }

        self.store.save(&record).await?;

        let mut session = self.session.write().await;
        session.record = Some(record.clone());
        session.pending = None;
        session.refresh_failure = None;
        session.persist_error = None;
        info!("OAuth flow completed, credentials stored");

        Ok(record)
    }

    /// Current access token, refreshed first if it is inside the safety margin.
    pub async fn get_valid_token(&self) -> Result<String, ProxyError> {
        self.retry_persist().await;

        let seen = self.refresh_generation.load(Ordering::Acquire);
        if let Some(token) = self.fresh_token().await? {
            return Ok(token);
        }

        let mut gate = self.refresh_gate.lock().await;

        // Whoever held the gate before us may already have refreshed
        if let Some(token) = self.fresh_token().await? {
            return Ok(token);
        }

        // ... or tried and failed, in which case we fail the same way
        if self.refresh_generation.load(Ordering::Acquire) != seen
            && let Some(outcome) = &gate.last
        {
            return outcome.clone();
        }

        let refresh_token = {
            let session = self.session.read().await;
            match &session.record {
                Some(record) => record.refresh_token.clone(),
                None => return Err(session.missing_credentials()),
            }
        };

        let outcome = self.refresh(&refresh_token).await;
        gate.last = Some(outcome.clone());
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Write the in-memory record again if the last save after a refresh failed.
    /// The token endpoint rotates refresh tokens, so the stored one is already dead.
    async fn retry_persist(&self) {
        if self.session.read().await.persist_error.is_none() {
            return;
        }

        let _gate = self.refresh_gate.lock().await;
        let record = {
            let session = self.session.read().await;
            match (&session.persist_error, &session.record) {
                (Some(_), Some(record)) => record.clone(),
                _ => return,
            }
        };

        let result = self.store.save(&record).await;
        let mut session = self.session.write().await;
        match result {
            Ok(()) => {
                info!("Refreshed credentials persisted");
                session.persist_error = None;
            }
            Err(e) => {
                error!("Refreshed token still could not be persisted: {e}");
                session.persist_error = Some(e.to_string());
            }
        }
    }

    async fn fresh_token(&self) -> Result<Option<String>, ProxyError> {
        let session = self.session.read().await;
        match &session.record {
            Some(record) if record.is_fresh(now_secs(), TOKEN_REFRESH_MARGIN_SECS) => {
                Ok(Some(record.access_token.clone()))
            }
            Some(_) => Ok(None),
            None => Err(session.missing_credentials()),
        }
    }

    /// Must be called with `refresh_gate` held.
    async fn refresh(&self, refresh_token: &str) -> Result<String, ProxyError> {
        info!("Refreshing OAuth access token");

        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.config.client_id,
        });

        match self.request_token(&body).await {
            Ok(token) => {
                let record = token.into_record(Some(refresh_token), now_secs())?;
                let access = record.access_token.clone();
                let saved = self.store.save(&record).await;

                let mut session = self.session.write().await;
                session.record = Some(record);
                session.persist_error = match saved {
                    Ok(()) => None,
                    Err(e) => {
                        error!("Refreshed token could not be persisted, will retry: {e}");
                        Some(e.to_string())
                    }
                };
                Ok(access)
            }
            Err(TokenError::Rejected { status, body }) => {
                warn!("OAuth refresh token rejected ({status}), clearing stored credentials");
                let reason = format!("token endpoint returned {status}: {}", truncate(&body));
                if let Err(e) = self.store.clear().await {
                    error!("Failed to clear rejected credentials: {e}");
                }
                let mut session = self.session.write().await;
                session.record = None;
                session.pending = None;
                session.refresh_failure = Some(reason.clone());
                session.persist_error = None;
                Err(ProxyError::RefreshFailed(reason))
            }
            Err(TokenError::Transport(e)) => {
                warn!("OAuth refresh failed, keeping stored credentials: {e}");
                Err(e)
            }
        }
    }

    async fn request_token(&self, body: &Value) -> Result<TokenResponse, TokenError> {
        let response = self
            .client
            .post(&self.config.token_url)
            .header("content-type", "application/json")
            .json(body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| TokenError::Transport(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                TokenError::Rejected {
                    status: status.as_u16(),
                    body: text,
                }
            } else {
                TokenError::Transport(ProxyError::from_upstream(status.as_u16(), &text))
            });
        }

        response.json::<TokenResponse>().await.map_err(|e| {
            TokenError::Transport(ProxyError::UpstreamError {
                status: status.as_u16(),
                code: "invalid_token_response".into(),
                message: e.to_string(),
            })
        })
    }

    pub async fn logout(&self) -> Result<(), ProxyError> {
        let _gate = self.refresh_gate.lock().await;
        self.store.clear().await?;
        *self.session.write().await = Session::default();
        info!("OAuth credentials cleared");
        Ok(())
    }

    pub async fn status(&self) -> AuthStatus {
        let session = self.session.read().await;
        let now = now_secs();
        let record = session.record.as_ref();
        AuthStatus {
            state: session.state(),
            authenticated: record.is_some(),
            expires_at: record.map(|r| r.expires_at),
            expires_in_secs: record.map(|r| r.remaining_secs(now)),
            is_expired: record.map(|r| !r.is_fresh(now, TOKEN_REFRESH_MARGIN_SECS)),
            persist_error: session.persist_error.clone(),
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.read().await.record.is_some()
    }
}

/// Split the `code#state` string shown to the operator after authorizing.
fn split_code(code: &str) -> Result<(&str, &str), ProxyError> {
    match code.trim().split_once('#') {
        Some((code, state)) if !code.is_empty() && !state.is_empty() && !state.contains('#') => {
            Ok((code, state))
        }
        _ => Err(ProxyError::AuthExchangeFailed(
            "authorization code must have the form code#state".into(),
        )),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(256).collect()
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
