//! OAuth 2.0 Authorization Flow with PKCE
//!
//! Implements the authorization-code grant (RFC 6749) with PKCE (RFC 7636)
//! against Google's OAuth endpoints.
//!
//! # Overview
//!
//! The flow manager handles:
//! - Building the consent URL with the PKCE challenge and anti-CSRF state
//! - Exchanging the authorization code for tokens
//! - Refreshing access tokens
//! - Revoking tokens
//!
//! Receiving the browser redirect is the job of
//! [`CallbackServer`](crate::callback::CallbackServer).
//!
//! # Security
//!
//! - The code verifier never leaves the process; only its S256 challenge does
//! - The `state` returned by the callback must match the one sent
//! - Tokens, codes and verifiers are never logged
//!
//! # Example
//!
//! ```no_run
//! use core_auth::oauth::{OAuthConfig, OAuthFlowManager, PkceVerifier};
//! use std::sync::Arc;
//!
//! # async fn example(http_client: Arc<dyn bridge_traits::HttpClient>) -> core_auth::Result<()> {
//! let config = OAuthConfig::google("client-id.apps.googleusercontent.com", "GOCSPX-secret");
//! let flow = OAuthFlowManager::new(config, http_client);
//!
//! let verifier = PkceVerifier::new();
//! let auth_url = flow.build_auth_url(&verifier)?;
//! println!("Open {}", auth_url);
//! // ...receive `code` and `state` on the redirect URI...
//! # let (code, state) = ("code", verifier.state().to_string());
//! let token = flow.exchange_code(code, &state, &verifier).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::{expiry_after, Token};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/callback";

/// OAuth 2.0 client configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Optional for public clients
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
}

impl OAuthConfig {
    /// Google endpoints with the `cloud-platform` scope.
    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        let client_secret = client_secret.into();
        Self {
            client_id: client_id.into(),
            client_secret: (!client_secret.is_empty()).then_some(client_secret),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
        }
    }
}

/// PKCE code verifier paired with the anti-CSRF state of one flow.
///
/// # Security
///
/// The verifier must stay in the process. Only [`challenge`](Self::challenge)
/// is sent to the authorization server.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
    state: String,
}

impl PkceVerifier {
    /// Generate a fresh verifier (32 random bytes) and state.
    ///
    /// The state combines the current time in nanoseconds with 16 random
    /// bytes, so it differs between consecutive flows even within one process.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        // 43 characters after encoding, within RFC 7636's 43..=128
        let mut verifier_bytes = [0u8; 32];
        rng.fill(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let mut state_bytes = [0u8; 16];
        rng.fill(&mut state_bytes);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let state = format!("{}-{}", nanos, URL_SAFE_NO_PAD.encode(state_bytes));

        Self { verifier, state }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// S256 challenge: BASE64URL(SHA256(code_verifier))
    pub fn challenge(&self) -> String {
        let hash = Sha256::digest(self.verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("verifier", &"[REDACTED]")
            .field("state", &self.state)
            .finish()
    }
}

/// Runs the token-endpoint side of the OAuth 2.0 flow.
pub struct OAuthFlowManager {
    config: OAuthConfig,
    http_client: Arc<dyn HttpClient>,
}

impl OAuthFlowManager {
    pub fn new(config: OAuthConfig, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            config,
            http_client,
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Use `redirect_uri` for subsequent authorization URLs and code exchanges.
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.config.redirect_uri = redirect_uri.into();
        self
    }

    /// Send one request to an OAuth endpoint.
    ///
    /// Token and revocation calls are never retried here: a failure goes back
    /// to the caller, which decides whether to try again.
    async fn send(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        self.http_client
            .execute_with_retry(request, RetryPolicy::none())
            .await
    }

    /// Build the consent URL for `verifier`.
    ///
    /// Requests offline access and forces the consent prompt so Google
    /// always returns a refresh token.
    #[instrument(skip(self, verifier))]
    pub fn build_auth_url(&self, verifier: &PkceVerifier) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|e| AuthError::Other(format!("Invalid auth URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", verifier.state())
            .append_pair("code_challenge", &verifier.challenge())
            .append_pair("code_challenge_method", "S256")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");

        debug!("Built authorization URL");
        Ok(url.to_string())
    }

    /// Exchange an authorization code for a token.
    ///
    /// Fails with [`AuthError::StateMismatch`] before any network call when
    /// `state` is not the one issued with `verifier`.
    #[instrument(skip(self, code, verifier))]
    pub async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        verifier: &PkceVerifier,
    ) -> Result<Token> {
        if state != verifier.state() {
            warn!("OAuth state mismatch on code exchange");
            return Err(AuthError::StateMismatch {
                expected: verifier.state().to_string(),
                actual: state.to_string(),
            });
        }

        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier.verifier()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        debug!("Exchanging authorization code for tokens");

        let request = HttpRequest::new(HttpMethod::Post, self.config.token_url.clone())
            .form(&params)
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;

        let response = self.send(request).await?;

        if !response.is_success() {
            let error_body = error_text(&response);
            warn!(
                status = response.status,
                error = %error_body,
                "Token exchange failed"
            );
            return Err(AuthError::TokenExchangeFailed(format!(
                "Token endpoint returned {}: {}",
                response.status, error_body
            )));
        }

        let token_response: TokenResponse = response.json().map_err(|e| {
            AuthError::TokenExchangeFailed(format!("Failed to parse token response: {}", e))
        })?;

        info!(
            expires_in = token_response.expires_in,
            has_refresh_token = token_response.refresh_token.is_some(),
            "Exchanged authorization code for tokens"
        );

        token_response
            .into_token(None, Utc::now())
            .ok_or_else(|| AuthError::TokenExchangeFailed(out_of_range_lifetime()))
    }

    /// Obtain a new access token from `refresh_token`.
    ///
    /// Sends a single request; any non-success status or transport failure
    /// is returned as [`AuthError::TokenRefreshFailed`]. When the response
    /// omits a refresh token the old one is kept.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<Token> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let request = HttpRequest::new(HttpMethod::Post, self.config.token_url.clone())
            .form(&params)
            .map_err(|e| AuthError::TokenRefreshFailed(e.to_string()))?;

        debug!("Refreshing access token");

        let response = self
            .send(request)
            .await
            .map_err(|e| AuthError::TokenRefreshFailed(e.to_string()))?;

        if !response.is_success() {
            let error_body = error_text(&response);
            warn!(status = response.status, error = %error_body, "Token refresh failed");
            return Err(AuthError::TokenRefreshFailed(format!(
                "Token endpoint returned {}: {}",
                response.status, error_body
            )));
        }

        let token_response: TokenResponse = response.json().map_err(|e| {
            AuthError::TokenRefreshFailed(format!("Failed to parse token response: {}", e))
        })?;

        info!(
            expires_in = token_response.expires_in,
            "Refreshed access token"
        );
        token_response
            .into_token(Some(refresh_token), Utc::now())
            .ok_or_else(|| AuthError::TokenRefreshFailed(out_of_range_lifetime()))
    }

    /// Revoke `token` (access or refresh) at the provider.
    ///
    /// A token the provider no longer recognises counts as revoked.
    #[instrument(skip(self, token))]
    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        let request = HttpRequest::new(HttpMethod::Post, self.config.revoke_url.clone())
            .form(&[("token", token)])
            .map_err(|e| AuthError::TokenRevocationFailed(e.to_string()))?;

        let response = self
            .send(request)
            .await
            .map_err(|e| AuthError::TokenRevocationFailed(e.to_string()))?;

        if response.is_success() {
            info!("Token revoked");
            return Ok(());
        }

        let error_body = error_text(&response);
        if response.status == 400 && error_body.contains("invalid_token") {
            warn!("Token was already invalid at the provider");
            return Ok(());
        }

        warn!(status = response.status, error = %error_body, "Token revocation failed");
        Err(AuthError::TokenRevocationFailed(format!(
            "Revocation endpoint returned {}: {}",
            response.status, error_body
        )))
    }
}

pub(crate) fn out_of_range_lifetime() -> String {
    "Token endpoint returned an out-of-range expires_in".to_string()
}

fn error_text(response: &HttpResponse) -> String {
    response
        .text()
        .unwrap_or_else(|_| "Unable to read error response".to_string())
}

/// Token endpoint response body.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub(crate) expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) scope: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

impl TokenResponse {
    /// Convert to a [`Token`] issued at `now`, keeping `previous_refresh`
    /// when none was issued.
    ///
    /// `None` when `expires_in` puts the expiry outside the representable range.
    pub(crate) fn into_token(
        self,
        previous_refresh: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Token> {
        let expiry = expiry_after(now, self.expires_in)?;
        let refresh_token = self
            .refresh_token
            .filter(|token| !token.is_empty())
            .or_else(|| previous_refresh.map(str::to_string));
        let token_type = self
            .token_type
            .filter(|token_type| !token_type.is_empty())
            .unwrap_or_else(|| "Bearer".to_string());
        Some(Token {
            access_token: self.access_token,
            refresh_token,
            token_type,
            expiry: Some(expiry),
        })
    }
}
