//! Service-account key file credentials.
//!
//! The key file is validated on every configuration check; nothing parsed
//! from it is cached except by the token source a client is built from.
//! Access tokens are minted with the JWT-bearer grant: an RS256 assertion
//! signed with the account's private key is exchanged at the key's
//! `token_uri`, and a new one is minted whenever the current token expires.

use crate::client::{bearer, AuthenticatedClient, CredentialSource};
use crate::config::{ENV_SERVICE_ACCOUNT, FLAG_SERVICE_ACCOUNT};
use crate::error::{AuthError, Result};
use crate::oauth::{out_of_range_lifetime, TokenResponse, CLOUD_PLATFORM_SCOPE};
use crate::provider::{CredentialProvider, ProviderContext};
use crate::types::{AuthMethod, ServiceAccountKey, Token};
use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, RetryPolicy};
use bridge_traits::time::Clock;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for each signed assertion.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

pub struct ServiceAccountProvider {
    path: Option<PathBuf>,
    http: Arc<dyn HttpClient>,
    scopes: Vec<String>,
    client: Mutex<Option<AuthenticatedClient>>,
    ctx: ProviderContext,
}

impl ServiceAccountProvider {
    pub fn new(path: Option<PathBuf>, http: Arc<dyn HttpClient>, ctx: ProviderContext) -> Self {
        Self {
            path: path.filter(|p| !p.as_os_str().is_empty()),
            http,
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            client: Mutex::new(None),
            ctx,
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Project id from the key file, read fresh on every call.
    pub async fn project_id(&self) -> Result<String> {
        Ok(self.read_key().await?.project_id)
    }

    /// Client email from the key file, read fresh on every call.
    pub async fn client_email(&self) -> Result<String> {
        Ok(self.read_key().await?.client_email)
    }

    async fn read_key(&self) -> Result<ServiceAccountKey> {
        let path = self.path.as_deref().ok_or_else(Self::not_configured)?;
        ServiceAccountKey::from_file(path).await
    }

    /// Read and fully validate the key file.
    async fn load_key(&self) -> Result<(PathBuf, ServiceAccountKey)> {
        let path = self.path.clone().ok_or_else(Self::not_configured)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AuthError::NotConfigured {
                method: AuthMethod::ServiceAccount,
                message: format!(
                    "key file {} does not exist; set {} or pass {} with a valid path",
                    path.display(),
                    ENV_SERVICE_ACCOUNT,
                    FLAG_SERVICE_ACCOUNT
                ),
            });
        }
        let key = ServiceAccountKey::from_file(&path).await?;
        key.validate(&path)?;
        Ok((path, key))
    }

    fn not_configured() -> AuthError {
        AuthError::NotConfigured {
            method: AuthMethod::ServiceAccount,
            message: format!(
                "set {} or pass {} with the path to a service account JSON key",
                ENV_SERVICE_ACCOUNT, FLAG_SERVICE_ACCOUNT
            ),
        }
    }
}

#[async_trait]
impl CredentialProvider for ServiceAccountProvider {
    fn method(&self) -> AuthMethod {
        AuthMethod::ServiceAccount
    }

    async fn is_configured(&self) -> bool {
        match self.load_key().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Service account not usable");
                false
            }
        }
    }

    #[instrument(skip(self, cancel))]
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        let (_, key) = self.load_key().await?;
        info!(project_id = %key.project_id, "Using service account authentication");
        Ok(())
    }

    async fn client(&self, cancel: &CancellationToken) -> Result<AuthenticatedClient> {
        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }

        let mut cached = self.client.lock().await;
        if let Some(client) = cached.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }

        let (path, key) = self.load_key().await?;
        let source = ServiceAccountTokenSource::new(
            path,
            key,
            self.scopes.clone(),
            self.http.clone(),
            self.ctx.clock.clone(),
        )?;
        let client = AuthenticatedClient::new(self.http.clone(), Arc::new(source));
        *cached = Some(client.clone());
        Ok(client)
    }

    async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close();
        }
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Mints and caches access tokens for one service account.
pub struct ServiceAccountTokenSource {
    path: PathBuf,
    client_email: String,
    private_key_id: String,
    token_uri: String,
    scope: String,
    signing_key: EncodingKey,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    token: Mutex<Option<Token>>,
}

impl ServiceAccountTokenSource {
    pub fn new(
        path: PathBuf,
        key: ServiceAccountKey,
        scopes: Vec<String>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            AuthError::InvalidServiceAccount {
                path: path.clone(),
                reason: format!("private_key is not a valid RSA PEM key: {}", e),
            }
        })?;

        Ok(Self {
            client_email: key.client_email.clone(),
            private_key_id: key.private_key_id.clone(),
            token_uri: key.token_uri_or_default().to_string(),
            scope: scopes.join(" "),
            signing_key,
            http,
            clock,
            token: Mutex::new(None),
            path,
        })
    }

    /// A currently valid access token, minting a new one when needed.
    pub async fn token(&self) -> Result<Token> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid_at(self.clock.now()) {
                return Ok(token.clone());
            }
            debug!("Service account access token expired");
        }

        let token = self.fetch_token().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    fn sign_assertion(&self) -> Result<String> {
        let iat = self.clock.unix_timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: &self.scope,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some("JWT".to_string());
        if !self.private_key_id.is_empty() {
            header.kid = Some(self.private_key_id.clone());
        }

        encode(&header, &claims, &self.signing_key).map_err(|e| AuthError::InvalidServiceAccount {
            path: self.path.clone(),
            reason: format!("failed to sign assertion: {}", e),
        })
    }

    #[instrument(skip(self), fields(token_uri = %self.token_uri))]
    async fn fetch_token(&self) -> Result<Token> {
        let assertion = self.sign_assertion()?;
        let request = HttpRequest::new(HttpMethod::Post, self.token_uri.clone())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;

        let response = self
            .http
            .execute_with_retry(request, RetryPolicy::none())
            .await?;
        if !response.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            warn!(status = response.status, error = %body, "Service account token request failed");
            return Err(AuthError::TokenExchangeFailed(format!(
                "Token endpoint returned {}: {}",
                response.status, body
            )));
        }

        let token_response: TokenResponse = response.json().map_err(|e| {
            AuthError::TokenExchangeFailed(format!("Failed to parse token response: {}", e))
        })?;

        let expires_in = token_response.expires_in;
        let token = token_response
            .into_token(None, self.clock.now())
            .ok_or_else(|| AuthError::TokenExchangeFailed(out_of_range_lifetime()))?;

        debug!(expires_in = expires_in, "Minted service account access token");
        Ok(token)
    }
}

#[async_trait]
impl CredentialSource for ServiceAccountTokenSource {
    fn method(&self) -> AuthMethod {
        AuthMethod::ServiceAccount
    }

    async fn apply(&self, request: HttpRequest) -> Result<HttpRequest> {
        let token = self.token().await?;
        Ok(bearer(request, &token.token_type, &token.access_token))
    }
}
