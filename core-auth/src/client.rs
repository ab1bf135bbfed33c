//! Authenticated HTTP client handed to the speech API layer.
//!
//! An [`AuthenticatedClient`] pairs the host [`HttpClient`] with a
//! [`CredentialSource`] that stamps each outgoing request with the
//! credentials of the active method.

use crate::error::{AuthError, Result};
use crate::types::AuthMethod;
use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Header carrying an API key on Google Cloud requests.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Attaches credentials to outgoing requests.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn method(&self) -> AuthMethod;

    /// Return `request` with credentials applied. May fetch or refresh a token.
    async fn apply(&self, request: HttpRequest) -> Result<HttpRequest>;
}

/// Static API key credential.
pub struct ApiKeyCredential {
    key: String,
}

impl ApiKeyCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl CredentialSource for ApiKeyCredential {
    fn method(&self) -> AuthMethod {
        AuthMethod::ApiKey
    }

    async fn apply(&self, request: HttpRequest) -> Result<HttpRequest> {
        Ok(request.header(API_KEY_HEADER, self.key.clone()))
    }
}

/// Set the `Authorization` header for a token of `token_type`.
pub(crate) fn bearer(request: HttpRequest, token_type: &str, access_token: &str) -> HttpRequest {
    if token_type.is_empty() || token_type.eq_ignore_ascii_case("bearer") {
        request.bearer_token(access_token)
    } else {
        request.header("Authorization", format!("{} {}", token_type, access_token))
    }
}

/// HTTP client that authenticates every request.
///
/// Clones share the same closed flag: closing one closes all of them.
#[derive(Clone)]
pub struct AuthenticatedClient {
    http: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialSource>,
    closed: Arc<AtomicBool>,
}

impl AuthenticatedClient {
    pub fn new(http: Arc<dyn HttpClient>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            http,
            credentials,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.credentials.method()
    }

    /// Apply credentials without sending the request.
    pub async fn authorize(&self, request: HttpRequest) -> Result<HttpRequest> {
        self.ensure_open()?;
        self.credentials.apply(request).await
    }

    /// Apply credentials and send the request.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let request = self.authorize(request).await?;
        Ok(self.http.execute(request).await?)
    }

    /// Release the client. Later calls fail with [`AuthError::ClientClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(AuthError::ClientClosed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("method", &self.method())
            .field("closed", &self.is_closed())
            .finish()
    }
}
