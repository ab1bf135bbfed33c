//! API key credentials.

use crate::client::{ApiKeyCredential, AuthenticatedClient};
use crate::config::{ENV_API_KEY, FLAG_API_KEY};
use crate::error::{AuthError, Result};
use crate::provider::CredentialProvider;
use crate::types::AuthMethod;
use async_trait::async_trait;
use bridge_traits::http::HttpClient;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Prefixes of the Google credential formats an API key is usually pasted from.
pub const KNOWN_KEY_PREFIXES: [&str; 3] = ["AIza", "GOCSPX-", "ya29."];

const MIN_KEY_LEN: usize = 20;
const MAX_KEY_LEN: usize = 100;
const MIN_PREFIXED_KEY_LEN: usize = 35;
const MAX_PREFIXED_KEY_LEN: usize = 50;

/// Loose format check for an API key.
///
/// Keys with a known prefix must be 35 to 50 bytes long; anything else must
/// be 20 to 100 bytes.
///
/// ```
/// use core_auth::providers::api_key::is_plausible_api_key;
///
/// assert!(is_plausible_api_key("AIzaSyA1234567890abcdefghijklmnopqrs"));
/// assert!(!is_plausible_api_key("AIza-too-short"));
/// assert!(!is_plausible_api_key("short"));
/// ```
pub fn is_plausible_api_key(key: &str) -> bool {
    let len = key.len();
    if KNOWN_KEY_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
    {
        (MIN_PREFIXED_KEY_LEN..=MAX_PREFIXED_KEY_LEN).contains(&len)
    } else {
        (MIN_KEY_LEN..=MAX_KEY_LEN).contains(&len)
    }
}

/// Show the first and last four characters of `key`.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

pub struct ApiKeyProvider {
    key: RwLock<String>,
    http: Arc<dyn HttpClient>,
    client: Mutex<Option<AuthenticatedClient>>,
}

impl ApiKeyProvider {
    pub fn new(key: impl Into<String>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            key: RwLock::new(key.into().trim().to_string()),
            http,
            client: Mutex::new(None),
        }
    }

    /// Replace the key. A cached client is closed and rebuilt on next use.
    pub async fn set_api_key(&self, key: impl Into<String>) {
        *self.key.write().await = key.into().trim().to_string();
        if let Some(client) = self.client.lock().await.take() {
            client.close();
        }
        debug!("API key replaced");
    }

    pub async fn masked_key(&self) -> String {
        mask_api_key(&self.key.read().await)
    }

    fn not_configured() -> AuthError {
        AuthError::NotConfigured {
            method: AuthMethod::ApiKey,
            message: format!(
                "set {} or pass {} with a valid key (20 to 100 characters, \
                 35 to 50 for keys starting with AIza)",
                ENV_API_KEY, FLAG_API_KEY
            ),
        }
    }
}

impl fmt::Debug for ApiKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyProvider")
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialProvider for ApiKeyProvider {
    fn method(&self) -> AuthMethod {
        AuthMethod::ApiKey
    }

    async fn is_configured(&self) -> bool {
        let key = self.key.read().await;
        !key.is_empty() && is_plausible_api_key(&key)
    }

    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        if !self.is_configured().await {
            return Err(Self::not_configured());
        }
        let masked = self.masked_key().await;
        info!(key = %masked, "Using API key authentication");
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

        let key = self.key.read().await.clone();
        if !is_plausible_api_key(&key) {
            return Err(Self::not_configured());
        }

        let client = AuthenticatedClient::new(self.http.clone(), Arc::new(ApiKeyCredential::new(key)));
        *cached = Some(client.clone());
        Ok(client)
    }

    async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{json_response, MockHttpClient};
    use crate::client::API_KEY_HEADER;
    use bridge_traits::http::{HttpMethod, HttpRequest};

    const VALID_KEY: &str = "AIzaSyA1234567890abcdefghijklmnopqrs";

    fn provider(key: &str, mock: MockHttpClient) -> ApiKeyProvider {
        ApiKeyProvider::new(key, Arc::new(mock))
    }

    #[test]
    fn test_plausible_key_lengths() {
        assert_eq!(VALID_KEY.len(), 36);
        assert!(is_plausible_api_key(VALID_KEY));
        assert!(is_plausible_api_key(&format!("AIza{}", "x".repeat(35))));
        assert!(!is_plausible_api_key(&format!("AIza{}", "x".repeat(60))));
        assert!(is_plausible_api_key(&"k".repeat(20)));
        assert!(!is_plausible_api_key(&"k".repeat(19)));
        assert!(!is_plausible_api_key(&"k".repeat(101)));
        assert!(!is_plausible_api_key(""));
    }

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key(VALID_KEY), "AIza...pqrs");
        assert_eq!(mask_api_key("short"), "*****");
    }

    #[tokio::test]
    async fn test_empty_key_not_configured() {
        let provider = provider("   ", MockHttpClient::new());
        assert!(!provider.is_configured().await);

        let err = provider
            .authenticate(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
        assert!(err.to_string().contains(ENV_API_KEY));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_authenticate_future_is_send() {
        let provider = provider(VALID_KEY, MockHttpClient::new());
        let cancel = CancellationToken::new();

        let authenticate = ApiKeyProvider::authenticate(&provider, &cancel);
        assert_send(&authenticate);
        authenticate.await.unwrap();

        let handle = tokio::spawn(async move {
            provider.authenticate(&CancellationToken::new()).await
        });
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_format_accepted() {
        let provider = provider("not-a-google-key-but-long-enough", MockHttpClient::new());
        assert!(provider.is_configured().await);
        provider.authenticate(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_prefixed_key_not_configured() {
        let provider = provider("AIza-only-twenty-four-ch", MockHttpClient::new());
        assert!(!provider.is_configured().await);

        let cancel = CancellationToken::new();
        assert!(provider.authenticate(&cancel).await.unwrap_err().is_configuration());
        assert!(provider.client(&cancel).await.unwrap_err().is_configuration());
    }

    #[test]
    fn test_debug_hides_key() {
        let provider = provider(VALID_KEY, MockHttpClient::new());
        assert!(!format!("{:?}", provider).contains(VALID_KEY));
    }

    #[tokio::test]
    async fn test_client_is_cached_and_sends_key() {
        let mut mock = MockHttpClient::new();
        mock.expect_execute()
            .times(1)
            .withf(|req| req.headers.get(API_KEY_HEADER).map(String::as_str) == Some(VALID_KEY))
            .returning(|_| Ok(json_response(200, "{}")));

        let provider = provider(VALID_KEY, mock);
        let cancel = CancellationToken::new();
        let first = provider.client(&cancel).await.unwrap();
        let second = provider.client(&cancel).await.unwrap();

        first
            .execute(HttpRequest::new(HttpMethod::Get, "https://example.com"))
            .await
            .unwrap();
        first.close();
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn test_set_api_key_invalidates_client() {
        let provider = provider(VALID_KEY, MockHttpClient::new());
        let cancel = CancellationToken::new();
        let old = provider.client(&cancel).await.unwrap();

        provider.set_api_key("AIzaSyB0987654321zyxwvutsrqponmlkji").await;
        assert!(old.is_closed());

        let new = provider.client(&cancel).await.unwrap();
        assert!(!new.is_closed());
        assert_eq!(provider.masked_key().await, "AIza...lkji");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let provider = provider(VALID_KEY, MockHttpClient::new());
        let client = provider.client(&CancellationToken::new()).await.unwrap();

        provider.close().await;
        provider.close().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = provider(VALID_KEY, MockHttpClient::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            provider.client(&cancel).await.unwrap_err(),
            AuthError::Cancelled
        ));
    }
}
