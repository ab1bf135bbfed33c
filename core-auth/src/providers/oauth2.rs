//! OAuth2 authorization-code credentials.
//!
//! ## Lifecycle
//!
//! ```text
//! Unconfigured ──(client id + secret)──▶ NoToken ──login──▶ Authorizing ──▶ Authenticated
//!                                          │                    │
//!                                  TokenExpired ──refresh──▶ TokenValid
//! ```
//!
//! A stored token is reused while valid and refreshed on demand once it
//! expires. When no usable token exists, [`authenticate`] runs the browser
//! flow: it binds the loopback [`CallbackServer`], shows the consent URL,
//! waits for the redirect, exchanges the code and persists the token.
//!
//! The listener is shut down before `authenticate` returns on every path, and
//! nothing is persisted unless the code exchange succeeded.
//!
//! Concurrent CLI processes sharing one token file are not coordinated; the
//! last writer wins.
//!
//! [`authenticate`]: CredentialProvider::authenticate

use crate::callback::CallbackServer;
use crate::client::{bearer, AuthenticatedClient, CredentialSource};
use crate::config::{
    AuthConfig, ENV_OAUTH2_CLIENT_ID, ENV_OAUTH2_CLIENT_SECRET, FLAG_OAUTH2_CLIENT_ID,
    FLAG_OAUTH2_CLIENT_SECRET,
};
use crate::error::{AuthError, Result};
use crate::oauth::{OAuthConfig, OAuthFlowManager, PkceVerifier};
use crate::provider::{run_cancellable, CredentialProvider, ProviderContext};
use crate::token_store::TokenStore;
use crate::types::{AuthMethod, Token};
use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpRequest};
use core_runtime::events::AuthEvent;
use core_runtime::logging::strip_path;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upper bound on a single refresh, retries included.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

/// Observable state of the OAuth2 provider, for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuth2State {
    /// Client id or secret missing.
    Unconfigured,
    /// Credentials present, no readable token.
    NoToken,
    /// A token was loaded but has expired.
    TokenExpired,
    /// A token was loaded and is currently valid.
    TokenValid,
    /// Waiting for the browser redirect.
    Authorizing,
    /// Authenticated during this process with a currently valid token.
    Authenticated,
}

impl fmt::Display for OAuth2State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OAuth2State::Unconfigured => "not configured",
            OAuth2State::NoToken => "not logged in",
            OAuth2State::TokenExpired => "token expired",
            OAuth2State::TokenValid => "token valid",
            OAuth2State::Authorizing => "waiting for authorization",
            OAuth2State::Authenticated => "authenticated",
        };
        f.write_str(s)
    }
}

/// In-memory token backed by the token file.
struct TokenCache {
    flow: OAuthFlowManager,
    store: TokenStore,
    token: Mutex<Option<Token>>,
    ctx: ProviderContext,
}

impl TokenCache {
    /// The held token, loading it from disk on first use. Unreadable files
    /// count as absent.
    async fn load_into(&self, slot: &mut Option<Token>) -> Option<Token> {
        if slot.is_none() {
            match self.store.load().await {
                Ok(token) => *slot = token,
                Err(e) => warn!(error = %e, "Ignoring unreadable OAuth2 token file"),
            }
        }
        slot.clone()
    }

    async fn current(&self) -> Option<Token> {
        let mut slot = self.token.lock().await;
        self.load_into(&mut slot).await
    }

    /// A token that is valid right now, refreshing an expired one.
    async fn valid_token(&self, cancel: &CancellationToken) -> Result<Token> {
        let mut slot = self.token.lock().await;
        let token = self
            .load_into(&mut slot)
            .await
            .ok_or_else(|| self.no_token_error())?;

        if token.is_valid_at(self.ctx.clock.now()) {
            return Ok(token);
        }
        let refresh_token = token
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NoRefreshToken)?;

        let refreshed = self.refresh(refresh_token, cancel).await?;
        *slot = Some(refreshed.clone());
        Ok(refreshed)
    }

    async fn refresh(&self, refresh_token: &str, cancel: &CancellationToken) -> Result<Token> {
        let method = AuthMethod::OAuth2.as_str().to_string();
        self.ctx.emit(AuthEvent::TokenRefreshing {
            method: method.clone(),
        });

        let refreshed = run_cancellable(cancel, async {
            tokio::time::timeout(REFRESH_TIMEOUT, self.flow.refresh_access_token(refresh_token))
                .await
                .map_err(|_| AuthError::OperationTimeout {
                    operation: "refreshing OAuth2 token".to_string(),
                })?
        })
        .await?;

        // The refreshed token is usable even if it cannot be written back.
        if let Err(e) = self.store.save(&refreshed).await {
            warn!(error = %e, "Failed to persist refreshed OAuth2 token");
        }

        self.ctx.emit(AuthEvent::TokenRefreshed {
            method,
            expires_at: refreshed.effective_expiry().map(|e| e.timestamp()),
        });
        Ok(refreshed)
    }

    async fn replace(&self, token: Token) -> Result<()> {
        self.store.save(&token).await?;
        *self.token.lock().await = Some(token);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.token.lock().await = None;
        self.store.delete().await
    }

    fn no_token_error(&self) -> AuthError {
        AuthError::NotConfigured {
            method: AuthMethod::OAuth2,
            message: format!(
                "no OAuth2 token found at {}; run the login command to authorize in a browser",
                self.store.path().display()
            ),
        }
    }
}

/// Applies the current OAuth2 access token, refreshing it when expired.
struct OAuth2TokenSource {
    cache: Arc<TokenCache>,
}

#[async_trait]
impl CredentialSource for OAuth2TokenSource {
    fn method(&self) -> AuthMethod {
        AuthMethod::OAuth2
    }

    async fn apply(&self, request: HttpRequest) -> Result<HttpRequest> {
        let token = self.cache.valid_token(&CancellationToken::new()).await?;
        Ok(bearer(request, &token.token_type, &token.access_token))
    }
}

pub struct OAuth2Provider {
    credentials_present: bool,
    oauth_config: OAuthConfig,
    http: Arc<dyn HttpClient>,
    listen_addr: SocketAddr,
    callback_timeout: Duration,
    cache: Arc<TokenCache>,
    client: Mutex<Option<AuthenticatedClient>>,
    authorizing: AtomicBool,
    authenticated: AtomicBool,
    ctx: ProviderContext,
}

impl OAuth2Provider {
    pub fn new(config: &AuthConfig, http: Arc<dyn HttpClient>, ctx: ProviderContext) -> Self {
        let oauth_config = OAuthConfig::google(
            config.oauth2_client_id.trim(),
            config.oauth2_client_secret.trim(),
        );
        let store = TokenStore::new(config.token_file_or_default());
        Self {
            credentials_present: config.has_oauth2_credentials(),
            cache: Self::cache(&oauth_config, &http, store, &ctx),
            oauth_config,
            http,
            listen_addr: config.oauth2_listen_addr,
            callback_timeout: config.oauth2_callback_timeout,
            client: Mutex::new(None),
            authorizing: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            ctx,
        }
    }

    /// Replace the OAuth endpoints and scopes. The client id and secret from
    /// `config` are used as given.
    pub fn with_oauth_config(mut self, config: OAuthConfig) -> Self {
        let store = self.cache.store.clone();
        self.cache = Self::cache(&config, &self.http, store, &self.ctx);
        self.credentials_present =
            !config.client_id.is_empty() && config.client_secret.is_some();
        self.oauth_config = config;
        self
    }

    fn cache(
        config: &OAuthConfig,
        http: &Arc<dyn HttpClient>,
        store: TokenStore,
        ctx: &ProviderContext,
    ) -> Arc<TokenCache> {
        Arc::new(TokenCache {
            flow: OAuthFlowManager::new(config.clone(), http.clone()),
            store,
            token: Mutex::new(None),
            ctx: ctx.clone(),
        })
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.cache.store
    }

    /// The held or stored token, valid or not.
    pub async fn token(&self) -> Option<Token> {
        self.cache.current().await
    }

    pub async fn state(&self) -> OAuth2State {
        if !self.credentials_present {
            return OAuth2State::Unconfigured;
        }
        if self.authorizing.load(Ordering::SeqCst) {
            return OAuth2State::Authorizing;
        }
        match self.cache.current().await {
            None => OAuth2State::NoToken,
            Some(token) if token.is_valid_at(self.ctx.clock.now()) => {
                if self.authenticated.load(Ordering::SeqCst) {
                    OAuth2State::Authenticated
                } else {
                    OAuth2State::TokenValid
                }
            }
            Some(_) => OAuth2State::TokenExpired,
        }
    }

    /// Revoke the held token at the provider and delete the token file.
    ///
    /// Without a token this only makes sure no token file is left behind.
    #[instrument(skip(self, cancel))]
    pub async fn revoke_token(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(token) = self.cache.current().await else {
            debug!("No OAuth2 token to revoke");
            return self.cache.store.delete().await;
        };

        run_cancellable(cancel, self.cache.flow.revoke_token(&token.access_token)).await?;
        self.cache.clear().await?;
        self.close().await;

        info!(
            file = %strip_path(&self.cache.store.path().to_string_lossy()),
            "OAuth2 token revoked"
        );
        Ok(())
    }

    fn ensure_credentials(&self) -> Result<()> {
        if self.credentials_present {
            Ok(())
        } else {
            Err(AuthError::NotConfigured {
                method: AuthMethod::OAuth2,
                message: format!(
                    "set {} and {} (or pass {} and {})",
                    ENV_OAUTH2_CLIENT_ID,
                    ENV_OAUTH2_CLIENT_SECRET,
                    FLAG_OAUTH2_CLIENT_ID,
                    FLAG_OAUTH2_CLIENT_SECRET
                ),
            })
        }
    }

    /// Run the browser flow and persist the resulting token.
    async fn interactive_login(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }

        let verifier = PkceVerifier::new();
        let mut server = CallbackServer::bind(self.listen_addr, verifier.state()).await?;

        self.authorizing.store(true, Ordering::SeqCst);
        let result = self.authorize(&mut server, &verifier, cancel).await;
        server.shutdown().await;
        self.authorizing.store(false, Ordering::SeqCst);

        let token = result?;
        self.cache.replace(token).await?;
        info!("OAuth2 authorization complete");
        Ok(())
    }

    async fn authorize(
        &self,
        server: &mut CallbackServer,
        verifier: &PkceVerifier,
        cancel: &CancellationToken,
    ) -> Result<Token> {
        let flow = OAuthFlowManager::new(self.oauth_config.clone(), self.http.clone())
            .with_redirect_uri(server.redirect_uri());
        let auth_url = flow.build_auth_url(verifier)?;

        info!(redirect_uri = %server.redirect_uri(), "Waiting for browser authorization");
        if self.ctx.has_subscribers() {
            self.ctx.emit(AuthEvent::AwaitingAuthorization {
                auth_url: auth_url.clone(),
                timeout_secs: self.callback_timeout.as_secs(),
            });
        } else {
            eprintln!(
                "Open the following URL in your browser to authorize access:\n\n  {}\n",
                auth_url
            );
        }

        let code = server.wait_for_code(cancel, self.callback_timeout).await?;
        run_cancellable(cancel, flow.exchange_code(&code, verifier.state(), verifier)).await
    }
}

impl fmt::Debug for OAuth2Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Provider")
            .field("client_id", &self.oauth_config.client_id)
            .field("token_file", &self.cache.store.path())
            .field("listen_addr", &self.listen_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialProvider for OAuth2Provider {
    fn method(&self) -> AuthMethod {
        AuthMethod::OAuth2
    }

    /// True only when credentials are present and a currently valid token is
    /// stored; a fresh install reports false until the first login.
    async fn is_configured(&self) -> bool {
        if !self.credentials_present {
            return false;
        }
        self.cache
            .current()
            .await
            .is_some_and(|token| token.is_valid_at(self.ctx.clock.now()))
    }

    #[instrument(skip(self, cancel))]
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_credentials()?;

        match self.cache.valid_token(cancel).await {
            Ok(_) => {
                debug!("Using stored OAuth2 token");
                self.authenticated.store(true, Ordering::SeqCst);
                return Ok(());
            }
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => debug!(error = %e, "No usable OAuth2 token; starting browser flow"),
        }

        self.interactive_login(cancel).await?;
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn client(&self, cancel: &CancellationToken) -> Result<AuthenticatedClient> {
        self.ensure_credentials()?;

        let mut cached = self.client.lock().await;
        if let Some(client) = cached.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }

        self.cache.valid_token(cancel).await?;
        let source = OAuth2TokenSource {
            cache: self.cache.clone(),
        };
        let client = AuthenticatedClient::new(self.http.clone(), Arc::new(source));
        *cached = Some(client.clone());
        Ok(client)
    }

    async fn close(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.lock().await.take() {
            client.close();
        }
    }

    async fn revoke(&self, cancel: &CancellationToken) -> Result<()> {
        self.revoke_token(cancel).await
    }

    /// Always runs the browser flow, ignoring any stored token.
    async fn reauthenticate(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_credentials()?;
        self.close().await;
        self.interactive_login(cancel).await?;
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{form_params, json_response, MockHttpClient};
    use bridge_traits::http::HttpMethod;
    use chrono::{Duration as ChronoDuration, Utc};
    use core_runtime::events::{CoreEvent, EventBus};
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const TOKEN_URL: &str = "https://oauth2.example.test/token";
    const REVOKE_URL: &str = "https://oauth2.example.test/revoke";

    fn auth_config(dir: &TempDir) -> AuthConfig {
        AuthConfig::default()
            .with_oauth2_client("client-id", "client-secret")
            .with_oauth2_token_file(dir.path().join("tts").join("oauth2_token.json"))
            .with_oauth2_listen_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .with_oauth2_callback_timeout(Duration::from_secs(10))
    }

    fn provider_with(config: &AuthConfig, mock: MockHttpClient, ctx: ProviderContext) -> OAuth2Provider {
        let mut oauth = OAuthConfig::google("client-id", "client-secret");
        oauth.token_url = TOKEN_URL.to_string();
        oauth.revoke_url = REVOKE_URL.to_string();
        OAuth2Provider::new(config, Arc::new(mock), ctx).with_oauth_config(oauth)
    }

    fn expired_token(refresh: Option<&str>) -> Token {
        Token {
            access_token: "ya29.expired".to_string(),
            refresh_token: refresh.map(str::to_string),
            token_type: "Bearer".to_string(),
            expiry: Some(Utc::now() - ChronoDuration::minutes(5)),
        }
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let provider = OAuth2Provider::new(
            &AuthConfig::default(),
            Arc::new(MockHttpClient::new()),
            ProviderContext::default(),
        );

        assert!(!provider.is_configured().await);
        assert_eq!(provider.state().await, OAuth2State::Unconfigured);

        let err = provider
            .authenticate(&CancellationToken::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(ENV_OAUTH2_CLIENT_ID));
        assert!(msg.contains(ENV_OAUTH2_CLIENT_SECRET));
    }

    #[tokio::test]
    async fn test_credentials_without_token_not_configured() {
        let dir = TempDir::new().unwrap();
        let provider = provider_with(&auth_config(&dir), MockHttpClient::new(), ProviderContext::default());

        assert!(!provider.is_configured().await);
        assert_eq!(provider.state().await, OAuth2State::NoToken);

        let err = provider
            .client(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("login"));
    }

    #[tokio::test]
    async fn test_stored_valid_token_is_used() {
        let dir = TempDir::new().unwrap();
        let config = auth_config(&dir);
        TokenStore::new(config.token_file_or_default())
            .save(&Token::new("ya29.stored".to_string(), None, 3600))
            .await
            .unwrap();

        let mut mock = MockHttpClient::new();
        mock.expect_execute()
            .times(1)
            .withf(|req| {
                req.headers.get("Authorization").map(String::as_str) == Some("Bearer ya29.stored")
            })
            .returning(|_| Ok(json_response(200, "{}")));

        let provider = provider_with(&config, mock, ProviderContext::default());
        assert!(provider.is_configured().await);
        assert_eq!(provider.state().await, OAuth2State::TokenValid);

        let cancel = CancellationToken::new();
        provider.authenticate(&cancel).await.unwrap();
        assert_eq!(provider.state().await, OAuth2State::Authenticated);

        let client = provider.client(&cancel).await.unwrap();
        client
            .execute(HttpRequest::new(HttpMethod::Get, "https://texttospeech.googleapis.com/v1/voices"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_persisted() {
        let dir = TempDir::new().unwrap();
        let config = auth_config(&dir);
        let store = TokenStore::new(config.token_file_or_default());
        store.save(&expired_token(Some("1//refresh"))).await.unwrap();

        let mut mock = MockHttpClient::new();
        mock.expect_execute()
            .times(1)
            .withf(|req| {
                req.url == TOKEN_URL
                    && form_params(req).get("refresh_token").map(String::as_str)
                        == Some("1//refresh")
            })
            .returning(|_| {
                Ok(json_response(200, r#"{"access_token":"ya29.fresh","expires_in":3600}"#))
            });

        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let provider = provider_with(&config, mock, ProviderContext::default().with_events(bus));

        assert!(!provider.is_configured().await);
        assert_eq!(provider.state().await, OAuth2State::TokenExpired);

        provider.authenticate(&CancellationToken::new()).await.unwrap();

        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.access_token, "ya29.fresh");
        assert_eq!(saved.refresh_token.as_deref(), Some("1//refresh"));
        assert!(matches!(
            events.try_recv(),
            Ok(CoreEvent::Auth(AuthEvent::TokenRefreshing { .. }))
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(CoreEvent::Auth(AuthEvent::TokenRefreshed { expires_at: Some(_), .. }))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_cannot_build_client() {
        let dir = TempDir::new().unwrap();
        let config = auth_config(&dir);
        TokenStore::new(config.token_file_or_default())
            .save(&expired_token(None))
            .await
            .unwrap();

        let provider = provider_with(&config, MockHttpClient::new(), ProviderContext::default());
        let err = provider
            .client(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoRefreshToken));
    }

    #[tokio::test]
    async fn test_corrupt_token_file_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let config = auth_config(&dir);
        let path = config.token_file_or_default();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();

        let provider = provider_with(&config, MockHttpClient::new(), ProviderContext::default());
        assert!(!provider.is_configured().await);
        assert_eq!(provider.state().await, OAuth2State::NoToken);
    }

    /// A loopback address whose port was free a moment ago.
    fn free_loopback_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap()
    }

    /// Drive the browser flow: wait for the consent URL, then hit the
    /// callback with `query(state)`.
    async fn run_interactive<F>(
        provider: Arc<OAuth2Provider>,
        events: &mut tokio::sync::broadcast::Receiver<CoreEvent>,
        cancel: CancellationToken,
        query: F,
    ) -> Result<()>
    where
        F: FnOnce(&str) -> String,
    {
        let task = {
            let provider = provider.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { provider.authenticate(&cancel).await })
        };

        let auth_url = loop {
            match events.recv().await.unwrap() {
                CoreEvent::Auth(AuthEvent::AwaitingAuthorization { auth_url, .. }) => break auth_url,
                _ => continue,
            }
        };
        let url = url::Url::parse(&auth_url).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        let redirect_uri = params["redirect_uri"].clone();

        let response = reqwest::get(format!("{}?{}", redirect_uri, query(&params["state"])))
            .await
            .unwrap();
        debug!(status = %response.status(), "Callback answered");
        let _ = response.text().await;

        task.await.unwrap()
    }

    #[tokio::test]
    async fn test_interactive_flow_persists_token() {
        let dir = TempDir::new().unwrap();
        let addr = free_loopback_addr();
        let config = auth_config(&dir).with_oauth2_listen_addr(addr);

        let mut mock = MockHttpClient::new();
        mock.expect_execute()
            .times(1)
            .withf(|req| {
                let params = form_params(req);
                req.url == TOKEN_URL
                    && params.get("code").map(String::as_str) == Some("auth-code")
                    && params.contains_key("code_verifier")
            })
            .returning(|_| {
                Ok(json_response(
                    200,
                    r#"{"access_token":"ya29.login","refresh_token":"1//login","expires_in":3600}"#,
                ))
            });

        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let provider = Arc::new(provider_with(
            &config,
            mock,
            ProviderContext::default().with_events(bus),
        ));

        run_interactive(provider.clone(), &mut events, CancellationToken::new(), |state| {
            format!("code=auth-code&state={}", state)
        })
        .await
        .unwrap();

        let saved = provider.token_store().load().await.unwrap().unwrap();
        assert_eq!(saved.access_token, "ya29.login");
        assert_eq!(provider.state().await, OAuth2State::Authenticated);
        assert!(provider.is_configured().await);

        // The listener is gone once the flow returns.
        std::net::TcpListener::bind(addr).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = provider.token_store().path();
            let mode = std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
            let dir_mode = std::fs::metadata(path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(dir_mode, 0o700);
        }
    }

    #[tokio::test]
    async fn test_interactive_flow_rejects_forged_state() {
        let dir = TempDir::new().unwrap();
        let addr = free_loopback_addr();
        let config = auth_config(&dir).with_oauth2_listen_addr(addr);
        let mut mock = MockHttpClient::new();
        mock.expect_execute().times(0);

        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let provider = Arc::new(provider_with(
            &config,
            mock,
            ProviderContext::default().with_events(bus),
        ));

        let err = run_interactive(provider.clone(), &mut events, CancellationToken::new(), |_| {
            "code=auth-code&state=forged".to_string()
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AuthError::StateMismatch { .. }));
        assert!(!provider.token_store().exists().await);
        assert_eq!(provider.state().await, OAuth2State::NoToken);
        std::net::TcpListener::bind(addr).unwrap();
    }

    #[tokio::test]
    async fn test_interactive_flow_rejects_missing_code() {
        let dir = TempDir::new().unwrap();
        let config = auth_config(&dir);
        let mut mock = MockHttpClient::new();
        mock.expect_execute().times(0);

        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let provider = Arc::new(provider_with(
            &config,
            mock,
            ProviderContext::default().with_events(bus),
        ));

        let err = run_interactive(provider.clone(), &mut events, CancellationToken::new(), |state| {
            format!("state={}", state)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AuthError::MissingAuthCode));
        assert!(!provider.token_store().exists().await);
    }

    #[tokio::test]
    async fn test_interactive_flow_cancelled_releases_listener() {
        let dir = TempDir::new().unwrap();
        let addr = free_loopback_addr();

        let config = auth_config(&dir).with_oauth2_listen_addr(addr);
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let provider = Arc::new(provider_with(
            &config,
            MockHttpClient::new(),
            ProviderContext::default().with_events(bus),
        ));

        let cancel = CancellationToken::new();
        let task = {
            let provider = provider.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { provider.authenticate(&cancel).await })
        };

        loop {
            if let CoreEvent::Auth(AuthEvent::AwaitingAuthorization { .. }) =
                events.recv().await.unwrap()
            {
                break;
            }
        }
        assert_eq!(provider.state().await, OAuth2State::Authorizing);
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert!(!provider.token_store().exists().await);

        // The port is free again.
        std::net::TcpListener::bind(addr).unwrap();
    }

    #[tokio::test]
    async fn test_revoke_without_token() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockHttpClient::new();
        mock.expect_execute().times(0);
        let provider = provider_with(&auth_config(&dir), mock, ProviderContext::default());

        provider.revoke_token(&CancellationToken::new()).await.unwrap();
        assert!(!provider.token_store().exists().await);
    }

    #[tokio::test]
    async fn test_revoke_deletes_token() {
        let dir = TempDir::new().unwrap();
        let config = auth_config(&dir);
        let store = TokenStore::new(config.token_file_or_default());
        store
            .save(&Token::new("ya29.live".to_string(), Some("1//r".to_string()), 3600))
            .await
            .unwrap();

        let mut mock = MockHttpClient::new();
        mock.expect_execute()
            .times(1)
            .withf(|req| {
                req.url == REVOKE_URL
                    && form_params(req).get("token").map(String::as_str) == Some("ya29.live")
            })
            .returning(|_| Ok(json_response(200, "")));

        let provider = provider_with(&config, mock, ProviderContext::default());
        let client = provider.client(&CancellationToken::new()).await.unwrap();

        provider.revoke(&CancellationToken::new()).await.unwrap();
        assert!(!store.exists().await);
        assert!(provider.token().await.is_none());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_revoke_failure_keeps_token() {
        let dir = TempDir::new().unwrap();
        let config = auth_config(&dir);
        let store = TokenStore::new(config.token_file_or_default());
        store
            .save(&Token::new("ya29.live".to_string(), None, 3600))
            .await
            .unwrap();

        let mut mock = MockHttpClient::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(json_response(503, "unavailable")));

        let provider = provider_with(&config, mock, ProviderContext::default());
        let err = provider
            .revoke(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenRevocationFailed(_)));
        assert!(store.exists().await);
    }
}
