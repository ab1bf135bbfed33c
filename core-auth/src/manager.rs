//! # Authentication Manager
//!
//! Chooses one credential provider for the process and hands out the
//! authenticated HTTP client it produces.
//!
//! ## Overview
//!
//! The `AuthManager` owns one provider per [`AuthMethod`]. The first call to
//! [`client`](AuthManager::client) or [`validate`](AuthManager::validate)
//! selects a method from the configuration, activates its provider and keeps
//! it active for the rest of the process. Later calls reuse it.
//!
//! ## Method selection
//!
//! Evaluated in order, first match wins:
//!
//! 1. An explicitly configured method.
//! 2. A non-empty API key.
//! 3. A service account file that exists.
//! 4. Both an OAuth2 client id and secret.
//! 5. API key, so activation fails with instructions for setting one.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{AuthConfig, AuthManager};
//! use bridge_traits::http::HttpClient;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(http: Arc<dyn HttpClient>) -> core_auth::Result<()> {
//! let manager = AuthManager::new(AuthConfig::from_env(), http);
//! let client = manager.client(&CancellationToken::new()).await?;
//! println!("authenticated with {}", client.method());
//! # Ok(())
//! # }
//! ```

use crate::client::AuthenticatedClient;
use crate::config::{
    AuthConfig, ENV_API_KEY, ENV_OAUTH2_CLIENT_ID, ENV_OAUTH2_CLIENT_SECRET, ENV_SERVICE_ACCOUNT,
    FLAG_API_KEY, FLAG_SERVICE_ACCOUNT,
};
use crate::error::{AuthError, Result};
use crate::provider::{CredentialProvider, ProviderContext};
use crate::providers::{ApiKeyProvider, OAuth2Provider, ServiceAccountProvider};
use crate::types::AuthMethod;
use bridge_traits::http::HttpClient;
use core_runtime::events::{AuthEvent, EventBus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Pick the authentication method for `config`.
///
/// Only touches the filesystem to check that a configured service account
/// file exists.
pub fn select_auth_method(config: &AuthConfig) -> AuthMethod {
    if let Some(method) = config.method {
        return method;
    }
    if config.has_api_key() {
        return AuthMethod::ApiKey;
    }
    if config
        .service_account_path()
        .is_some_and(|path| path.exists())
    {
        return AuthMethod::ServiceAccount;
    }
    if config.has_oauth2_credentials() {
        return AuthMethod::OAuth2;
    }
    AuthMethod::ApiKey
}

/// Selects, activates and caches one credential provider.
pub struct AuthManager {
    config: AuthConfig,
    providers: HashMap<AuthMethod, Arc<dyn CredentialProvider>>,
    oauth2: Option<Arc<OAuth2Provider>>,
    /// Method of the active provider, once activation succeeded.
    active: RwLock<Option<AuthMethod>>,
    /// Serializes activation so concurrent callers share one attempt.
    activation: Mutex<()>,
    ctx: ProviderContext,
}

impl AuthManager {
    /// Create a manager with the three built-in providers.
    pub fn new(config: AuthConfig, http: Arc<dyn HttpClient>) -> Self {
        Self::with_context(config, http, ProviderContext::default())
    }

    /// Like [`new`](Self::new), sharing `ctx` (event bus and clock) with the
    /// providers.
    pub fn with_context(
        config: AuthConfig,
        http: Arc<dyn HttpClient>,
        ctx: ProviderContext,
    ) -> Self {
        let oauth2 = Arc::new(OAuth2Provider::new(&config, http.clone(), ctx.clone()));
        let providers: Vec<Arc<dyn CredentialProvider>> = vec![
            Arc::new(ApiKeyProvider::new(config.api_key.clone(), http.clone())),
            Arc::new(ServiceAccountProvider::new(
                config.service_account_file.clone(),
                http,
                ctx.clone(),
            )),
            oauth2.clone(),
        ];

        let mut manager = Self::with_providers(config, providers, ctx);
        manager.oauth2 = Some(oauth2);
        manager
    }

    /// Create a manager over an explicit provider set. A later provider for
    /// the same method replaces an earlier one.
    pub fn with_providers(
        config: AuthConfig,
        providers: Vec<Arc<dyn CredentialProvider>>,
        ctx: ProviderContext,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|provider| (provider.method(), provider))
            .collect();
        Self {
            config,
            providers,
            oauth2: None,
            active: RwLock::new(None),
            activation: Mutex::new(()),
            ctx,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn events(&self) -> Option<&EventBus> {
        self.ctx.events.as_ref()
    }

    /// The method this configuration resolves to. Never fails.
    pub fn select_auth_method(&self) -> Result<AuthMethod> {
        Ok(select_auth_method(&self.config))
    }

    pub fn provider(&self, method: AuthMethod) -> Option<Arc<dyn CredentialProvider>> {
        self.providers.get(&method).cloned()
    }

    /// The built-in OAuth2 provider, for login, logout and status commands.
    pub fn oauth2(&self) -> Option<Arc<OAuth2Provider>> {
        self.oauth2.clone()
    }

    /// An authenticated client from the active provider, activating one on
    /// first use.
    #[instrument(skip(self, cancel))]
    pub async fn client(&self, cancel: &CancellationToken) -> Result<AuthenticatedClient> {
        let (method, provider) = self.activate(cancel).await?;
        provider
            .client(cancel)
            .await
            .map_err(|e| self.fail(method, e))
    }

    /// Activate a provider and make sure it can build a client.
    pub async fn validate(&self, cancel: &CancellationToken) -> Result<()> {
        self.client(cancel).await.map(|_| ())
    }

    /// True if any provider has enough configuration to be used.
    pub async fn is_configured(&self) -> bool {
        for provider in self.providers.values() {
            if provider.is_configured().await {
                return true;
            }
        }
        false
    }

    /// Method of the active provider, or [`AuthMethod::ApiKey`] before
    /// activation.
    pub async fn active_method(&self) -> AuthMethod {
        self.active.read().await.unwrap_or_default()
    }

    pub async fn is_active(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Drop the active provider and authenticate the selected one again,
    /// skipping the configuration pre-check.
    ///
    /// For OAuth2 this always runs the browser flow, which is how a first
    /// login happens.
    #[instrument(skip(self, cancel))]
    pub async fn reauthenticate(&self, cancel: &CancellationToken) -> Result<AuthMethod> {
        let _guard = self.activation.lock().await;
        if let Some(previous) = self.active.write().await.take() {
            if let Some(provider) = self.providers.get(&previous) {
                provider.close().await;
            }
        }

        let method = select_auth_method(&self.config);
        let provider = self.provider_for(method)?;

        self.ctx.emit(AuthEvent::SigningIn {
            method: method.as_str().to_string(),
        });
        provider
            .reauthenticate(cancel)
            .await
            .map_err(|e| self.fail(method, e))?;

        *self.active.write().await = Some(method);
        self.signed_in(method);
        Ok(method)
    }

    /// Revoke stored credentials of the selected method and clear the active
    /// provider. Static credentials have nothing to revoke.
    ///
    /// When revocation fails the active provider and its client are left as
    /// they were.
    #[instrument(skip(self, cancel))]
    pub async fn revoke(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.activation.lock().await;
        let active = *self.active.read().await;
        let method = active.unwrap_or_else(|| select_auth_method(&self.config));
        let provider = self.provider_for(method)?;

        provider
            .revoke(cancel)
            .await
            .map_err(|e| self.fail(method, e))?;
        provider.close().await;
        self.active.write().await.take();

        self.signed_out(method);
        info!(method = %method, "Credentials revoked");
        Ok(())
    }

    /// Close every provider's cached client.
    pub async fn close(&self) {
        let active = self.active.write().await.take();
        for provider in self.providers.values() {
            provider.close().await;
        }
        if let Some(method) = active {
            self.signed_out(method);
        }
        debug!("Auth manager closed");
    }

    fn signed_out(&self, method: AuthMethod) {
        self.ctx.emit(AuthEvent::SignedOut {
            method: method.as_str().to_string(),
        });
    }

    async fn activate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(AuthMethod, Arc<dyn CredentialProvider>)> {
        if let Some(method) = *self.active.read().await {
            return Ok((method, self.provider_for(method)?));
        }

        let _guard = self.activation.lock().await;
        // Another caller may have finished activation while we waited.
        if let Some(method) = *self.active.read().await {
            return Ok((method, self.provider_for(method)?));
        }

        let method = select_auth_method(&self.config);
        let provider = self.provider_for(method)?;
        debug!(method = %method, "Activating credential provider");
        self.ctx.emit(AuthEvent::SigningIn {
            method: method.as_str().to_string(),
        });

        if !provider.is_configured().await {
            return Err(self.fail(method, self.not_configured(method)));
        }
        provider
            .authenticate(cancel)
            .await
            .map_err(|e| self.fail(method, e))?;

        *self.active.write().await = Some(method);
        self.signed_in(method);
        Ok((method, provider))
    }

    fn provider_for(&self, method: AuthMethod) -> Result<Arc<dyn CredentialProvider>> {
        self.providers
            .get(&method)
            .cloned()
            .ok_or_else(|| AuthError::InvalidMethod(method.to_string()))
    }

    fn signed_in(&self, method: AuthMethod) {
        info!(method = %method, "Authenticated");
        self.ctx.emit(AuthEvent::SignedIn {
            method: method.as_str().to_string(),
        });
    }

    /// Wrap `error` with the method name and publish it.
    fn fail(&self, method: AuthMethod, error: AuthError) -> AuthError {
        let error = AuthError::for_method(method, error);
        warn!(method = %method, error = %error, "Authentication failed");
        self.ctx.emit(AuthEvent::AuthError {
            method: Some(method.as_str().to_string()),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        });
        error
    }

    fn not_configured(&self, method: AuthMethod) -> AuthError {
        let message = match method {
            AuthMethod::ApiKey => format!(
                "no valid API key; set {} or pass {}",
                ENV_API_KEY, FLAG_API_KEY
            ),
            AuthMethod::ServiceAccount => match self.config.service_account_path() {
                Some(path) => format!(
                    "service account file {} is missing or incomplete",
                    path.display()
                ),
                None => format!(
                    "set {} or pass {} with the path to a service account key file",
                    ENV_SERVICE_ACCOUNT, FLAG_SERVICE_ACCOUNT
                ),
            },
            AuthMethod::OAuth2 if self.config.has_oauth2_credentials() => format!(
                "no valid OAuth2 token at {}; run the login command first",
                self.config.token_file_or_default().display()
            ),
            AuthMethod::OAuth2 => format!(
                "set {} and {} to use OAuth2",
                ENV_OAUTH2_CLIENT_ID, ENV_OAUTH2_CLIENT_SECRET
            ),
        };
        AuthError::NotConfigured { method, message }
    }
}
