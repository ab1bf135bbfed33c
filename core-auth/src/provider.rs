//! Credential provider abstraction.
//!
//! Each [`AuthMethod`] is backed by one [`CredentialProvider`]. The
//! [`AuthManager`](crate::AuthManager) picks a provider, activates it and
//! hands out the [`AuthenticatedClient`] it produces.

use crate::client::AuthenticatedClient;
use crate::error::{AuthError, Result};
use crate::types::AuthMethod;
use async_trait::async_trait;
use bridge_traits::time::{Clock, SystemClock};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A source of credentials for one authentication method.
///
/// `authenticate` establishes that credentials are usable (and may run an
/// interactive flow); `client` returns an HTTP client that applies them.
/// Implementations cache the client they build until `close` is called.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn method(&self) -> AuthMethod;

    /// Whether enough configuration is present to attempt authentication.
    async fn is_configured(&self) -> bool;

    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()>;

    async fn client(&self, cancel: &CancellationToken) -> Result<AuthenticatedClient>;

    /// Release the cached client. Idempotent.
    async fn close(&self);

    /// Invalidate stored credentials. Methods without revocable state succeed.
    async fn revoke(&self, cancel: &CancellationToken) -> Result<()> {
        let _ = cancel;
        Ok(())
    }

    /// Discard cached state and authenticate again.
    async fn reauthenticate(&self, cancel: &CancellationToken) -> Result<()> {
        self.close().await;
        self.authenticate(cancel).await
    }
}

/// Shared collaborators handed to every provider.
#[derive(Clone)]
pub struct ProviderContext {
    pub events: Option<EventBus>,
    pub clock: Arc<dyn Clock>,
}

impl Default for ProviderContext {
    fn default() -> Self {
        Self {
            events: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ProviderContext {
    pub fn new(events: Option<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { events, clock }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish `event`; a bus with no subscribers drops it.
    pub fn emit(&self, event: AuthEvent) {
        if let Some(bus) = &self.events {
            let _ = bus.emit(CoreEvent::Auth(event));
        }
    }

    /// Whether anyone is listening for events.
    pub fn has_subscribers(&self) -> bool {
        self.events
            .as_ref()
            .is_some_and(|bus| bus.subscriber_count() > 0)
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn run_cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(AuthError::Cancelled);
    }
    tokio::select! {
        result = fut => result,
        _ = cancel.cancelled() => Err(AuthError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_cancellable_completes() {
        let cancel = CancellationToken::new();
        let value = run_cancellable(&cancel, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_cancellable_pre_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_cancellable(&cancel, async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_cancellable_interrupts() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = run_cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[test]
    fn test_context_emit_without_bus() {
        let ctx = ProviderContext::default();
        assert!(!ctx.has_subscribers());
        ctx.emit(AuthEvent::SignedIn {
            method: "api-key".to_string(),
        });
    }

    #[test]
    fn test_context_emit_with_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let ctx = ProviderContext::default().with_events(bus);

        assert!(ctx.has_subscribers());
        ctx.emit(AuthEvent::SigningIn {
            method: "oauth2".to_string(),
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(CoreEvent::Auth(AuthEvent::SigningIn { .. }))
        ));
    }
}
