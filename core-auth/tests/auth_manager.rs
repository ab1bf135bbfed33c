//! End-to-end behavior of the auth manager over the built-in providers.

use bridge_desktop::ReqwestHttpClient;
use bridge_traits::http::HttpClient;
use core_auth::{
    AuthConfig, AuthError, AuthManager, AuthMethod, CredentialProvider, OAuth2State, Token,
    TokenStore,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn http() -> Arc<dyn HttpClient> {
    Arc::new(ReqwestHttpClient::new().unwrap())
}

/// A config that cannot pick up anything from the real home directory.
fn isolated(dir: &TempDir) -> AuthConfig {
    AuthConfig::default()
        .with_oauth2_token_file(dir.path().join("tts").join("oauth2_token.json"))
        .with_oauth2_listen_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
}

#[tokio::test]
async fn empty_config_is_not_configured() {
    let dir = TempDir::new().unwrap();
    let manager = AuthManager::new(isolated(&dir), http());

    assert_eq!(manager.select_auth_method().unwrap(), AuthMethod::ApiKey);
    assert!(!manager.is_configured().await);

    let err = manager
        .client(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not configured"));
    assert!(err.is_configuration());
    assert!(err.remediation().is_some());
    assert_eq!(manager.active_method().await, AuthMethod::ApiKey);
}

#[tokio::test]
async fn api_key_config_selects_api_key() {
    let dir = TempDir::new().unwrap();
    let key = format!("AIza{}", "x".repeat(35));
    let manager = AuthManager::new(isolated(&dir).with_api_key(key), http());

    assert!(manager.is_configured().await);
    assert_eq!(manager.select_auth_method().unwrap(), AuthMethod::ApiKey);

    let cancel = CancellationToken::new();
    manager.validate(&cancel).await.unwrap();
    let client = manager.client(&cancel).await.unwrap();
    assert_eq!(client.method(), AuthMethod::ApiKey);
    assert_eq!(manager.active_method().await, AuthMethod::ApiKey);

    manager.close().await;
    assert!(client.is_closed());
}

#[tokio::test]
async fn oauth2_without_token_needs_login() {
    let dir = TempDir::new().unwrap();
    let config = isolated(&dir).with_oauth2_client("client-id", "client-secret");
    let manager = AuthManager::new(config, http());

    assert_eq!(manager.select_auth_method().unwrap(), AuthMethod::OAuth2);

    let oauth2 = manager.oauth2().unwrap();
    assert!(!oauth2.is_configured().await);
    assert_eq!(oauth2.state().await, OAuth2State::NoToken);

    let err = manager
        .client(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("login"));
}

#[tokio::test]
async fn oauth2_with_stored_token_is_used() {
    let dir = TempDir::new().unwrap();
    let config = isolated(&dir).with_oauth2_client("client-id", "client-secret");
    TokenStore::new(config.token_file_or_default())
        .save(&Token::new("ya29.stored".to_string(), Some("1//r".to_string()), 3600))
        .await
        .unwrap();

    let manager = AuthManager::new(config, http());
    assert!(manager.is_configured().await);

    let client = manager.client(&CancellationToken::new()).await.unwrap();
    assert_eq!(client.method(), AuthMethod::OAuth2);
    assert_eq!(manager.active_method().await, AuthMethod::OAuth2);
}

#[tokio::test]
async fn revoke_without_token_succeeds() {
    let dir = TempDir::new().unwrap();
    let config = isolated(&dir).with_oauth2_client("client-id", "client-secret");
    let token_file = config.token_file_or_default();
    let manager = AuthManager::new(config, http());

    manager.revoke(&CancellationToken::new()).await.unwrap();
    assert!(!token_file.exists());
}

#[tokio::test]
async fn cancelled_login_releases_listener() {
    let dir = TempDir::new().unwrap();
    let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let config = isolated(&dir)
        .with_oauth2_client("client-id", "client-secret")
        .with_oauth2_listen_addr(addr)
        .with_oauth2_callback_timeout(Duration::from_secs(30));
    let manager = Arc::new(AuthManager::new(config, http()));

    let cancel = CancellationToken::new();
    let login = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.reauthenticate(&cancel).await })
    };

    // Wait until the listener is accepting connections.
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();

    let err = login.await.unwrap().unwrap_err();
    assert!(matches!(err.root(), AuthError::Cancelled));
    assert!(!manager.is_active().await);

    std::net::TcpListener::bind(addr).unwrap();
}

#[tokio::test]
async fn login_times_out_without_callback() {
    let dir = TempDir::new().unwrap();
    let config = isolated(&dir)
        .with_oauth2_client("client-id", "client-secret")
        .with_oauth2_callback_timeout(Duration::from_millis(100));
    let manager = AuthManager::new(config, http());

    let err = manager
        .reauthenticate(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(!manager.oauth2().unwrap().token_store().exists().await);
}
