//! Authentication configuration.
//!
//! [`AuthConfig`] is the value the CLI layer hands to the auth manager once
//! flags and the config file have been merged. Any field left empty there is
//! filled from its environment variable by [`AuthConfig::with_env_fallback`].

use crate::types::AuthMethod;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const ENV_AUTH_METHOD: &str = "GOOGLE_TTS_AUTH_METHOD";
pub const ENV_API_KEY: &str = "GOOGLE_API_KEY";
pub const ENV_SERVICE_ACCOUNT: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const ENV_OAUTH2_CLIENT_ID: &str = "GOOGLE_OAUTH_CLIENT_ID";
pub const ENV_OAUTH2_CLIENT_SECRET: &str = "GOOGLE_OAUTH_CLIENT_SECRET";
pub const ENV_OAUTH2_TOKEN_FILE: &str = "GOOGLE_OAUTH_TOKEN_FILE";

pub const FLAG_AUTH_METHOD: &str = "--auth-method";
pub const FLAG_API_KEY: &str = "--api-key";
pub const FLAG_SERVICE_ACCOUNT: &str = "--service-account";
pub const FLAG_OAUTH2_CLIENT_ID: &str = "--client-id";
pub const FLAG_OAUTH2_CLIENT_SECRET: &str = "--client-secret";
pub const FLAG_OAUTH2_TOKEN_FILE: &str = "--token-file";

/// Directory name under the platform config dir.
pub const APP_DIR_NAME: &str = "tts";
pub const DEFAULT_TOKEN_FILE_NAME: &str = "oauth2_token.json";

/// Port of the loopback listener receiving the OAuth2 redirect. It must match
/// the redirect URI registered for the OAuth client.
pub const DEFAULT_CALLBACK_PORT: u16 = 8080;

/// How long the interactive flow waits for the browser redirect.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Explicitly requested method, `None` when the user did not choose one.
    pub method: Option<AuthMethod>,
    pub api_key: String,
    pub service_account_file: Option<PathBuf>,
    pub oauth2_client_id: String,
    pub oauth2_client_secret: String,
    /// Token file location; `None` means [`default_token_path`].
    pub oauth2_token_file: Option<PathBuf>,
    pub oauth2_listen_addr: SocketAddr,
    pub oauth2_callback_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: None,
            api_key: String::new(),
            service_account_file: None,
            oauth2_client_id: String::new(),
            oauth2_client_secret: String::new(),
            oauth2_token_file: None,
            oauth2_listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_CALLBACK_PORT)),
            oauth2_callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("method", &self.method)
            .field("api_key", &redact(&self.api_key))
            .field("service_account_file", &self.service_account_file)
            .field("oauth2_client_id", &self.oauth2_client_id)
            .field("oauth2_client_secret", &redact(&self.oauth2_client_secret))
            .field("oauth2_token_file", &self.oauth2_token_file)
            .field("oauth2_listen_addr", &self.oauth2_listen_addr)
            .field("oauth2_callback_timeout", &self.oauth2_callback_timeout)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "[REDACTED]"
    }
}

impl AuthConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration taken entirely from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_fallback()
    }

    /// Fill every empty field from its environment variable.
    pub fn with_env_fallback(self) -> Self {
        self.with_fallback_from(|name| std::env::var(name).ok())
    }

    /// Fill every empty field using `lookup` in place of the process environment.
    pub fn with_fallback_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if self.method.is_none() {
            if let Some(raw) = get(ENV_AUTH_METHOD) {
                match AuthMethod::parse(&raw) {
                    Some(method) => self.method = Some(method),
                    None => warn!(
                        variable = ENV_AUTH_METHOD,
                        value = %raw,
                        "Ignoring unknown authentication method"
                    ),
                }
            }
        }
        if !self.has_api_key() {
            if let Some(key) = get(ENV_API_KEY) {
                self.api_key = key;
            }
        }
        if self.service_account_path().is_none() {
            self.service_account_file = get(ENV_SERVICE_ACCOUNT).map(PathBuf::from);
        }
        if self.oauth2_client_id.trim().is_empty() {
            if let Some(id) = get(ENV_OAUTH2_CLIENT_ID) {
                self.oauth2_client_id = id;
            }
        }
        if self.oauth2_client_secret.trim().is_empty() {
            if let Some(secret) = get(ENV_OAUTH2_CLIENT_SECRET) {
                self.oauth2_client_secret = secret;
            }
        }
        if self
            .oauth2_token_file
            .as_ref()
            .map_or(true, |path| path.as_os_str().is_empty())
        {
            self.oauth2_token_file = get(ENV_OAUTH2_TOKEN_FILE).map(PathBuf::from);
        }
        self
    }

    pub fn with_method(mut self, method: AuthMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_service_account_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.service_account_file = Some(path.into());
        self
    }

    pub fn with_oauth2_client(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.oauth2_client_id = client_id.into();
        self.oauth2_client_secret = client_secret.into();
        self
    }

    pub fn with_oauth2_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.oauth2_token_file = Some(path.into());
        self
    }

    pub fn with_oauth2_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.oauth2_listen_addr = addr;
        self
    }

    pub fn with_oauth2_callback_timeout(mut self, timeout: Duration) -> Self {
        self.oauth2_callback_timeout = timeout;
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// The service-account path, if one was given (existence is not checked).
    pub fn service_account_path(&self) -> Option<&PathBuf> {
        self.service_account_file
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn has_oauth2_credentials(&self) -> bool {
        !self.oauth2_client_id.trim().is_empty() && !self.oauth2_client_secret.trim().is_empty()
    }

    pub fn token_file_or_default(&self) -> PathBuf {
        self.oauth2_token_file
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(default_token_path)
    }
}

/// `<config dir>/tts/oauth2_token.json`, falling back to `~/.config` and then
/// the working directory when the platform reports no config dir.
pub fn default_token_path() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(DEFAULT_TOKEN_FILE_NAME)
}
