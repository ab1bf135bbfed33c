use crate::types::AuthMethod;
use bridge_traits::BridgeError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{method} authentication not configured: {message}")]
    NotConfigured { method: AuthMethod, message: String },

    #[error("Unknown authentication method '{0}' (expected api-key, service-account or oauth2)")]
    InvalidMethod(String),

    #[error("Invalid service account key file {}: {reason}", .path.display())]
    InvalidServiceAccount { path: PathBuf, reason: String },

    #[error("Authenticated client has been closed; obtain a new client from the auth manager")]
    ClientClosed,

    #[error("OAuth state mismatch (possible CSRF attempt): expected '{expected}', got '{actual}'")]
    StateMismatch { expected: String, actual: String },

    #[error("OAuth callback did not include an authorization code")]
    MissingAuthCode,

    #[error("Authorization denied: {0}")]
    ProviderDenied(String),

    #[error("Failed to start OAuth callback listener on {addr}: {reason}")]
    CallbackServer { addr: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("Token revocation failed: {0}")]
    TokenRevocationFailed(String),

    #[error("No refresh token available; run the login flow again")]
    NoRefreshToken,

    #[error("Token store error at {}: {source}", .path.display())]
    TokenStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed ({context}): {source}")]
    SerializationFailed {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Authentication cancelled")]
    Cancelled,

    #[error("Operation timed out: {operation}")]
    OperationTimeout { operation: String },

    #[error("Failed to get {method} client: {source}")]
    Method {
        method: AuthMethod,
        #[source]
        source: Box<AuthError>,
    },

    #[error("{0}")]
    Other(String),
}

/// Coarse classification used by the CLI to pick exit codes and hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed credentials; fixed by changing flags, env or files.
    Configuration,
    /// Rejected callback (state mismatch, missing code, denied consent).
    Security,
    /// Network or remote endpoint failure; retrying may succeed.
    Transient,
    /// Token file could not be read or written.
    Persistence,
    /// The caller cancelled or a deadline elapsed.
    Cancellation,
}

impl AuthError {
    /// Wrap an error with the auth method it occurred under.
    pub fn for_method(method: AuthMethod, source: AuthError) -> Self {
        AuthError::Method {
            method,
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through [`AuthError::Method`] wrappers.
    pub fn root(&self) -> &AuthError {
        match self {
            AuthError::Method { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            AuthError::NotConfigured { .. }
            | AuthError::InvalidMethod(_)
            | AuthError::InvalidServiceAccount { .. }
            | AuthError::ClientClosed
            | AuthError::NoRefreshToken => ErrorKind::Configuration,
            AuthError::StateMismatch { .. }
            | AuthError::MissingAuthCode
            | AuthError::ProviderDenied(_) => ErrorKind::Security,
            AuthError::TokenStore { .. } | AuthError::SerializationFailed { .. } => {
                ErrorKind::Persistence
            }
            AuthError::Cancelled | AuthError::OperationTimeout { .. } => ErrorKind::Cancellation,
            AuthError::CallbackServer { .. }
            | AuthError::NetworkError(_)
            | AuthError::TokenExchangeFailed(_)
            | AuthError::TokenRefreshFailed(_)
            | AuthError::TokenRevocationFailed(_)
            | AuthError::Other(_)
            | AuthError::Method { .. } => ErrorKind::Transient,
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// True for caller cancellation and elapsed deadlines.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    /// True only for an elapsed deadline, as opposed to explicit cancellation.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), AuthError::OperationTimeout { .. })
    }

    /// Whether re-running the same command without changes could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Cancellation)
    }

    /// A concrete next step for the user, when one exists.
    pub fn remediation(&self) -> Option<String> {
        match self.root() {
            AuthError::NotConfigured { message, .. } => Some(message.clone()),
            AuthError::InvalidServiceAccount { path, .. } => Some(format!(
                "download a new JSON key for the service account and point \
                 GOOGLE_APPLICATION_CREDENTIALS at it (current: {})",
                path.display()
            )),
            AuthError::NoRefreshToken | AuthError::TokenRefreshFailed(_) => {
                Some("run the login command again to re-authorize OAuth2 access".to_string())
            }
            AuthError::CallbackServer { addr, .. } => Some(format!(
                "free {} or stop the other process listening on it, then retry",
                addr
            )),
            AuthError::StateMismatch { .. } | AuthError::MissingAuthCode => Some(
                "restart the login flow and open only the most recent authorization URL"
                    .to_string(),
            ),
            AuthError::TokenStore { path, .. } => Some(format!(
                "check permissions of {} and its parent directory",
                path.display()
            )),
            _ => None,
        }
    }
}

impl From<BridgeError> for AuthError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout(operation) => AuthError::OperationTimeout { operation },
            other => AuthError::NetworkError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_configured_message_names_remedy() {
        let err = AuthError::NotConfigured {
            method: AuthMethod::ApiKey,
            message: "set GOOGLE_API_KEY or pass --api-key".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("not configured"));
        assert!(msg.contains("GOOGLE_API_KEY"));
        assert!(err.is_configuration());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_method_wrapper_preserves_classification() {
        let err = AuthError::for_method(AuthMethod::OAuth2, AuthError::Cancelled);

        assert!(err.to_string().contains("OAuth2"));
        assert!(err.is_cancellation());
        assert!(!err.is_timeout());
        assert!(matches!(err.root(), AuthError::Cancelled));
    }

    #[test]
    fn test_timeout_is_distinct_from_cancel() {
        let err = AuthError::OperationTimeout {
            operation: "waiting for OAuth callback".to_string(),
        };
        assert!(err.is_cancellation());
        assert!(err.is_timeout());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(AuthError::MissingAuthCode.kind(), ErrorKind::Security);
        assert_eq!(
            AuthError::TokenStore {
                path: PathBuf::from("/tmp/token.json"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }
            .kind(),
            ErrorKind::Persistence
        );
        assert_eq!(
            AuthError::TokenExchangeFailed("500".into()).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_bridge_error_conversion() {
        let err: AuthError = BridgeError::Timeout("token endpoint".into()).into();
        assert!(err.is_timeout());

        let err: AuthError = BridgeError::OperationFailed("connection refused".into()).into();
        assert!(matches!(err, AuthError::NetworkError(_)));
    }

    #[test]
    fn test_remediation() {
        assert!(AuthError::NoRefreshToken
            .remediation()
            .unwrap()
            .contains("login"));
        assert!(AuthError::NetworkError("reset".into()).remediation().is_none());
    }
}
