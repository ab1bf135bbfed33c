//! Built-in credential providers, one per [`AuthMethod`](crate::AuthMethod).

pub mod api_key;
pub mod oauth2;
pub mod service_account;

pub use api_key::ApiKeyProvider;
pub use oauth2::{OAuth2Provider, OAuth2State};
pub use service_account::{ServiceAccountProvider, ServiceAccountTokenSource};
