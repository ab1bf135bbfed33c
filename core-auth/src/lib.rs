//! # Authentication Module
//!
//! Credential management for the text-to-speech client.
//!
//! ## Overview
//!
//! Three authentication methods are supported:
//!
//! - **API key**: a static key sent in the `x-goog-api-key` header.
//! - **Service account**: a JSON key file used to mint short-lived access
//!   tokens with a signed JWT assertion.
//! - **OAuth2**: the browser authorization-code flow with PKCE, a loopback
//!   callback listener and a token file that survives between runs.
//!
//! The [`AuthManager`] picks one method from an [`AuthConfig`], activates the
//! matching [`CredentialProvider`] and returns an [`AuthenticatedClient`] that
//! attaches credentials to every request.
//!
//! ## Features
//!
//! - Deterministic method selection with environment fallback
//! - Automatic OAuth2 token refresh and revocation
//! - Token file written with owner-only permissions
//! - Cancellation through `CancellationToken` on every blocking operation
//! - Auth state event emission

pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod provider;
pub mod providers;
pub mod token_store;
pub mod types;

pub use client::{AuthenticatedClient, CredentialSource};
pub use config::AuthConfig;
pub use error::{AuthError, ErrorKind, Result};
pub use manager::{select_auth_method, AuthManager};
pub use oauth::{OAuthConfig, OAuthFlowManager, PkceVerifier};
pub use provider::{CredentialProvider, ProviderContext};
pub use providers::{ApiKeyProvider, OAuth2Provider, OAuth2State, ServiceAccountProvider};
pub use token_store::TokenStore;
pub use types::{AuthMethod, ServiceAccountKey, Token};
