//! # Host Bridge Traits
//!
//! Host abstractions that the authentication core depends on.
//!
//! ## Overview
//!
//! The core never talks to the network or the system clock directly. It goes
//! through the traits defined here so the desktop binary can plug in real
//! implementations (`bridge-desktop`) and tests can plug in doubles.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP with retry policy
//! - [`Clock`](time::Clock) - Time source used for token expiry checks
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to a host pipeline
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type.
//! Implementations should:
//!
//! - Convert library-specific errors to `BridgeError`
//! - Provide actionable error messages
//! - Include error context (URL, status code)
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across tasks
//! behind `Arc`.

pub mod error;
pub mod http;
pub mod time;

pub use error::BridgeError;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
