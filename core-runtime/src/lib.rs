//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the CLI and the auth core:
//! - Logging and tracing setup
//! - Event bus carrying authentication progress
//! - Runtime error type

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
