//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (`core-auth`, `core-runtime`, `bridge-desktop`). The CLI
//! can depend on `tts-workspace` and enable the documented features without
//! needing to wire each crate individually.

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;
#[cfg(feature = "desktop-shims")]
pub use core_auth;
#[cfg(feature = "desktop-shims")]
pub use core_runtime;
