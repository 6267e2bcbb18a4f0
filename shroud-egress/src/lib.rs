//! Shroud egress worker library.
//!
//! Exposed as a library so the integration tests can mount the router on an
//! ephemeral port; the binary entry point lives in `main.rs`.

pub mod config;
pub mod server;
pub mod session;
pub mod state;
pub mod upstream;
