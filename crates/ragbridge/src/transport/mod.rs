//! Host-facing transports for the bridge.
//!
//! Currently provides HTTP transport via axum.

pub mod http;

pub use http::{ServerConfig, serve};
