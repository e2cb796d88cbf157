//! HTTP transport via axum.

pub mod routes;
pub mod server;

pub use routes::{AppState, routes};
pub use server::{ServerConfig, serve};
