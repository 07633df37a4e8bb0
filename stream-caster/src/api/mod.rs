//! HTTP API.
//!
//! Thin axum layer over [`crate::caster::StreamManager`] with API key
//! authentication.

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
