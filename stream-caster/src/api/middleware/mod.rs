//! API middleware.

pub mod auth;

pub use auth::{API_KEY_HEADER, require_api_key};
