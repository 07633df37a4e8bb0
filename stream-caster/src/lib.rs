//! stream-caster library crate.
//!
//! Turns media files into scheduled, supervised live transmissions.

pub mod api;
pub mod auth;
pub mod caster;
pub mod config;
pub mod error;
pub mod logging;
pub mod storage;

pub use error::{Error, Result};
