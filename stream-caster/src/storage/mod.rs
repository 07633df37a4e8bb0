//! Source media collaborators.
//!
//! [`MediaStorage`] is the object store the caster lists, fetches and uploads
//! media through. [`HttpFetcher`] downloads ad-hoc sources given by URL.

mod http;
mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

pub use http::{HttpFetcher, install_rustls_provider};
pub use local::LocalStorage;

/// File extensions accepted for uploads.
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "mkv", "mxf", "mov", "avi"];

/// Whether `name` carries an accepted media extension (case-insensitive).
pub fn has_allowed_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// Object store holding the media catalogue.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Names of every stored object.
    async fn list(&self) -> Result<Vec<String>>;

    /// Copy object `name` into `dest_dir` and return the local path.
    async fn fetch(&self, name: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Store `data` under `name`, replacing an existing object.
    async fn store(&self, name: &str, data: Bytes) -> Result<()>;

    /// Delete object `name`.
    async fn delete(&self, name: &str) -> Result<()>;
}
