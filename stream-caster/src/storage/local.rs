//! Filesystem-backed object store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use super::MediaStorage;
use crate::{Error, Result};

/// Object store rooted at a local directory. Object names are flat file names.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let name = name.trim();
        if name.is_empty()
            || name == "."
            || name.contains("..")
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(Error::validation(format!("Invalid object name '{name}'")));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl MediaStorage for LocalStorage {
    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(format!("Failed to list media: {e}"))),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn fetch(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.object_path(name)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::not_found("Media file", name));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(format!("{}_{}", uuid::Uuid::new_v4().simple(), name.trim()));
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| Error::storage(format!("Failed to fetch {name}: {e}")))?;

        debug!(object = %name, path = %dest.display(), "Fetched media object");
        Ok(dest)
    }

    async fn store(&self, name: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| Error::storage(format!("Failed to store {name}: {e}")))?;

        info!(object = %name, size = data.len(), "Stored media object");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(object = %name, "Deleted media object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("Media file", name))
            }
            Err(e) => Err(Error::storage(format!("Failed to delete {name}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_list_fetch_delete() {
        let media = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(media.path());

        storage.store("b.mp4", Bytes::from_static(b"bbb")).await.unwrap();
        storage.store("a.mkv", Bytes::from_static(b"aaa")).await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec!["a.mkv", "b.mp4"]);

        let local = storage.fetch("b.mp4", temp.path()).await.unwrap();
        assert!(local.starts_with(temp.path()));
        assert_eq!(tokio::fs::read(&local).await.unwrap(), b"bbb");

        storage.delete("b.mp4").await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec!["a.mkv"]);
        assert!(matches!(
            storage.delete("b.mp4").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_root_lists_nothing() {
        let storage = LocalStorage::new("/nonexistent/stream-caster-media");
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let media = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(media.path());
        assert!(matches!(
            storage.fetch("../etc/passwd", media.path()).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            storage.store("dir/x.mp4", Bytes::new()).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_missing_object() {
        let media = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(media.path());
        assert!(matches!(
            storage.fetch("nope.mp4", media.path()).await,
            Err(Error::NotFound { .. })
        ));
    }
}
