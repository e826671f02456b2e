//! Directory-backed blob store using `tokio::fs`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::error::RecurseResult;

use super::{not_found, BlobStore};

/// Keys resolve to files under `root`; `/` in a key becomes a subdirectory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl BlobStore for FsBlobStore {
    fn get_text<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<String>> + Send + 'a>> {
        Box::pin(async move {
            let full = self.resolve(key);
            match tokio::fs::read_to_string(&full).await {
                Ok(content) => Ok(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(key)),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn put_text<'a>(
        &'a self,
        key: &'a str,
        contents: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let full = self.resolve(key);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, contents).await?;
            Ok(())
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(tokio::fs::try_exists(self.resolve(key)).await?) })
    }
}
