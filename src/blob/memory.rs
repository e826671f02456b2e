//! In-memory blob store.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use crate::error::RecurseResult;

use super::{not_found, BlobStore};

/// Objects held in a `BTreeMap` behind an `RwLock`.
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Builder-style insert, handy for seeding fixtures.
    pub fn with_object(self, key: impl AsRef<str>, contents: impl Into<String>) -> Self {
        self.insert(key.as_ref(), contents);
        self
    }

    pub fn insert(&self, key: &str, contents: impl Into<String>) {
        self.objects
            .write()
            .unwrap()
            .insert(Self::normalize(key), contents.into());
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().unwrap().is_empty()
    }

    fn normalize(key: &str) -> String {
        key.trim_start_matches('/').to_string()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get_text<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<String>> + Send + 'a>> {
        Box::pin(async move {
            let normalized = Self::normalize(key);
            let objects = self.objects.read().unwrap();
            objects
                .get(&normalized)
                .cloned()
                .ok_or_else(|| not_found(&normalized))
        })
    }

    fn put_text<'a>(
        &'a self,
        key: &'a str,
        contents: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.insert(key, contents);
            Ok(())
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            let normalized = Self::normalize(key);
            Ok(self.objects.read().unwrap().contains_key(&normalized))
        })
    }
}
