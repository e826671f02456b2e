//! Blob Store — keyed text objects backing segmented contexts.
//!
//! A [`BlobStore`] maps string keys (e.g. `runs/42/manifest.json`) to UTF-8
//! objects. [`MemoryBlobStore`] serves tests and small in-process contexts;
//! [`FsBlobStore`] (behind the `native` feature) maps keys onto files under a
//! root directory, which is how a mounted object-store volume appears to a
//! sandbox.

use std::future::Future;
use std::pin::Pin;

use crate::error::RecurseResult;

/// Read/write access to keyed text objects.
///
/// A missing key is reported as `RecurseError::Io` with `ErrorKind::NotFound`.
pub trait BlobStore: Send + Sync {
    /// Fetch the full object as UTF-8 text.
    fn get_text<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<String>> + Send + 'a>>;

    /// Create or overwrite an object.
    fn put_text<'a>(
        &'a self,
        key: &'a str,
        contents: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<()>> + Send + 'a>>;

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RecurseResult<bool>> + Send + 'a>>;
}

mod memory;
pub use memory::MemoryBlobStore;

#[cfg(feature = "native")]
mod fs;
#[cfg(feature = "native")]
pub use fs::FsBlobStore;

pub(crate) fn not_found(key: &str) -> crate::error::RecurseError {
    crate::error::RecurseError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("object not found: {key}"),
    ))
}
