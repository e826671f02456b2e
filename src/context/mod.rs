//! Context bindings for a recursive run.
//!
//! A task's context is one of three shapes:
//!
//! - [`ContextSource::Text`]: the full text, held in memory.
//! - [`ContextSource::File`]: a path, read lazily on first access and
//!   exposed to snippets as `context_path`.
//! - [`ContextSource::Segmented`]: a manifest-backed [`SegmentedContext`]
//!   that never materializes more than the requested lines.
//!
//! [`ContextSource::open`] validates the source before the iteration loop
//! starts and yields a [`ContextHandle`], which gives every shape the same
//! line-addressable surface.

mod segmented;

pub use segmented::{clamp_range, publish, Manifest, Segment, SegmentedContext, DEFAULT_MANIFEST_NAME};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::ContextMode;
use crate::error::{RecurseError, RecurseResult};

const PREVIEW_LINES: i64 = 5;

/// Where a task's context comes from.
pub enum ContextSource {
    Text(String),
    File(PathBuf),
    Segmented(SegmentedContext),
}

impl ContextSource {
    pub fn text(text: impl Into<String>) -> Self {
        ContextSource::Text(text.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        ContextSource::File(path.into())
    }

    pub fn mode(&self) -> ContextMode {
        match self {
            ContextSource::Text(_) => ContextMode::Text,
            ContextSource::File(_) => ContextMode::File,
            ContextSource::Segmented(_) => ContextMode::Segmented,
        }
    }

    /// Check the source is reachable. Any failure here aborts the task.
    pub async fn open(self) -> RecurseResult<ContextHandle> {
        match self {
            ContextSource::Text(text) => Ok(ContextHandle::Text(Arc::new(text))),
            ContextSource::File(path) => {
                let meta = tokio::fs::metadata(&path).await.map_err(|e| {
                    RecurseError::ContextUnavailable(format!("{}: {e}", path.display()))
                })?;
                if !meta.is_file() {
                    return Err(RecurseError::ContextUnavailable(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }
                Ok(ContextHandle::File {
                    path,
                    text: Arc::new(OnceCell::new()),
                })
            }
            ContextSource::Segmented(ctx) => {
                ctx.manifest().await?;
                Ok(ContextHandle::Segmented(Arc::new(ctx)))
            }
        }
    }
}

/// An opened context. Cheap to clone.
#[derive(Clone)]
pub enum ContextHandle {
    Text(Arc<String>),
    File {
        path: PathBuf,
        text: Arc<OnceCell<String>>,
    },
    Segmented(Arc<SegmentedContext>),
}

impl ContextHandle {
    pub fn mode(&self) -> ContextMode {
        match self {
            ContextHandle::Text(_) => ContextMode::Text,
            ContextHandle::File { .. } => ContextMode::File,
            ContextHandle::Segmented(_) => ContextMode::Segmented,
        }
    }

    /// Backing file path in file mode.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ContextHandle::File { path, .. } => Some(path),
            _ => None,
        }
    }

    async fn materialized(&self) -> RecurseResult<&str> {
        match self {
            ContextHandle::Text(text) => Ok(text.as_str()),
            ContextHandle::File { path, text } => {
                let text = text
                    .get_or_try_init(|| async {
                        tokio::fs::read_to_string(path).await.map_err(|e| {
                            RecurseError::ContextUnavailable(format!("{}: {e}", path.display()))
                        })
                    })
                    .await?;
                Ok(text.as_str())
            }
            ContextHandle::Segmented(_) => Err(RecurseError::Snippet(
                "segmented context cannot be materialized; use SLICE".into(),
            )),
        }
    }

    /// Number of lines.
    pub async fn line_count(&self) -> RecurseResult<usize> {
        match self {
            ContextHandle::Segmented(ctx) => ctx.length().await,
            _ => Ok(self.materialized().await?.split_inclusive('\n').count()),
        }
    }

    /// Lines `[start, stop)` with terminators, Python slice semantics.
    pub async fn slice(&self, start: i64, stop: i64) -> RecurseResult<String> {
        match self {
            ContextHandle::Segmented(ctx) => ctx.slice(start, stop).await,
            _ => {
                let text = self.materialized().await?;
                Ok(slice_lines(text, start, stop))
            }
        }
    }

    /// Full text. Segmented contexts are read segment by segment.
    pub async fn read_all(&self) -> RecurseResult<String> {
        match self {
            ContextHandle::Segmented(ctx) => ctx.read_all().await,
            _ => Ok(self.materialized().await?.to_string()),
        }
    }

    /// Shape, size, and a short preview, shown to the root model at start.
    pub async fn metadata(&self) -> RecurseResult<String> {
        let lines = self.line_count().await?;
        let preview = self.slice(0, PREVIEW_LINES).await?;
        let header = match self {
            ContextHandle::Text(text) => {
                format!("Context: text, {lines} lines, {} chars", text.len())
            }
            ContextHandle::File { path, .. } => {
                let chars = self.materialized().await?.len();
                format!(
                    "Context: file at context_path = {}, {lines} lines, {chars} chars",
                    path.display()
                )
            }
            ContextHandle::Segmented(ctx) => {
                let segments = ctx.manifest().await?.len();
                format!("Context: segmented, {lines} lines across {segments} segments")
            }
        };
        Ok(format!("{header}\nFirst lines:\n{preview}"))
    }
}

/// Python-style line slice over in-memory text.
pub fn slice_lines(text: &str, start: i64, stop: i64) -> String {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let (start, stop) = clamp_range(start, stop, lines.len());
    if stop <= start {
        return String::new();
    }
    lines[start..stop].concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn slice_lines_python_semantics() {
        let text = "a\nb\nc\nd";
        assert_eq!(slice_lines(text, 1, 3), "b\nc\n");
        assert_eq!(slice_lines(text, -1, 10), "d");
        assert_eq!(slice_lines(text, 3, 1), "");
    }

    #[tokio::test]
    async fn text_handle_metadata() {
        let handle = ContextSource::text("one\ntwo\nthree\n").open().await.unwrap();
        assert_eq!(handle.mode(), ContextMode::Text);
        assert_eq!(handle.line_count().await.unwrap(), 3);
        let meta = handle.metadata().await.unwrap();
        assert!(meta.contains("3 lines"));
        assert!(meta.contains("one\ntwo"));
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let err = ContextSource::file("/definitely/not/here.txt")
            .open()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RecurseError::ContextUnavailable(_)));
    }

    #[tokio::test]
    async fn file_handle_reads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.txt");
        tokio::fs::write(&path, "x\ny\nz\n").await.unwrap();
        let handle = ContextSource::file(&path).open().await.unwrap();
        assert_eq!(handle.path(), Some(path.as_path()));
        assert_eq!(handle.slice(1, 2).await.unwrap(), "y\n");
        assert!(handle.metadata().await.unwrap().contains("context_path"));
    }

    #[tokio::test]
    async fn segmented_without_manifest_is_unavailable() {
        let ctx = SegmentedContext::new(Arc::new(MemoryBlobStore::new()), "p/");
        let err = ContextSource::Segmented(ctx).open().await.err().unwrap();
        assert!(matches!(err, RecurseError::ContextUnavailable(_)));
    }

    #[tokio::test]
    async fn segmented_handle_refuses_materialize_but_slices() {
        let store = Arc::new(MemoryBlobStore::new());
        publish(store.as_ref(), "", "l0\nl1\nl2\n", 2).await.unwrap();
        let handle = ContextSource::Segmented(SegmentedContext::new(store, ""))
            .open()
            .await
            .unwrap();
        assert_eq!(handle.line_count().await.unwrap(), 3);
        assert_eq!(handle.slice(1, 3).await.unwrap(), "l1\nl2\n");
        assert!(handle.metadata().await.unwrap().contains("2 segments"));
    }
}
