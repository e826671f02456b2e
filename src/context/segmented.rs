//! Manifest-indexed, line-addressable context over a [`BlobStore`].
//!
//! The manifest is a JSON array of `{segment, start_line, line_count}`
//! records. It is fetched on first use and cached for the lifetime of the
//! [`SegmentedContext`]. A slice only fetches the segments it overlaps.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::blob::BlobStore;
use crate::error::{RecurseError, RecurseResult};
use crate::runlog::RunLogger;

pub const DEFAULT_MANIFEST_NAME: &str = "manifest.json";

const SOURCE: &str = "context";

/// One independently fetchable run of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Storage key, possibly relative to the context prefix.
    #[serde(rename = "segment")]
    pub key: String,
    pub start_line: usize,
    pub line_count: usize,
}

impl Segment {
    pub fn new(key: impl Into<String>, start_line: usize, line_count: usize) -> Self {
        Self {
            key: key.into(),
            start_line,
            line_count,
        }
    }

    /// First line past this segment.
    pub fn end_line(&self) -> usize {
        self.start_line + self.line_count
    }
}

/// Segments sorted ascending by `start_line`. Gaps between segments are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    segments: Vec<Segment>,
}

impl Manifest {
    pub fn new(mut segments: Vec<Segment>) -> Self {
        segments.sort_by_key(|s| s.start_line);
        Self { segments }
    }

    /// Parse the manifest document; record order in the file is irrelevant.
    pub fn parse(raw: &str) -> RecurseResult<Self> {
        let segments: Vec<Segment> = serde_json::from_str(raw)
            .map_err(|e| RecurseError::ManifestLoad(format!("invalid manifest: {e}")))?;
        Ok(Self::new(segments))
    }

    pub fn to_json(&self) -> RecurseResult<String> {
        Ok(serde_json::to_string_pretty(&self.segments)?)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// `last.start_line + last.line_count`, or 0 for an empty manifest.
    pub fn total_lines(&self) -> usize {
        self.segments.last().map(Segment::end_line).unwrap_or(0)
    }
}

/// Rebase negative indices from the end, then clamp both bounds into `[0, total]`.
pub fn clamp_range(start: i64, stop: i64, total: usize) -> (usize, usize) {
    let total_i = total as i64;
    let rebase = |i: i64| if i < 0 { i + total_i } else { i };
    let clamp = |i: i64| i.clamp(0, total_i) as usize;
    (clamp(rebase(start)), clamp(rebase(stop)))
}

/// Line-addressable view over a manifest plus its segment objects.
pub struct SegmentedContext {
    store: Arc<dyn BlobStore>,
    prefix: String,
    manifest_name: String,
    manifest: OnceCell<Manifest>,
    logger: Arc<RunLogger>,
}

impl SegmentedContext {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            manifest_name: DEFAULT_MANIFEST_NAME.into(),
            manifest: OnceCell::new(),
            logger: Arc::new(RunLogger::disabled()),
        }
    }

    pub fn with_manifest_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_name = name.into();
        self
    }

    pub fn with_logger(mut self, logger: Arc<RunLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn manifest_key(&self) -> String {
        format!("{}{}", self.prefix, self.manifest_name)
    }

    /// Segment keys get the prefix prepended unless they already carry it.
    pub fn full_key(&self, segment_key: &str) -> String {
        if !self.prefix.is_empty() && !segment_key.starts_with(&self.prefix) {
            format!("{}{}", self.prefix, segment_key)
        } else {
            segment_key.to_string()
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.manifest.initialized()
    }

    /// The cached manifest, loading it on first call.
    pub async fn manifest(&self) -> RecurseResult<&Manifest> {
        self.manifest.get_or_try_init(|| self.load_manifest()).await
    }

    async fn load_manifest(&self) -> RecurseResult<Manifest> {
        let started = Instant::now();
        let key = self.manifest_key();
        self.logger.debug(SOURCE, format!("loading manifest {key}"));

        let raw = match self.store.get_text(&key).await {
            Ok(raw) => raw,
            Err(RecurseError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RecurseError::ContextUnavailable(format!("manifest {key} not found")));
            }
            Err(e) => return Err(RecurseError::ManifestLoad(format!("{key}: {e}"))),
        };
        let manifest = Manifest::parse(&raw)?;

        self.logger.info(
            SOURCE,
            format!(
                "manifest loaded; segments={}, total_lines={}, took={:.2}s",
                manifest.len(),
                manifest.total_lines(),
                started.elapsed().as_secs_f64()
            ),
        );
        Ok(manifest)
    }

    /// Total addressable lines.
    pub async fn length(&self) -> RecurseResult<usize> {
        Ok(self.manifest().await?.total_lines())
    }

    /// Lines `[start, stop)` with terminators preserved. Negative indices
    /// count from the end; lines inside manifest gaps are skipped.
    pub async fn slice(&self, start: i64, stop: i64) -> RecurseResult<String> {
        let manifest = self.manifest().await?;
        let (start, stop) = clamp_range(start, stop, manifest.total_lines());
        if stop <= start {
            self.logger.debug(SOURCE, format!("slice[{start}:{stop}] -> empty"));
            return Ok(String::new());
        }

        let started = Instant::now();
        let mut result = String::new();
        let mut touched = 0usize;

        for seg in manifest.segments() {
            if seg.end_line() <= start {
                continue;
            }
            if seg.start_line >= stop {
                break;
            }

            let local_start = start.saturating_sub(seg.start_line);
            let local_stop = seg.line_count.min(stop - seg.start_line);
            if local_stop <= local_start {
                continue;
            }

            let body = self.store.get_text(&self.full_key(&seg.key)).await?;
            touched += 1;
            for line in body
                .split_inclusive('\n')
                .skip(local_start)
                .take(local_stop - local_start)
            {
                result.push_str(line);
            }
        }

        self.logger.debug(
            SOURCE,
            format!(
                "slice[{start}:{stop}] done; segments={touched}, chars={}, took={:.2}s",
                result.len(),
                started.elapsed().as_secs_f64()
            ),
        );
        Ok(result)
    }

    /// The whole context. Only sensible for small contexts.
    pub async fn read_all(&self) -> RecurseResult<String> {
        let total = self.length().await? as i64;
        self.slice(0, total).await
    }
}

/// Split `text` into segments of `lines_per_segment` lines, store each under
/// `prefix`, and write the manifest. Returns the manifest written.
pub async fn publish(
    store: &dyn BlobStore,
    prefix: &str,
    text: &str,
    lines_per_segment: usize,
) -> RecurseResult<Manifest> {
    if lines_per_segment == 0 {
        return Err(RecurseError::Config("lines_per_segment must be positive".into()));
    }
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut segments = Vec::new();
    for (idx, chunk) in lines.chunks(lines_per_segment).enumerate() {
        let key = format!("segment_{idx:06}.log");
        store
            .put_text(&format!("{prefix}{key}"), &chunk.concat())
            .await?;
        segments.push(Segment::new(key, idx * lines_per_segment, chunk.len()));
    }
    let manifest = Manifest::new(segments);
    store
        .put_text(&format!("{prefix}{DEFAULT_MANIFEST_NAME}"), &manifest.to_json()?)
        .await?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::runlog::MemorySink;

    fn numbered(from: usize, to: usize) -> String {
        (from..to).map(|i| format!("line {i}\n")).collect()
    }

    fn three_segment_store() -> Arc<MemoryBlobStore> {
        let manifest = r#"[
            {"segment": "seg-2.log", "start_line": 1000, "line_count": 500},
            {"segment": "seg-0.log", "start_line": 0, "line_count": 500},
            {"segment": "seg-1.log", "start_line": 500, "line_count": 500}
        ]"#;
        Arc::new(
            MemoryBlobStore::new()
                .with_object("ctx/manifest.json", manifest)
                .with_object("ctx/seg-0.log", numbered(0, 500))
                .with_object("ctx/seg-1.log", numbered(500, 1000))
                .with_object("ctx/seg-2.log", numbered(1000, 1500)),
        )
    }

    #[test]
    fn manifest_sorts_on_parse() {
        let manifest = Manifest::parse(
            r#"[{"segment": "b", "start_line": 10, "line_count": 5},
                {"segment": "a", "start_line": 0, "line_count": 10}]"#,
        )
        .unwrap();
        assert_eq!(manifest.segments()[0].key, "a");
        assert_eq!(manifest.total_lines(), 15);
    }

    #[test]
    fn empty_manifest_has_zero_lines() {
        assert_eq!(Manifest::parse("[]").unwrap().total_lines(), 0);
    }

    #[test]
    fn bad_manifest_is_manifest_error() {
        let err = Manifest::parse(r#"{"segment": "a"}"#).unwrap_err();
        assert!(matches!(err, RecurseError::ManifestLoad(_)));
    }

    #[test]
    fn clamp_range_rebases_negatives() {
        assert_eq!(clamp_range(-10, -1, 100), (90, 99));
        assert_eq!(clamp_range(-500, 5000, 100), (0, 100));
        assert_eq!(clamp_range(50, 20, 100), (50, 20));
    }

    #[test]
    fn full_key_respects_existing_prefix() {
        let ctx = SegmentedContext::new(Arc::new(MemoryBlobStore::new()), "runs/7/");
        assert_eq!(ctx.manifest_key(), "runs/7/manifest.json");
        assert_eq!(ctx.full_key("seg.log"), "runs/7/seg.log");
        assert_eq!(ctx.full_key("runs/7/seg.log"), "runs/7/seg.log");
        let bare = SegmentedContext::new(Arc::new(MemoryBlobStore::new()), "");
        assert_eq!(bare.full_key("seg.log"), "seg.log");
    }

    #[tokio::test]
    async fn slice_across_segment_boundary() {
        let ctx = SegmentedContext::new(three_segment_store(), "ctx/");
        assert_eq!(ctx.length().await.unwrap(), 1500);
        let text = ctx.slice(450, 550).await.unwrap();
        assert_eq!(text, numbered(450, 550));
        assert_eq!(text.lines().count(), 100);
    }

    #[tokio::test]
    async fn slice_negative_and_empty() {
        let ctx = SegmentedContext::new(three_segment_store(), "ctx/");
        assert_eq!(ctx.slice(-3, -1).await.unwrap(), numbered(1497, 1499));
        assert_eq!(ctx.slice(10, 10).await.unwrap(), "");
        assert_eq!(ctx.slice(900, 100).await.unwrap(), "");
        assert_eq!(ctx.slice(-1, -5).await.unwrap(), "");
    }

    #[tokio::test]
    async fn empty_slice_does_not_touch_segments() {
        let store = Arc::new(
            MemoryBlobStore::new()
                .with_object("manifest.json", r#"[{"segment": "gone.log", "start_line": 0, "line_count": 10}]"#),
        );
        let ctx = SegmentedContext::new(store, "");
        assert_eq!(ctx.slice(5, 5).await.unwrap(), "");
        assert!(ctx.slice(0, 5).await.is_err());
    }

    #[tokio::test]
    async fn gaps_are_skipped() {
        let store = Arc::new(
            MemoryBlobStore::new()
                .with_object(
                    "manifest.json",
                    r#"[{"segment": "a", "start_line": 0, "line_count": 2},
                        {"segment": "b", "start_line": 5, "line_count": 2}]"#,
                )
                .with_object("a", "a0\na1\n")
                .with_object("b", "b0\nb1\n"),
        );
        let ctx = SegmentedContext::new(store, "");
        assert_eq!(ctx.length().await.unwrap(), 7);
        assert_eq!(ctx.slice(0, 7).await.unwrap(), "a0\na1\nb0\nb1\n");
        assert_eq!(ctx.slice(2, 5).await.unwrap(), "");
        assert_eq!(ctx.slice(1, 6).await.unwrap(), "a1\nb0\n");
    }

    #[tokio::test]
    async fn missing_manifest_is_unavailable() {
        let ctx = SegmentedContext::new(Arc::new(MemoryBlobStore::new()), "nowhere/");
        let err = ctx.length().await.unwrap_err();
        assert!(matches!(err, RecurseError::ContextUnavailable(_)));
        assert!(!ctx.is_loaded());
    }

    #[tokio::test]
    async fn publish_then_read_back() {
        let store = Arc::new(MemoryBlobStore::new());
        let text = numbered(0, 23);
        let manifest = publish(store.as_ref(), "p/", &text, 5).await.unwrap();
        assert_eq!(manifest.len(), 5);
        assert_eq!(manifest.total_lines(), 23);

        let ctx = SegmentedContext::new(store, "p/");
        assert_eq!(ctx.read_all().await.unwrap(), text);
    }

    #[tokio::test]
    async fn logs_manifest_and_slice() {
        let sink = Arc::new(MemorySink::new());
        let logger = Arc::new(RunLogger::new().with_sink(sink.clone()));
        let ctx = SegmentedContext::new(three_segment_store(), "ctx/").with_logger(logger);
        ctx.slice(0, 10).await.unwrap();
        let messages = sink.messages_from("context");
        assert!(messages.iter().any(|m| m.contains("segments=3, total_lines=1500")));
        assert!(messages.iter().any(|m| m.contains("slice[0:10] done; segments=1")));
    }
}
