//! Run Log — structured event log for recursive runs.
//!
//! Every iteration, snippet execution, pool event and context read flows
//! through a single [`RunLogger`] that fans out to any number of sinks.
//! When `enable_logging` is off the logger has no sinks and every call is a
//! cheap early return.
//!
//! ```text
//! RlmEngine / SandboxPool / SegmentedContext
//!           │
//!           ▼
//!      RunLogger::log(entry)
//!           │
//!      ┌────┼────┐
//!      ▼    ▼    ▼
//!   Sink1 Sink2 Sink3
//!  (tracing)(stdout)(memory)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RlmConfig;

/// Severity levels for run log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// A structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Emitting component (e.g. "orchestrator", "pool:sandbox[2]", "context").
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            task_id: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Format as a single-line log string.
    pub fn format_line(&self) -> String {
        let ts = self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let task = self
            .task_id
            .as_deref()
            .map(|s| format!(" [{s}]"))
            .unwrap_or_default();
        format!("{ts} {} [{}]{} {}", self.level, self.source, task, self.message)
    }
}

/// Output target for log entries. Must be `Send + Sync` for use across sandbox tasks.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);

    fn flush(&self) {}
}

/// Fans entries out to every attached sink.
pub struct RunLogger {
    sinks: Vec<Arc<dyn LogSink>>,
    min_level: LogLevel,
    task_id: Option<String>,
}

impl RunLogger {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            min_level: LogLevel::Trace,
            task_id: None,
        }
    }

    /// Logger with no sinks; every call is a no-op.
    pub fn disabled() -> Self {
        Self::new()
    }

    /// Tracing-backed logger when `enable_logging` is set, otherwise disabled.
    pub fn from_config(config: &RlmConfig) -> Self {
        let mut logger = Self::new().with_level(LogLevel::Debug);
        if config.enable_logging {
            logger.add_sink(Arc::new(TracingSink));
        }
        logger
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Stamp every entry with this task id.
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    pub fn is_enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    pub fn log(&self, entry: LogEntry) {
        if self.sinks.is_empty() || entry.level < self.min_level {
            return;
        }
        let entry = match (&self.task_id, entry.task_id.is_none()) {
            (Some(task), true) => entry.with_task(task.clone()),
            _ => entry,
        };
        for sink in &self.sinks {
            sink.write(&entry);
        }
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, source, message));
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, source, message));
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, source, message));
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, source, message));
    }

    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for RunLogger {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Built-in Sinks ────────────────────────────────────────────────────────

/// Forwards entries into the `tracing` ecosystem.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &LogEntry) {
        let task = entry.task_id.as_deref().unwrap_or("");
        match entry.level {
            LogLevel::Trace => {
                tracing::trace!(target: "deeprecurse", component = %entry.source, task = task, "{}", entry.message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "deeprecurse", component = %entry.source, task = task, "{}", entry.message)
            }
            LogLevel::Info => {
                tracing::info!(target: "deeprecurse", component = %entry.source, task = task, "{}", entry.message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "deeprecurse", component = %entry.source, task = task, "{}", entry.message)
            }
            LogLevel::Error => {
                tracing::error!(target: "deeprecurse", component = %entry.source, task = task, "{}", entry.message)
            }
        }
    }
}

/// Writes formatted lines to stdout.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write(&self, entry: &LogEntry) {
        println!("{}", entry.format_line());
    }
}

/// Collects entries in memory (for testing / inspection).
pub struct MemorySink {
    entries: std::sync::Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Messages of entries emitted by `source`.
    pub fn messages_from(&self, source: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.source == source)
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

/// Hands each entry to a callback.
pub struct CallbackSink {
    callback: Box<dyn Fn(&LogEntry) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(&LogEntry) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl LogSink for CallbackSink {
    fn write(&self, entry: &LogEntry) {
        (self.callback)(entry);
    }
}
