//! Run configuration.
//!
//! [`RlmConfig`] carries every knob of a recursive run. Defaults match the
//! reference deployment (a large root model driving a small recursive model,
//! ten iterations, four sandboxes). Values can be overlaid from `RLM_*`
//! environment variables or parsed from a JSON document.

use serde::{Deserialize, Serialize};

use crate::error::{RecurseError, RecurseResult};

pub const DEFAULT_MODEL: &str = "gpt-5";
pub const DEFAULT_RECURSIVE_MODEL: &str = "gpt-5-nano";

/// Where subordinate `llm_query` calls run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubRlmMode {
    /// Direct in-process provider call.
    Local,
    /// Forwarded to a pool of persistent sandboxes.
    PooledRemote,
}

impl std::str::FromStr for SubRlmMode {
    type Err = RecurseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SubRlmMode::Local),
            "pooled-remote" | "pooled_remote" | "pooled" | "remote" => Ok(SubRlmMode::PooledRemote),
            other => Err(RecurseError::Config(format!(
                "unknown sub_rlm_mode '{other}' (expected local or pooled-remote)"
            ))),
        }
    }
}

impl std::fmt::Display for SubRlmMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubRlmMode::Local => write!(f, "local"),
            SubRlmMode::PooledRemote => write!(f, "pooled-remote"),
        }
    }
}

/// How the context is bound inside the snippet namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Text,
    File,
    Segmented,
}

impl std::str::FromStr for ContextMode {
    type Err = RecurseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ContextMode::Text),
            "file" => Ok(ContextMode::File),
            "segmented" => Ok(ContextMode::Segmented),
            other => Err(RecurseError::Config(format!(
                "unknown context_mode '{other}' (expected text, file or segmented)"
            ))),
        }
    }
}

/// Configuration for a recursive run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlmConfig {
    /// Root model identifier.
    pub model: String,
    /// Subordinate model identifier used by `llm_query`.
    pub recursive_model: String,
    /// Turn budget for the root model.
    pub max_iterations: usize,
    /// Number of persistent sandboxes in pooled mode.
    pub pool_size: usize,
    pub sub_rlm_mode: SubRlmMode,
    pub enable_logging: bool,
    /// Ceiling for one steady-state subordinate call.
    pub call_timeout_secs: u64,
    /// Ceiling for constructing one sandbox (cold start).
    pub sandbox_create_timeout_secs: u64,
    /// Snippet output shown back to the root model is cut at this many chars.
    pub max_output_chars: usize,
    /// Turns without any action that do not count against the budget.
    pub max_noop_turns: usize,
    /// Steer the root model towards `PARALLEL_QUERY`.
    pub force_parallel: bool,
    /// Kind of context source `completion` accepts.
    pub context_mode: ContextMode,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            recursive_model: DEFAULT_RECURSIVE_MODEL.into(),
            max_iterations: 10,
            pool_size: 4,
            sub_rlm_mode: SubRlmMode::Local,
            enable_logging: false,
            call_timeout_secs: 300,
            sandbox_create_timeout_secs: 1200,
            max_output_chars: 4000,
            max_noop_turns: 2,
            force_parallel: false,
            context_mode: ContextMode::Text,
        }
    }
}

impl RlmConfig {
    pub fn new(model: impl Into<String>, recursive_model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            recursive_model: recursive_model.into(),
            ..Self::default()
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_mode(mut self, mode: SubRlmMode) -> Self {
        self.sub_rlm_mode = mode;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    pub fn with_context_mode(mut self, mode: ContextMode) -> Self {
        self.context_mode = mode;
        self
    }

    pub fn with_call_timeout(mut self, secs: u64) -> Self {
        self.call_timeout_secs = secs;
        self
    }

    pub fn with_force_parallel(mut self, enabled: bool) -> Self {
        self.force_parallel = enabled;
        self
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> RecurseResult<Self> {
        let config: RlmConfig = serde_json::from_str(raw)
            .map_err(|e| RecurseError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `RLM_*` environment variables.
    pub fn from_env() -> RecurseResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RecurseResult<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("RLM_MODEL") {
            config.model = v;
        }
        if let Some(v) = lookup("RLM_RECURSIVE_MODEL") {
            config.recursive_model = v;
        }
        if let Some(v) = lookup("RLM_MAX_ITERATIONS") {
            config.max_iterations = parse_number("RLM_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("RLM_POOL_SIZE") {
            config.pool_size = parse_number("RLM_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("RLM_SUB_MODE") {
            config.sub_rlm_mode = v.parse()?;
        }
        if let Some(v) = lookup("RLM_ENABLE_LOGGING") {
            config.enable_logging = parse_bool("RLM_ENABLE_LOGGING", &v)?;
        }
        if let Some(v) = lookup("RLM_CALL_TIMEOUT_SECS") {
            config.call_timeout_secs = parse_number("RLM_CALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RLM_SANDBOX_CREATE_TIMEOUT_SECS") {
            config.sandbox_create_timeout_secs =
                parse_number("RLM_SANDBOX_CREATE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RLM_MAX_OUTPUT_CHARS") {
            config.max_output_chars = parse_number("RLM_MAX_OUTPUT_CHARS", &v)?;
        }
        if let Some(v) = lookup("RLM_MAX_NOOP_TURNS") {
            config.max_noop_turns = parse_number("RLM_MAX_NOOP_TURNS", &v)?;
        }
        if let Some(v) = lookup("RLM_FORCE_PARALLEL") {
            config.force_parallel = parse_bool("RLM_FORCE_PARALLEL", &v)?;
        }
        if let Some(v) = lookup("RLM_CONTEXT_MODE") {
            config.context_mode = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RecurseResult<()> {
        if self.max_iterations == 0 {
            return Err(RecurseError::Config("max_iterations must be positive".into()));
        }
        if self.pool_size == 0 {
            return Err(RecurseError::Config("pool_size must be positive".into()));
        }
        if self.call_timeout_secs == 0 || self.sandbox_create_timeout_secs == 0 {
            return Err(RecurseError::Config("timeouts must be positive".into()));
        }
        if self.max_output_chars == 0 {
            return Err(RecurseError::Config("max_output_chars must be positive".into()));
        }
        if self.model.trim().is_empty() || self.recursive_model.trim().is_empty() {
            return Err(RecurseError::Config("model identifiers cannot be empty".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> RecurseResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| RecurseError::Config(format!("{key} must be a non-negative integer, got '{raw}'")))
}

fn parse_bool(key: &str, raw: &str) -> RecurseResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RecurseError::Config(format!("{key} must be a boolean, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = RlmConfig::default();
        assert_eq!(config.model, "gpt-5");
        assert_eq!(config.recursive_model, "gpt-5-nano");
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.sub_rlm_mode, SubRlmMode::Local);
        assert!(!config.enable_logging);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_setters() {
        let config = RlmConfig::new("root", "sub")
            .with_max_iterations(3)
            .with_pool_size(8)
            .with_mode(SubRlmMode::PooledRemote)
            .with_logging(true);
        assert_eq!(config.model, "root");
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.sub_rlm_mode, SubRlmMode::PooledRemote);
        assert!(config.enable_logging);
    }

    #[test]
    fn env_overlay() {
        let config = RlmConfig::from_lookup(lookup_from(&[
            ("RLM_MODEL", "gpt-5-mini"),
            ("RLM_POOL_SIZE", "6"),
            ("RLM_SUB_MODE", "pooled-remote"),
            ("RLM_ENABLE_LOGGING", "yes"),
            ("RLM_CONTEXT_MODE", "segmented"),
        ]))
        .unwrap();
        assert_eq!(config.model, "gpt-5-mini");
        assert_eq!(config.pool_size, 6);
        assert_eq!(config.sub_rlm_mode, SubRlmMode::PooledRemote);
        assert!(config.enable_logging);
        assert_eq!(config.context_mode, ContextMode::Segmented);
        assert_eq!(config.recursive_model, "gpt-5-nano");
    }

    #[test]
    fn env_rejects_garbage() {
        let err = RlmConfig::from_lookup(lookup_from(&[("RLM_MAX_ITERATIONS", "ten")])).unwrap_err();
        assert!(matches!(err, RecurseError::Config(_)));

        let err = RlmConfig::from_lookup(lookup_from(&[("RLM_SUB_MODE", "cloud")])).unwrap_err();
        assert!(err.to_string().contains("cloud"));
    }

    #[test]
    fn validate_rejects_zero_budget() {
        let config = RlmConfig::default().with_max_iterations(0);
        assert!(config.validate().is_err());
        let config = RlmConfig::default().with_pool_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_partial_document() {
        let config =
            RlmConfig::from_json_str(r#"{"max_iterations": 4, "sub_rlm_mode": "pooled-remote"}"#)
                .unwrap();
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.sub_rlm_mode, SubRlmMode::PooledRemote);
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn json_invalid_is_config_error() {
        let err = RlmConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, RecurseError::Config(_)));
    }
}
