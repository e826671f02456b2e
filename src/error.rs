use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecurseError {
    #[error("Context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("Manifest load failed: {0}")]
    ManifestLoad(String),

    #[error("Sandbox creation failed: sandbox={sandbox}, {message}")]
    SandboxCreation { sandbox: usize, message: String },

    #[error("Sandbox call failed{}: {message}", fmt_sandbox(.sandbox))]
    SandboxCall {
        sandbox: Option<usize>,
        message: String,
    },

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("Malformed directive: {0}")]
    MalformedDirective(String),

    #[error("Sandbox pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Not supported in this mode: {0}")]
    ModeUnsupported(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider rate limited: {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Snippet error: {0}")]
    Snippet(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

fn fmt_sandbox(sandbox: &Option<usize>) -> String {
    sandbox.map(|k| format!(" (sandbox {k})")).unwrap_or_default()
}

impl RecurseError {
    /// Whether a failed sandbox call is worth one recreate-and-retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecurseError::SandboxCall { .. }
                | RecurseError::SandboxCreation { .. }
                | RecurseError::Timeout { .. }
                | RecurseError::Provider(_)
                | RecurseError::RateLimited { .. }
                | RecurseError::Http(_)
                | RecurseError::Io(_)
        )
    }
}

pub type RecurseResult<T> = Result<T, RecurseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats() {
        let err = RecurseError::ContextUnavailable("missing.txt".into());
        assert_eq!(err.to_string(), "Context unavailable: missing.txt");

        let err = RecurseError::SandboxCall {
            sandbox: Some(2),
            message: "exit 1".into(),
        };
        assert_eq!(err.to_string(), "Sandbox call failed (sandbox 2): exit 1");

        let err = RecurseError::SandboxCall {
            sandbox: None,
            message: "exit 1".into(),
        };
        assert_eq!(err.to_string(), "Sandbox call failed: exit 1");

        let err = RecurseError::Timeout {
            operation: "worker call".into(),
            secs: 300,
        };
        assert!(err.to_string().contains("300s"));
    }

    #[test]
    fn retryable_classification() {
        assert!(RecurseError::Timeout {
            operation: "x".into(),
            secs: 1
        }
        .is_retryable());
        assert!(RecurseError::SandboxCreation {
            sandbox: 0,
            message: "boom".into()
        }
        .is_retryable());
        assert!(!RecurseError::Config("bad".into()).is_retryable());
        assert!(!RecurseError::MalformedDirective("FINAL_VAR(x)".into()).is_retryable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RecurseError>();
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RecurseError = io_err.into();
        assert!(matches!(err, RecurseError::Io(_)));
    }

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: RecurseError = json_err.into();
        assert!(matches!(err, RecurseError::Serialization(_)));
    }
}
