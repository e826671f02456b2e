//! Worker Protocol — one subordinate-model call per request.
//!
//! The wire format is a single JSON object delivered once on the worker's
//! input channel:
//!
//! ```json
//! {"prompt": "text" | {"role": "...", "content": "..."} | [{...}, ...], "model": "gpt-5-nano"}
//! ```
//!
//! On success the reply text is written to the output channel. On failure
//! the worker writes `ERROR: <diagnostic>` to its error channel and exits
//! non-zero. No streaming.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::DEFAULT_MODEL;
use crate::error::{RecurseError, RecurseResult};
use crate::provider::Provider;
use crate::types::PromptPayload;

#[cfg(feature = "native")]
mod process;
#[cfg(feature = "native")]
pub use process::ProcessWorker;

/// One subordinate call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub prompt: PromptPayload,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl WorkerRequest {
    pub fn new(prompt: impl Into<PromptPayload>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
        }
    }

    pub fn to_json(&self) -> RecurseResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a request, rejecting prompts that are not text, a turn, or a turn list.
    pub fn parse(raw: &str) -> RecurseResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        match value.get("prompt") {
            Some(serde_json::Value::String(_))
            | Some(serde_json::Value::Object(_))
            | Some(serde_json::Value::Array(_)) => {}
            Some(other) => {
                return Err(RecurseError::Config(format!(
                    "unsupported prompt type: {}",
                    json_type_name(other)
                )))
            }
            None => return Err(RecurseError::Config("request has no prompt".into())),
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Executes Worker Protocol requests.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn call(&self, request: &WorkerRequest) -> RecurseResult<String>;
}

/// Calls the provider directly in the current process.
pub struct InProcessWorker {
    provider: Arc<dyn Provider>,
}

impl InProcessWorker {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Worker for InProcessWorker {
    async fn call(&self, request: &WorkerRequest) -> RecurseResult<String> {
        let messages = request.prompt.clone().into_messages();
        let reply = self.provider.complete(&messages, &request.model).await?;
        Ok(reply.content)
    }
}

/// Worker side: read one request from `input`, answer it on `output`.
pub async fn serve<R, W>(provider: &dyn Provider, mut input: R, mut output: W) -> RecurseResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = String::new();
    input.read_to_string(&mut raw).await?;
    let request = WorkerRequest::parse(&raw)?;
    tracing::debug!(
        model = %request.model,
        prompt_chars = request.prompt.char_len(),
        "worker request"
    );

    let messages = request.prompt.into_messages();
    let reply = provider.complete(&messages, &request.model).await?;

    output.write_all(reply.content.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::types::Role;

    #[test]
    fn request_defaults_model() {
        let req = WorkerRequest::parse(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(req.model, "gpt-5");
        assert_eq!(req.prompt, PromptPayload::Text("hi".into()));
    }

    #[test]
    fn request_rejects_number_prompt() {
        let err = WorkerRequest::parse(r#"{"prompt": 7, "model": "m"}"#).unwrap_err();
        assert!(err.to_string().contains("unsupported prompt type: number"));
    }

    #[test]
    fn request_rejects_missing_prompt() {
        assert!(WorkerRequest::parse(r#"{"model": "m"}"#).is_err());
        assert!(WorkerRequest::parse("not json").is_err());
    }

    #[test]
    fn request_serializes_wire_shape() {
        let json = WorkerRequest::new("q", "gpt-5-nano").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["prompt"], "q");
        assert_eq!(value["model"], "gpt-5-nano");
    }

    #[tokio::test]
    async fn in_process_worker_uses_requested_model() {
        let provider = Arc::new(ScriptedProvider::always("pong"));
        let worker = InProcessWorker::new(provider.clone());
        let reply = worker
            .call(&WorkerRequest::new("ping", "gpt-5-nano"))
            .await
            .unwrap();
        assert_eq!(reply, "pong");
        let calls = provider.calls();
        assert_eq!(calls[0].0, "gpt-5-nano");
        assert_eq!(calls[0].1[0].role, Role::User);
    }

    #[tokio::test]
    async fn serve_writes_reply() {
        let provider = ScriptedProvider::always("the answer");
        let input = br#"{"prompt": [{"role": "system", "content": "s"}, {"role": "user", "content": "u"}], "model": "m"}"#;
        let mut out = Vec::new();
        serve(&provider, &input[..], &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "the answer");
        assert_eq!(provider.calls()[0].1.len(), 2);
    }

    #[tokio::test]
    async fn serve_propagates_provider_failure() {
        let provider = ScriptedProvider::new(Vec::<String>::new());
        let mut out = Vec::new();
        let err = serve(&provider, &br#"{"prompt": "x"}"#[..], &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, RecurseError::Provider(_)));
        assert!(out.is_empty());
    }
}
