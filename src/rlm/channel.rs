//! Routes `llm_query` / `parallel_llm_query` from snippets to a subordinate model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SubRlmMode;
use crate::error::{RecurseError, RecurseResult};
use crate::provider::Provider;
use crate::sandbox::SandboxPool;
use crate::types::PromptPayload;
use crate::worker::{InProcessWorker, Worker, WorkerRequest};

enum Route {
    Local { worker: Arc<dyn Worker>, model: String },
    Pooled(SandboxPool),
}

/// Subordinate-model access handed to the interpreter.
pub struct QueryChannel {
    route: Route,
    calls: AtomicUsize,
}

impl QueryChannel {
    /// Direct calls through `worker` using `model`.
    pub fn local(worker: Arc<dyn Worker>, model: impl Into<String>) -> Self {
        Self {
            route: Route::Local {
                worker,
                model: model.into(),
            },
            calls: AtomicUsize::new(0),
        }
    }

    /// In-process calls against a provider.
    pub fn in_process(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self::local(Arc::new(InProcessWorker::new(provider)), model)
    }

    /// Calls forwarded to a sandbox pool.
    pub fn pooled(pool: SandboxPool) -> Self {
        Self {
            route: Route::Pooled(pool),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> SubRlmMode {
        match self.route {
            Route::Local { .. } => SubRlmMode::Local,
            Route::Pooled(_) => SubRlmMode::PooledRemote,
        }
    }

    pub fn supports_parallel(&self) -> bool {
        matches!(self.route, Route::Pooled(_))
    }

    pub fn pool(&self) -> Option<&SandboxPool> {
        match &self.route {
            Route::Pooled(pool) => Some(pool),
            Route::Local { .. } => None,
        }
    }

    /// Subordinate calls issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn llm_query(&self, prompt: impl Into<PromptPayload>) -> RecurseResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.route {
            Route::Local { worker, model } => {
                worker.call(&WorkerRequest::new(prompt, model.clone())).await
            }
            Route::Pooled(pool) => pool.query(prompt).await,
        }
    }

    /// One answer per prompt, in prompt order. Pooled mode only.
    ///
    /// Individual sandbox failures come back as placeholder strings, not errors.
    pub async fn parallel_llm_query(&self, prompts: Vec<PromptPayload>) -> RecurseResult<Vec<String>> {
        match &self.route {
            Route::Local { .. } => Err(RecurseError::ModeUnsupported(
                "parallel_llm_query needs the pooled-remote sub-call mode".into(),
            )),
            Route::Pooled(pool) => {
                self.calls.fetch_add(prompts.len(), Ordering::SeqCst);
                pool.parallel_query(prompts).await
            }
        }
    }

    /// Sequential fan-out usable in any mode.
    pub async fn each(&self, prompts: Vec<String>) -> RecurseResult<Vec<String>> {
        let mut results = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            results.push(self.llm_query(prompt).await?);
        }
        Ok(results)
    }
}

impl std::fmt::Debug for QueryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryChannel")
            .field("mode", &self.mode())
            .field("calls", &self.calls())
            .finish()
    }
}
