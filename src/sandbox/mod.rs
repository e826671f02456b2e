//! Persistent execution sandboxes for subordinate-model calls.
//!
//! A [`Sandbox`] wraps the Worker Protocol behind an isolated, long-lived
//! execution context. A [`SandboxFactory`] builds them; the [`SandboxPool`]
//! owns a fixed number of them and dispatches prompts across them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{RecurseError, RecurseResult};
use crate::provider::Provider;
use crate::worker::{InProcessWorker, Worker, WorkerRequest};

mod mock;
mod pool;

pub use mock::{MockSandbox, MockSandboxFactory};
pub use pool::{CallPhase, SandboxPool, SandboxPoolBuilder, PLACEHOLDER_PREFIX};

/// One live execution sandbox. Replaced wholesale on failure, never repaired.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn completion(&self, request: &WorkerRequest) -> RecurseResult<String>;

    /// Release the sandbox. Callers treat failures here as best-effort.
    async fn close(&self) -> RecurseResult<()>;
}

/// Builds sandboxes for pool slots.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, index: usize) -> RecurseResult<Arc<dyn Sandbox>>;
}

/// Sandbox that forwards to a [`Worker`] until closed.
pub struct WorkerSandbox {
    id: String,
    worker: Arc<dyn Worker>,
    closed: AtomicBool,
}

impl WorkerSandbox {
    pub fn new(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: id.into(),
            worker,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for WorkerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn completion(&self, request: &WorkerRequest) -> RecurseResult<String> {
        if self.is_closed() {
            return Err(RecurseError::SandboxCall {
                sandbox: None,
                message: format!("sandbox {} is closed", self.id),
            });
        }
        self.worker.call(request).await
    }

    async fn close(&self) -> RecurseResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type WorkerBuilder = dyn Fn(usize) -> RecurseResult<Arc<dyn Worker>> + Send + Sync;

/// Factory producing a [`WorkerSandbox`] per slot.
pub struct WorkerSandboxFactory {
    build: Box<WorkerBuilder>,
}

impl WorkerSandboxFactory {
    pub fn new(
        build: impl Fn(usize) -> RecurseResult<Arc<dyn Worker>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            build: Box::new(build),
        }
    }

    /// Every sandbox calls the provider in-process.
    pub fn in_process(provider: Arc<dyn Provider>) -> Self {
        Self::new(move |_| Ok(Arc::new(InProcessWorker::new(provider.clone())) as Arc<dyn Worker>))
    }

    /// Every sandbox runs the worker binary as a child process per call.
    #[cfg(feature = "native")]
    pub fn process(worker: crate::worker::ProcessWorker) -> Self {
        Self::new(move |_| Ok(Arc::new(worker.clone()) as Arc<dyn Worker>))
    }
}

#[async_trait]
impl SandboxFactory for WorkerSandboxFactory {
    async fn create(&self, index: usize) -> RecurseResult<Arc<dyn Sandbox>> {
        let worker = (self.build)(index).map_err(|e| RecurseError::SandboxCreation {
            sandbox: index,
            message: e.to_string(),
        })?;
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("sb-{index}-{}", &short[..8]);
        Ok(Arc::new(WorkerSandbox::new(id, worker)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    #[tokio::test]
    async fn worker_sandbox_refuses_after_close() {
        let factory = WorkerSandboxFactory::in_process(Arc::new(ScriptedProvider::always("ok")));
        let sandbox = factory.create(3).await.unwrap();
        assert!(sandbox.id().starts_with("sb-3-"));
        let req = WorkerRequest::new("q", "m");
        assert_eq!(sandbox.completion(&req).await.unwrap(), "ok");
        sandbox.close().await.unwrap();
        assert!(matches!(
            sandbox.completion(&req).await.unwrap_err(),
            RecurseError::SandboxCall { .. }
        ));
    }

    #[tokio::test]
    async fn factory_builder_failure_is_creation_error() {
        let factory = WorkerSandboxFactory::new(|_| Err(RecurseError::Config("no image".into())));
        let err = factory.create(1).await.err().unwrap();
        assert!(matches!(err, RecurseError::SandboxCreation { sandbox: 1, .. }));
    }

    #[tokio::test]
    async fn sandbox_ids_are_unique() {
        let factory = WorkerSandboxFactory::in_process(Arc::new(ScriptedProvider::always("ok")));
        let a = factory.create(0).await.unwrap();
        let b = factory.create(0).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[cfg(all(unix, feature = "native"))]
    #[tokio::test]
    async fn process_sandboxes_serve_a_pool_in_order() {
        let worker = crate::worker::ProcessWorker::new("sh").with_args(["-c", "cat"]);
        let factory = Arc::new(WorkerSandboxFactory::process(worker));
        let pool = SandboxPool::new(factory, 2, "gpt-5-nano");

        let prompts: Vec<crate::types::PromptPayload> =
            (0..5).map(|i| format!("chunk {i}").into()).collect();
        let replies = pool.parallel_query(prompts).await.unwrap();

        assert_eq!(replies.len(), 5);
        for (i, reply) in replies.iter().enumerate() {
            let echoed: serde_json::Value = serde_json::from_str(reply).unwrap();
            assert_eq!(echoed["prompt"], format!("chunk {i}"));
            assert_eq!(echoed["model"], "gpt-5-nano");
        }
        assert_eq!(pool.live_count().await, 2);
        assert_eq!(pool.recreations(), 0);
        pool.close().await;
    }
}
