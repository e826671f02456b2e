//! Fixed-size pool of persistent sandboxes.
//!
//! The pool is built lazily on first use under an init lock (double-checked,
//! so concurrent first callers build it once) and every sandbox is
//! constructed concurrently. Each slot has its own async mutex: at most one
//! call is in flight per sandbox, and a failed sandbox is replaced while the
//! slot is still held.
//!
//! A single call walks [`CallPhase`]:
//!
//! ```text
//! Attempt ──fail──▶ Recreate ──ok──▶ Retry ──fail──▶ Placeholder
//!    │                 │               │
//!   ok               fail             ok
//!    ▼                 ▼               ▼
//!  reply          Placeholder        reply
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};

use crate::config::RlmConfig;
use crate::error::{RecurseError, RecurseResult};
use crate::runlog::RunLogger;
use crate::types::PromptPayload;
use crate::worker::WorkerRequest;

use super::{Sandbox, SandboxFactory};

/// Prefix of the text returned in place of a prompt whose retry also failed.
pub const PLACEHOLDER_PREFIX: &str = "Error in sandbox pool (retry failed)";

const SOURCE: &str = "pool";

/// Step of one dispatched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    Attempt,
    Recreate { cause: String },
    Retry,
    Placeholder { cause: String },
}

struct Slot {
    index: usize,
    sandbox: Mutex<Option<Arc<dyn Sandbox>>>,
}

type Slots = Arc<Vec<Arc<Slot>>>;

struct PoolInner {
    factory: Arc<dyn SandboxFactory>,
    size: usize,
    model: String,
    create_timeout: Duration,
    call_timeout: Duration,
    logger: Arc<RunLogger>,
    init_lock: Mutex<()>,
    slots: RwLock<Option<Slots>>,
    cursor: AtomicUsize,
    recreations: AtomicUsize,
}

/// Explicit handle to a sandbox pool. Clones share the same sandboxes.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

/// Configures a [`SandboxPool`] before any sandbox exists.
pub struct SandboxPoolBuilder {
    factory: Arc<dyn SandboxFactory>,
    size: usize,
    model: String,
    create_timeout: Duration,
    call_timeout: Duration,
    logger: Arc<RunLogger>,
}

impl SandboxPoolBuilder {
    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn logger(mut self, logger: Arc<RunLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> SandboxPool {
        SandboxPool {
            inner: Arc::new(PoolInner {
                factory: self.factory,
                size: self.size.max(1),
                model: self.model,
                create_timeout: self.create_timeout,
                call_timeout: self.call_timeout,
                logger: self.logger,
                init_lock: Mutex::new(()),
                slots: RwLock::new(None),
                cursor: AtomicUsize::new(0),
                recreations: AtomicUsize::new(0),
            }),
        }
    }
}

impl SandboxPool {
    pub fn builder(
        factory: Arc<dyn SandboxFactory>,
        size: usize,
        model: impl Into<String>,
    ) -> SandboxPoolBuilder {
        SandboxPoolBuilder {
            factory,
            size,
            model: model.into(),
            create_timeout: Duration::from_secs(1200),
            call_timeout: Duration::from_secs(300),
            logger: Arc::new(RunLogger::disabled()),
        }
    }

    pub fn new(factory: Arc<dyn SandboxFactory>, size: usize, model: impl Into<String>) -> Self {
        Self::builder(factory, size, model).build()
    }

    /// Size, subordinate model and timeouts taken from the run configuration.
    pub fn from_config(
        factory: Arc<dyn SandboxFactory>,
        config: &RlmConfig,
        logger: Arc<RunLogger>,
    ) -> Self {
        Self::builder(factory, config.pool_size, config.recursive_model.clone())
            .create_timeout(Duration::from_secs(config.sandbox_create_timeout_secs))
            .call_timeout(Duration::from_secs(config.call_timeout_secs))
            .logger(logger)
            .build()
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.slots.read().await.is_some()
    }

    /// Sandboxes replaced after a failed call since the pool was created.
    pub fn recreations(&self) -> usize {
        self.inner.recreations.load(Ordering::SeqCst)
    }

    /// Number of slots currently holding a sandbox.
    pub async fn live_count(&self) -> usize {
        let slots = match self.inner.slots.read().await.clone() {
            Some(slots) => slots,
            None => return 0,
        };
        let mut live = 0;
        for slot in slots.iter() {
            if slot.sandbox.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    /// Build the pool now instead of on the first call.
    pub async fn warm_up(&self) -> RecurseResult<()> {
        self.inner.ensure_pool().await.map(|_| ())
    }

    /// One call on the next slot in rotation. Errors if the retry also fails.
    pub async fn query(&self, prompt: impl Into<PromptPayload>) -> RecurseResult<String> {
        let slots = self.inner.ensure_pool().await?;
        let index = self.inner.cursor.fetch_add(1, Ordering::SeqCst) % self.inner.size;
        let request = WorkerRequest::new(prompt, self.inner.model.clone());
        self.inner
            .dispatch(&slots[index], &request, 0)
            .await
            .map_err(|cause| RecurseError::SandboxCall {
                sandbox: Some(index),
                message: cause,
            })
    }

    /// Prompt `i` runs on slot `i % N`; results come back in input order.
    /// A prompt whose retry fails yields a placeholder string in its position.
    pub async fn parallel_query(&self, prompts: Vec<PromptPayload>) -> RecurseResult<Vec<String>> {
        let slots = self.inner.ensure_pool().await?;
        let count = prompts.len();
        let logger = &self.inner.logger;
        logger.info(
            SOURCE,
            format!("Dispatching {count} prompts across {} sandboxes", self.inner.size),
        );
        let started = Instant::now();

        let handles: Vec<_> = prompts
            .into_iter()
            .enumerate()
            .map(|(i, prompt)| {
                let inner = self.inner.clone();
                let slot = slots[i % inner.size].clone();
                let request = WorkerRequest::new(prompt, inner.model.clone());
                tokio::spawn(async move { inner.dispatch(&slot, &request, i).await })
            })
            .collect();

        let results: Vec<String> = join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(Ok(text)) => text,
                Ok(Err(cause)) => placeholder(&cause),
                Err(e) => placeholder(&format!("task failed: {e}")),
            })
            .collect();

        logger.info(
            SOURCE,
            format!(
                "All {count} prompts completed in {:.1}s",
                started.elapsed().as_secs_f64()
            ),
        );
        Ok(results)
    }

    /// Terminate every sandbox (best-effort) and reset, so the next call rebuilds.
    pub async fn close(&self) {
        let _init = self.inner.init_lock.lock().await;
        let slots = self.inner.slots.write().await.take();
        let Some(slots) = slots else {
            return;
        };
        for slot in slots.iter() {
            let taken = slot.sandbox.lock().await.take();
            if let Some(sandbox) = taken {
                match sandbox.close().await {
                    Ok(()) => self
                        .inner
                        .logger
                        .info(&slot_source(slot.index), "sandbox terminated"),
                    Err(e) => tracing::debug!(sandbox = slot.index, error = %e, "close failed"),
                }
            }
        }
    }
}

impl PoolInner {
    async fn ensure_pool(&self) -> RecurseResult<Slots> {
        if let Some(slots) = self.slots.read().await.clone() {
            return Ok(slots);
        }

        let _init = self.init_lock.lock().await;
        if let Some(slots) = self.slots.read().await.clone() {
            return Ok(slots);
        }

        self.logger
            .info(SOURCE, format!("Creating {} sandboxes in parallel...", self.size));
        let started = Instant::now();

        let built = join_all((0..self.size).map(|i| self.create_with_retry(i))).await;
        let ready = built.iter().filter(|s| s.is_some()).count();
        if ready == 0 {
            return Err(RecurseError::PoolUnavailable(format!(
                "none of {} sandboxes could be constructed",
                self.size
            )));
        }

        let slots: Slots = Arc::new(
            built
                .into_iter()
                .enumerate()
                .map(|(index, sandbox)| {
                    Arc::new(Slot {
                        index,
                        sandbox: Mutex::new(sandbox),
                    })
                })
                .collect(),
        );
        self.logger.info(
            SOURCE,
            format!(
                "{ready} sandboxes ready in {:.1}s",
                started.elapsed().as_secs_f64()
            ),
        );
        *self.slots.write().await = Some(slots.clone());
        Ok(slots)
    }

    /// Initial construction gets one retry; a slot that still fails stays
    /// empty and is rebuilt on its first call.
    async fn create_with_retry(&self, index: usize) -> Option<Arc<dyn Sandbox>> {
        let source = slot_source(index);
        for attempt in 0..2 {
            match self.create_one(index).await {
                Ok(sandbox) => {
                    self.logger
                        .info(&source, format!("ready: {}", sandbox.id()));
                    return Some(sandbox);
                }
                Err(e) => self
                    .logger
                    .warn(&source, format!("construction attempt {} failed: {e}", attempt + 1)),
            }
        }
        None
    }

    async fn create_one(&self, index: usize) -> RecurseResult<Arc<dyn Sandbox>> {
        tokio::time::timeout(self.create_timeout, self.factory.create(index))
            .await
            .map_err(|_| RecurseError::Timeout {
                operation: format!("sandbox {index} construction"),
                secs: self.create_timeout.as_secs(),
            })?
    }

    async fn call(&self, sandbox: &Arc<dyn Sandbox>, request: &WorkerRequest) -> RecurseResult<String> {
        tokio::time::timeout(self.call_timeout, sandbox.completion(request))
            .await
            .map_err(|_| RecurseError::Timeout {
                operation: format!("call on {}", sandbox.id()),
                secs: self.call_timeout.as_secs(),
            })?
    }

    /// Run one request on `slot`, holding the slot for the whole exchange.
    /// `Err` carries the cause when the call ends in [`CallPhase::Placeholder`].
    async fn dispatch(&self, slot: &Slot, request: &WorkerRequest, prompt_idx: usize) -> Result<String, String> {
        let source = slot_source(slot.index);
        let mut held = slot.sandbox.lock().await;
        let mut phase = CallPhase::Attempt;

        loop {
            phase = match phase {
                CallPhase::Attempt => match held.clone() {
                    Some(sandbox) => match self.call(&sandbox, request).await {
                        Ok(text) => return Ok(text),
                        Err(e) => {
                            self.logger.warn(
                                &source,
                                format!("error on prompt {prompt_idx}: {e}, recreating..."),
                            );
                            CallPhase::Recreate { cause: e.to_string() }
                        }
                    },
                    None => CallPhase::Recreate {
                        cause: "slot has no sandbox".into(),
                    },
                },
                CallPhase::Recreate { cause } => {
                    if let Some(old) = held.take() {
                        if let Err(e) = old.close().await {
                            tracing::debug!(sandbox = slot.index, error = %e, "close of failed sandbox failed");
                        }
                    }
                    match self.create_one(slot.index).await {
                        Ok(fresh) => {
                            self.recreations.fetch_add(1, Ordering::SeqCst);
                            self.logger
                                .info(&source, format!("recreated as {} after: {cause}", fresh.id()));
                            *held = Some(fresh);
                            CallPhase::Retry
                        }
                        Err(e) => CallPhase::Placeholder { cause: e.to_string() },
                    }
                }
                CallPhase::Retry => match held.clone() {
                    Some(sandbox) => match self.call(&sandbox, request).await {
                        Ok(text) => return Ok(text),
                        Err(e) => CallPhase::Placeholder { cause: e.to_string() },
                    },
                    None => CallPhase::Placeholder {
                        cause: "slot has no sandbox".into(),
                    },
                },
                CallPhase::Placeholder { cause } => {
                    self.logger
                        .error(&source, format!("prompt {prompt_idx} failed after retry: {cause}"));
                    return Err(cause);
                }
            };
        }
    }
}

fn slot_source(index: usize) -> String {
    format!("pool:sandbox[{index}]")
}

fn placeholder(cause: &str) -> String {
    format!("{PLACEHOLDER_PREFIX}: {cause}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::MemorySink;
    use crate::sandbox::MockSandboxFactory;

    fn prompts(n: usize) -> Vec<PromptPayload> {
        (0..n).map(|i| PromptPayload::Text(format!("p{i}"))).collect()
    }

    #[tokio::test]
    async fn lazy_construction() {
        let factory = Arc::new(MockSandboxFactory::echo());
        let pool = SandboxPool::new(factory.clone(), 3, "m");
        assert!(!pool.is_ready().await);
        assert_eq!(factory.total_creations(), 0);
        pool.warm_up().await.unwrap();
        assert!(pool.is_ready().await);
        assert_eq!(factory.total_creations(), 3);
        assert_eq!(pool.live_count().await, 3);
    }

    #[tokio::test]
    async fn concurrent_first_calls_build_once() {
        let factory = Arc::new(MockSandboxFactory::echo());
        let pool = SandboxPool::new(factory.clone(), 4, "m");
        let calls = (0..8).map(|i| {
            let pool = pool.clone();
            async move { pool.query(format!("q{i}")).await }
        });
        let results = join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(factory.total_creations(), 4);
    }

    #[tokio::test]
    async fn results_keep_input_order() {
        let factory = Arc::new(MockSandboxFactory::echo().with_delay(Duration::from_millis(5)));
        let pool = SandboxPool::new(factory.clone(), 4, "m");
        let results = pool.parallel_query(prompts(10)).await.unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("echo: p{i}")).collect();
        assert_eq!(results, expected);
        for (slot, prompt) in factory.calls() {
            let i: usize = prompt.trim_start_matches('p').parse().unwrap();
            assert_eq!(slot, i % 4);
        }
    }

    #[tokio::test]
    async fn one_call_per_sandbox_at_a_time() {
        let factory = Arc::new(MockSandboxFactory::echo().with_delay(Duration::from_millis(10)));
        let pool = SandboxPool::new(factory.clone(), 2, "m");
        pool.parallel_query(prompts(8)).await.unwrap();
        assert_eq!(factory.max_in_flight(0), 1);
        assert_eq!(factory.max_in_flight(1), 1);
    }

    #[tokio::test]
    async fn killed_sandbox_is_recreated_once() {
        let factory = Arc::new(MockSandboxFactory::echo());
        let pool = SandboxPool::new(factory.clone(), 4, "m");
        pool.warm_up().await.unwrap();
        factory.kill(2);
        let results = pool.parallel_query(prompts(4)).await.unwrap();
        assert_eq!(results[2], "echo: p2");
        assert_eq!(pool.recreations(), 1);
        assert_eq!(factory.creations_for(2), 2);
        assert_eq!(factory.closed_count(), 1);
    }

    #[tokio::test]
    async fn failed_retry_yields_placeholder() {
        let factory = Arc::new(MockSandboxFactory::echo());
        factory.fail_always(1);
        let pool = SandboxPool::new(factory.clone(), 4, "m");
        let results = pool.parallel_query(prompts(4)).await.unwrap();
        assert!(results[1].starts_with(PLACEHOLDER_PREFIX));
        assert_eq!(results[0], "echo: p0");
        assert_eq!(results[3], "echo: p3");
    }

    #[tokio::test]
    async fn single_query_errors_after_failed_retry() {
        let factory = Arc::new(MockSandboxFactory::echo());
        factory.fail_always(0);
        let pool = SandboxPool::new(factory, 1, "m");
        let err = pool.query("x").await.unwrap_err();
        assert!(matches!(err, RecurseError::SandboxCall { sandbox: Some(0), .. }));
    }

    #[tokio::test]
    async fn construction_retried_once() {
        let factory = Arc::new(MockSandboxFactory::echo());
        factory.fail_creation(1, 1);
        let pool = SandboxPool::new(factory.clone(), 2, "m");
        pool.warm_up().await.unwrap();
        assert_eq!(pool.live_count().await, 2);
    }

    #[tokio::test]
    async fn empty_slot_is_rebuilt_on_first_call() {
        let factory = Arc::new(MockSandboxFactory::echo());
        factory.fail_creation(1, 2);
        let pool = SandboxPool::new(factory.clone(), 2, "m");
        pool.warm_up().await.unwrap();
        assert_eq!(pool.live_count().await, 1);
        let results = pool.parallel_query(prompts(2)).await.unwrap();
        assert_eq!(results[1], "echo: p1");
        assert_eq!(pool.live_count().await, 2);
    }

    #[tokio::test]
    async fn all_constructions_failing_is_unavailable() {
        let factory = Arc::new(MockSandboxFactory::echo());
        factory.fail_creation(0, 2);
        let pool = SandboxPool::new(factory, 1, "m");
        let err = pool.parallel_query(prompts(1)).await.unwrap_err();
        assert!(matches!(err, RecurseError::PoolUnavailable(_)));
        assert!(!pool.is_ready().await);
    }

    #[tokio::test]
    async fn close_resets_and_rebuilds() {
        let factory = Arc::new(MockSandboxFactory::echo());
        let pool = SandboxPool::new(factory.clone(), 2, "m");
        pool.warm_up().await.unwrap();
        pool.close().await;
        assert!(!pool.is_ready().await);
        assert_eq!(factory.closed_count(), 2);
        pool.query("again").await.unwrap();
        assert_eq!(factory.total_creations(), 4);
    }

    #[tokio::test]
    async fn slow_call_times_out_and_retries() {
        let factory = Arc::new(MockSandboxFactory::echo().with_delay(Duration::from_millis(200)));
        let pool = SandboxPool::builder(factory.clone(), 1, "m")
            .call_timeout(Duration::from_millis(20))
            .build();
        let results = pool.parallel_query(prompts(1)).await.unwrap();
        assert!(results[0].contains("Timed out"));
        assert_eq!(pool.recreations(), 1);
    }

    #[tokio::test]
    async fn logs_readiness_and_dispatch() {
        let sink = Arc::new(MemorySink::new());
        let logger = Arc::new(RunLogger::new().with_sink(sink.clone()));
        let pool = SandboxPool::builder(Arc::new(MockSandboxFactory::echo()), 2, "m")
            .logger(logger)
            .build();
        pool.parallel_query(prompts(3)).await.unwrap();
        let messages = sink.messages_from("pool");
        assert!(messages.iter().any(|m| m.starts_with("2 sandboxes ready in")));
        assert!(messages.iter().any(|m| m == "Dispatching 3 prompts across 2 sandboxes"));
        assert!(!sink.messages_from("pool:sandbox[0]").is_empty());
    }
}
