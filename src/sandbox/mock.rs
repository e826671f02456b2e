//! Scriptable sandboxes with failure injection, for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RecurseError, RecurseResult};
use crate::types::PromptPayload;
use crate::worker::WorkerRequest;

use super::{Sandbox, SandboxFactory};

type Responder = dyn Fn(&WorkerRequest) -> String + Send + Sync;

#[derive(Default)]
struct MockState {
    creations: Mutex<Vec<usize>>,
    creation_failures: Mutex<HashMap<usize, usize>>,
    always_failing: Mutex<Vec<usize>>,
    live: Mutex<HashMap<usize, Arc<MockSandbox>>>,
    in_flight: Mutex<HashMap<usize, (usize, usize)>>,
    calls: Mutex<Vec<(usize, String)>>,
    closed: AtomicUsize,
}

/// Sandbox produced by [`MockSandboxFactory`].
pub struct MockSandbox {
    id: String,
    index: usize,
    dead: AtomicBool,
    state: Arc<MockState>,
    responder: Arc<Responder>,
    delay: Duration,
}

impl MockSandbox {
    pub fn index(&self) -> usize {
        self.index
    }

    fn enter(&self) {
        let mut in_flight = self.state.in_flight.lock().unwrap();
        let entry = in_flight.entry(self.index).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
    }

    fn leave(&self) {
        let mut in_flight = self.state.in_flight.lock().unwrap();
        if let Some(entry) = in_flight.get_mut(&self.index) {
            entry.0 = entry.0.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn completion(&self, request: &WorkerRequest) -> RecurseResult<String> {
        self.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.leave();

        let prompt = match &request.prompt {
            PromptPayload::Text(text) => text.clone(),
            other => format!("{other:?}"),
        };
        self.state.calls.lock().unwrap().push((self.index, prompt));

        let failing = self.state.always_failing.lock().unwrap().contains(&self.index);
        if failing || self.dead.load(Ordering::SeqCst) {
            return Err(RecurseError::SandboxCall {
                sandbox: Some(self.index),
                message: format!("{} is not responding", self.id),
            });
        }
        Ok((self.responder)(request))
    }

    async fn close(&self) -> RecurseResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        self.dead.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory whose sandboxes answer through a responder closure.
///
/// Failures are injected per slot index: [`kill`](Self::kill) breaks the live
/// sandbox in a slot (its replacement works), [`fail_always`](Self::fail_always)
/// breaks every sandbox ever built for a slot, and
/// [`fail_creation`](Self::fail_creation) makes the next `n` constructions fail.
pub struct MockSandboxFactory {
    state: Arc<MockState>,
    responder: Arc<Responder>,
    delay: Duration,
}

impl MockSandboxFactory {
    pub fn new(responder: impl Fn(&WorkerRequest) -> String + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(MockState::default()),
            responder: Arc::new(responder),
            delay: Duration::ZERO,
        }
    }

    /// Replies `"echo: <prompt>"`.
    pub fn echo() -> Self {
        Self::new(|req| match &req.prompt {
            PromptPayload::Text(text) => format!("echo: {text}"),
            other => format!("echo: {other:?}"),
        })
    }

    /// Simulated latency of every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn kill(&self, index: usize) {
        if let Some(sandbox) = self.state.live.lock().unwrap().get(&index) {
            sandbox.dead.store(true, Ordering::SeqCst);
        }
    }

    pub fn fail_always(&self, index: usize) {
        self.state.always_failing.lock().unwrap().push(index);
    }

    pub fn fail_creation(&self, index: usize, times: usize) {
        self.state.creation_failures.lock().unwrap().insert(index, times);
    }

    /// Successful constructions for a slot.
    pub fn creations_for(&self, index: usize) -> usize {
        self.state
            .creations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| **i == index)
            .count()
    }

    pub fn total_creations(&self) -> usize {
        self.state.creations.lock().unwrap().len()
    }

    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// `(slot, prompt)` of every call, in arrival order.
    pub fn calls(&self) -> Vec<(usize, String)> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Highest number of simultaneous calls ever observed on one slot.
    pub fn max_in_flight(&self, index: usize) -> usize {
        self.state
            .in_flight
            .lock()
            .unwrap()
            .get(&index)
            .map(|(_, max)| *max)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SandboxFactory for MockSandboxFactory {
    async fn create(&self, index: usize) -> RecurseResult<Arc<dyn Sandbox>> {
        {
            let mut failures = self.state.creation_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RecurseError::SandboxCreation {
                        sandbox: index,
                        message: "image pull failed".into(),
                    });
                }
            }
        }

        let generation = {
            let mut creations = self.state.creations.lock().unwrap();
            creations.push(index);
            creations.iter().filter(|i| **i == index).count()
        };
        let sandbox = Arc::new(MockSandbox {
            id: format!("mock-{index}-gen{generation}"),
            index,
            dead: AtomicBool::new(false),
            state: self.state.clone(),
            responder: self.responder.clone(),
            delay: self.delay,
        });
        self.state
            .live
            .lock()
            .unwrap()
            .insert(index, sandbox.clone());
        Ok(sandbox)
    }
}
