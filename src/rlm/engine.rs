//! RLM Engine — the root-model iteration loop.
//!
//! ```text
//!   Init ──► AwaitingAction ──► Executing ──┐
//!                 ▲   │                     │
//!                 │   └──► Finalizing ──► Done
//!                 └─────────────┴───────────┘
//! ```
//!
//! The context is bound into a persistent namespace, the root model is shown
//! its metadata, and each reply is either executed (first ```repl``` block),
//! accepted as a final directive, or answered with a corrective prompt.
//! The loop makes at most `max_iterations + 1` root calls: once
//! `max_iterations` calls are spent the next turn is final-answer-only.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{RlmConfig, SubRlmMode};
use crate::context::ContextSource;
use crate::error::{RecurseError, RecurseResult};
use crate::provider::Provider;
use crate::runlog::{LogEntry, LogLevel, RunLogger};
use crate::sandbox::{SandboxFactory, SandboxPool, WorkerSandboxFactory};
use crate::types::*;

use super::channel::QueryChannel;
use super::directive::{parse_directive, Directive};
use super::dsl::DslParser;
use super::environment::Namespace;
use super::executor::{DslInterpreter, Interpreter, ReplExecutor};
use super::prompts;

const SOURCE: &str = "orchestrator";

/// What the root model did on one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    /// A snippet was executed.
    Executed,
    /// Neither code nor a directive.
    NoOp,
    /// A final directive was given.
    Directive,
}

/// Record of a single root-model turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmIteration {
    /// Number of snippets executed before this turn.
    pub iteration: usize,
    pub response: String,
    pub action: TurnAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of an RLM completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmResult {
    pub task_id: String,
    pub answer: String,
    pub iterations: Vec<RlmIteration>,
    pub root_calls: usize,
    pub sub_calls: usize,
    /// The answer is raw model text rather than a resolved directive.
    pub degraded: bool,
    pub total_tokens: TokenUsage,
}

enum LoopState {
    AwaitingAction,
    Executing { reply: String, snippet: String },
    Finalizing { reply: String, directive: Directive },
    Done { answer: String, degraded: bool },
}

/// Mutable state of one task.
struct Run {
    task_id: String,
    query: String,
    messages: Vec<Message>,
    executor: ReplExecutor,
    iterations: Vec<RlmIteration>,
    root_calls: usize,
    executed: usize,
    noop_streak: usize,
    final_only: bool,
    corrected: bool,
    usage: TokenUsage,
}

impl Run {
    fn record(&mut self, response: String, action: TurnAction) {
        self.iterations.push(RlmIteration {
            iteration: self.executed,
            response,
            action,
            snippet: None,
            stdout: String::new(),
            error: None,
        });
    }
}

/// Configures an [`RlmEngine`].
pub struct RlmEngineBuilder {
    provider: Arc<dyn Provider>,
    config: RlmConfig,
    logger: Option<Arc<RunLogger>>,
    factory: Option<Arc<dyn SandboxFactory>>,
    pool: Option<SandboxPool>,
    interpreter: Option<Arc<dyn Interpreter>>,
}

impl RlmEngineBuilder {
    pub fn logger(mut self, logger: Arc<RunLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Sandbox factory used in pooled-remote mode. Defaults to in-process sandboxes.
    pub fn sandbox_factory(mut self, factory: Arc<dyn SandboxFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use an existing pool; implies pooled-remote mode.
    pub fn pool(mut self, pool: SandboxPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Replace the built-in snippet interpreter.
    pub fn interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn build(self) -> RecurseResult<RlmEngine> {
        let mut config = self.config;
        config.validate()?;
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(RunLogger::from_config(&config)));

        let channel = match (self.pool, config.sub_rlm_mode) {
            (Some(pool), _) => {
                config.sub_rlm_mode = SubRlmMode::PooledRemote;
                QueryChannel::pooled(pool)
            }
            (None, SubRlmMode::Local) => {
                QueryChannel::in_process(self.provider.clone(), config.recursive_model.clone())
            }
            (None, SubRlmMode::PooledRemote) => {
                let factory: Arc<dyn SandboxFactory> = match self.factory {
                    Some(factory) => factory,
                    None => Arc::new(WorkerSandboxFactory::in_process(self.provider.clone())),
                };
                QueryChannel::pooled(SandboxPool::from_config(factory, &config, logger.clone()))
            }
        };
        let channel = Arc::new(channel);
        let interpreter: Arc<dyn Interpreter> = match self.interpreter {
            Some(interpreter) => interpreter,
            None => Arc::new(DslInterpreter::new(channel.clone())),
        };

        Ok(RlmEngine {
            provider: self.provider,
            config,
            channel,
            interpreter,
            logger,
        })
    }
}

/// The RLM engine — drives the root model over one context per task.
pub struct RlmEngine {
    provider: Arc<dyn Provider>,
    config: RlmConfig,
    channel: Arc<QueryChannel>,
    interpreter: Arc<dyn Interpreter>,
    logger: Arc<RunLogger>,
}

impl RlmEngine {
    pub fn builder(provider: Arc<dyn Provider>, config: RlmConfig) -> RlmEngineBuilder {
        RlmEngineBuilder {
            provider,
            config,
            logger: None,
            factory: None,
            pool: None,
            interpreter: None,
        }
    }

    /// Engine with default wiring for `config.sub_rlm_mode`.
    pub fn new(provider: Arc<dyn Provider>, config: RlmConfig) -> RecurseResult<Self> {
        Self::builder(provider, config).build()
    }

    pub fn config(&self) -> &RlmConfig {
        &self.config
    }

    pub fn mode(&self) -> SubRlmMode {
        self.channel.mode()
    }

    /// The sandbox pool, in pooled-remote mode.
    pub fn pool(&self) -> Option<&SandboxPool> {
        self.channel.pool()
    }

    /// Release pooled sandboxes. Local mode has nothing to release.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.channel.pool() {
            pool.close().await;
        }
    }

    /// Answer `query` over `context`.
    pub async fn completion(&self, context: ContextSource, query: &str) -> RecurseResult<RlmResult> {
        if query.trim().is_empty() {
            return Err(RecurseError::Config("query cannot be empty".into()));
        }
        if context.mode() != self.config.context_mode {
            return Err(RecurseError::Config(format!(
                "context source is {:?} but context_mode is {:?}",
                context.mode(),
                self.config.context_mode
            )));
        }
        let started = Instant::now();
        let task_id = Uuid::new_v4().to_string();
        let sub_calls_before = self.channel.calls();

        // Init
        let handle = context.open().await?;
        let metadata = handle.metadata().await?;
        self.log(
            LogLevel::Info,
            &task_id,
            format!(
                "task started; mode={}, context={:?}, max_iterations={}",
                self.mode(),
                handle.mode(),
                self.config.max_iterations
            ),
        );

        let parallel = self.channel.supports_parallel();
        if self.config.force_parallel && !parallel {
            self.log(
                LogLevel::Warn,
                &task_id,
                "force_parallel ignored: local mode has no parallel_llm_query",
            );
        }
        let executor = ReplExecutor::new(self.interpreter.clone(), Namespace::new(handle))
            .with_logger(self.logger.clone());

        let mut run = Run {
            task_id,
            query: query.to_string(),
            messages: vec![
                Message::system(prompts::system_prompt(parallel, self.config.force_parallel)),
                Message::user(prompts::first_turn(query, &metadata)),
            ],
            executor,
            iterations: Vec::new(),
            root_calls: 0,
            executed: 0,
            noop_streak: 0,
            final_only: false,
            corrected: false,
            usage: TokenUsage::default(),
        };

        let ceiling = self.config.max_iterations + 1;
        let mut state = LoopState::AwaitingAction;
        loop {
            state = match state {
                LoopState::AwaitingAction => {
                    if !run.final_only && run.root_calls >= self.config.max_iterations {
                        self.enter_final_only(&mut run, "iteration budget spent");
                    }
                    let reply = self.call_root(&mut run).await?;
                    match parse_directive(&reply) {
                        Some(directive) => LoopState::Finalizing { reply, directive },
                        None if run.final_only => {
                            self.log(
                                LogLevel::Warn,
                                &run.task_id,
                                "final turn gave no directive; returning raw reply",
                            );
                            let answer = reply.trim().to_string();
                            run.record(reply, TurnAction::NoOp);
                            LoopState::Done {
                                answer,
                                degraded: true,
                            }
                        }
                        None => match DslParser::extract_first_block(&reply) {
                            Some(snippet) => LoopState::Executing { reply, snippet },
                            None => {
                                run.record(reply, TurnAction::NoOp);
                                run.noop_streak += 1;
                                self.log(
                                    LogLevel::Debug,
                                    &run.task_id,
                                    format!("no action ({} in a row)", run.noop_streak),
                                );
                                if run.noop_streak > self.config.max_noop_turns {
                                    self.enter_final_only(&mut run, "too many turns without action");
                                } else {
                                    let nudge = format!(
                                        "{}\n\n{}",
                                        prompts::no_action(),
                                        prompts::next_action(&run.query, run.executed)
                                    );
                                    run.messages.push(Message::user(nudge));
                                }
                                LoopState::AwaitingAction
                            }
                        },
                    }
                }
                LoopState::Executing { reply, snippet } => {
                    self.log(
                        LogLevel::Info,
                        &run.task_id,
                        format!("iteration {}: executing snippet ({} chars)", run.executed, snippet.len()),
                    );
                    let result = run.executor.run(&snippet).await;
                    let feedback = prompts::execution_feedback(&result, self.config.max_output_chars);
                    run.iterations.push(RlmIteration {
                        iteration: run.executed,
                        response: reply,
                        action: TurnAction::Executed,
                        snippet: Some(snippet),
                        stdout: result.stdout,
                        error: result.error,
                    });
                    run.executed += 1;
                    run.noop_streak = 0;
                    let next = format!("{feedback}\n\n{}", prompts::next_action(&run.query, run.executed));
                    run.messages.push(Message::user(next));
                    LoopState::AwaitingAction
                }
                LoopState::Finalizing { reply, directive } => {
                    run.record(reply, TurnAction::Directive);
                    match directive {
                        Directive::Literal(answer) => LoopState::Done {
                            answer,
                            degraded: false,
                        },
                        Directive::Variable { name, raw } => match run.executor.resolve(&name).await {
                            Some(answer) => LoopState::Done {
                                answer,
                                degraded: false,
                            },
                            None if !run.corrected && run.root_calls < ceiling => {
                                run.corrected = true;
                                self.log(
                                    LogLevel::Warn,
                                    &run.task_id,
                                    format!("FINAL_VAR({name}) names a missing variable; asking once more"),
                                );
                                let names = run.executor.namespace().names();
                                run.messages.push(Message::user(prompts::missing_variable(&name, &names)));
                                LoopState::AwaitingAction
                            }
                            None => {
                                self.log(
                                    LogLevel::Warn,
                                    &run.task_id,
                                    RecurseError::MalformedDirective(raw.clone()).to_string(),
                                );
                                LoopState::Done {
                                    answer: raw,
                                    degraded: true,
                                }
                            }
                        },
                    }
                }
                LoopState::Done { answer, degraded } => {
                    self.log(
                        LogLevel::Info,
                        &run.task_id,
                        format!(
                            "{} answer after {} root calls ({} chars), took={:.1}s",
                            if degraded { "degraded" } else { "final" },
                            run.root_calls,
                            answer.len(),
                            started.elapsed().as_secs_f64()
                        ),
                    );
                    return Ok(RlmResult {
                        task_id: run.task_id,
                        answer,
                        iterations: run.iterations,
                        root_calls: run.root_calls,
                        sub_calls: self.channel.calls() - sub_calls_before,
                        degraded,
                        total_tokens: run.usage,
                    });
                }
            };
        }
    }

    fn enter_final_only(&self, run: &mut Run, reason: &str) {
        run.final_only = true;
        run.messages.push(Message::user(prompts::forced_final()));
        self.log(LogLevel::Info, &run.task_id, format!("{reason}; asking for final answer"));
    }

    async fn call_root(&self, run: &mut Run) -> RecurseResult<String> {
        let reply = self.provider.complete(&run.messages, &self.config.model).await?;
        run.root_calls += 1;
        if let Some(usage) = &reply.usage {
            run.usage.add(usage);
        }
        let text = reply.content.clone();
        run.messages.push(reply);
        Ok(text)
    }

    fn log(&self, level: LogLevel, task_id: &str, message: impl Into<String>) {
        self.logger
            .log(LogEntry::new(level, SOURCE, message).with_task(task_id));
    }
}
