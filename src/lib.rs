//! # deeprecurse
//!
//! Recursive language model runtime: a root model answers queries over
//! contexts far larger than its window by driving a persistent REPL, and
//! delegates reading to subordinate models that run in-process or across a
//! pool of persistent sandboxes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use deeprecurse::{ContextMode, ContextSource, OpenAIProvider, RlmConfig, RlmEngine};
//!
//! # async fn run() -> deeprecurse::RecurseResult<()> {
//! let provider = Arc::new(OpenAIProvider::from_env()?);
//! let config = RlmConfig::from_env()?.with_context_mode(ContextMode::File);
//! let engine = RlmEngine::new(provider, config)?;
//!
//! let result = engine
//!     .completion(ContextSource::file("logs/week.txt"), "Which service failed most often?")
//!     .await?;
//! println!("{} ({} root calls)", result.answer, result.root_calls);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`rlm`] | Iteration loop, snippet language, directives, prompts |
//! | [`sandbox`] | Persistent sandboxes and the fixed-size pool with recreate-and-retry |
//! | [`worker`] | Worker Protocol: one JSON request in, one reply out |
//! | [`context`] | Text, file and segmented contexts with line slicing |
//! | [`blob`] | Object storage behind segmented contexts |
//! | [`provider`] | Chat-completion backends (OpenAI-compatible, scripted) |
//! | [`session`] | Chat-log and agent interfaces for front ends |
//! | [`runlog`] | Structured run logging with pluggable sinks |
//! | [`config`] | Run configuration from defaults, env or JSON |
//! | [`error`] | Error types with thiserror |

pub mod blob;
pub mod config;
pub mod context;
pub mod error;
pub mod provider;
pub mod rlm;
pub mod runlog;
pub mod sandbox;
pub mod session;
pub mod types;
pub mod worker;

pub use config::{ContextMode, RlmConfig, SubRlmMode};
pub use context::{ContextHandle, ContextSource, SegmentedContext};
pub use error::{RecurseError, RecurseResult};
pub use provider::{OpenAIProvider, Provider, ScriptedProvider};
pub use rlm::{RlmEngine, RlmResult};
pub use sandbox::{SandboxFactory, SandboxPool};
pub use types::*;
