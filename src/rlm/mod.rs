//! # Recursive Language Model (RLM)
//!
//! A root model answers a query about a context it never sees in full. The
//! context is bound as `context` inside a persistent REPL namespace; the root
//! model writes snippets in ` ```repl` ``` blocks to measure, slice, chunk and
//! search it, and hands pieces to a subordinate model with `LLM_QUERY`,
//! `MAP`, `FILTER` or (in pooled mode) `PARALLEL_QUERY`. It finishes with
//! `FINAL(answer)` or `FINAL_VAR(variable)`.
//!
//! ## Snippet Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `LET v = LEN src` | Lines of text, items of a list |
//! | `LET v = SLICE src start stop` | Lines `[start, stop)`, negatives from the end |
//! | `LET v = CHUNK src BY_LINES n` | Split into chunks of `n` lines |
//! | `LET v = CHUNK src BY_CHARS n` | Split into ~`n` char chunks on line boundaries |
//! | `LET v = CHUNK src BY_REGEX "re"` | Split on a regex |
//! | `LET v = FIND src "re"` | Matching lines, prefixed by line number |
//! | `LET v = LLM_QUERY "prompt" [WITH var]` | One subordinate call |
//! | `LET v = PARALLEL_QUERY "prompt" WITH list` | One concurrent call per item (pooled mode) |
//! | `LET v = MAP list "template {item}"` | One sequential call per item |
//! | `LET v = FILTER list "condition"` | Keep items the subordinate model says YES to |
//! | `LET v = JOIN list "sep"` | Join a list |
//! | `LET v = GET src` / `CONCAT a b` / `INDEX list n` | Copy, concatenate, pick |
//! | `LET v = "text"` | Literal |
//! | `PRINT v` / `SHOW_VARS` | Inspect |
//!
//! ## Components
//!
//! - [`DslParser`] — parses snippets and extracts ` ```repl` ``` blocks
//! - [`Namespace`] — variables plus the bound context handle
//! - [`Interpreter`] / [`ReplExecutor`] — runs snippets, captures output and errors
//! - [`QueryChannel`] — routes subordinate calls in-process or to a sandbox pool
//! - [`RlmEngine`] — the iteration loop

mod channel;
mod directive;
mod dsl;
mod engine;
mod environment;
mod executor;
pub mod prompts;

pub use channel::QueryChannel;
pub use directive::{parse_directive, Directive};
pub use dsl::{DslCommand, DslError, DslParser, CONTEXT_PATH_VAR, CONTEXT_VAR};
pub use engine::{RlmEngine, RlmEngineBuilder, RlmIteration, RlmResult, TurnAction};
pub use environment::{Namespace, Step, Value};
pub use executor::{DslInterpreter, ExecutionResult, Interpreter, ReplExecutor};
