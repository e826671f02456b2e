//! Snippet execution against a persistent namespace.
//!
//! The [`Interpreter`] trait is the seam between the iteration loop and the
//! language snippets are written in. [`DslInterpreter`] runs the built-in
//! command language; [`ReplExecutor`] owns the namespace for one task and
//! keeps it alive across iterations.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::RecurseResult;
use crate::runlog::RunLogger;
use crate::sandbox::PLACEHOLDER_PREFIX;

use super::channel::QueryChannel;
use super::dsl::{DslCommand, DslParser};
use super::environment::{Namespace, Step, Value};

/// Outcome of one snippet. Errors are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub error: Option<String>,
    /// Variable names visible after the snippet ran.
    pub variables: Vec<String>,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs a snippet against a namespace, updating it in place.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn execute(&self, snippet: &str, namespace: &mut Namespace) -> ExecutionResult;
}

/// Interpreter for the built-in command language.
pub struct DslInterpreter {
    channel: Arc<QueryChannel>,
}

impl DslInterpreter {
    pub fn new(channel: Arc<QueryChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &QueryChannel {
        &self.channel
    }

    async fn run_command(
        &self,
        command: &DslCommand,
        ns: &mut Namespace,
    ) -> RecurseResult<Option<String>> {
        match ns.execute(command).await? {
            Step::Output(s) => Ok(Some(s)),
            Step::Silent => Ok(None),
            Step::Query { target, prompt } => {
                let answer = self.channel.llm_query(prompt).await?;
                let len = answer.len();
                ns.set(&target, Value::Text(answer))?;
                Ok(Some(format!("[LLM_QUERY -> {target}]: {len} chars")))
            }
            Step::ParallelQuery { target, prompts } => {
                let answers = self
                    .channel
                    .parallel_llm_query(prompts.into_iter().map(Into::into).collect())
                    .await?;
                let failed = answers
                    .iter()
                    .filter(|a| a.starts_with(PLACEHOLDER_PREFIX))
                    .count();
                let count = answers.len();
                ns.set(&target, Value::List(answers))?;
                let mut line = format!("[PARALLEL_QUERY -> {target}]: {count} results");
                if failed > 0 {
                    line.push_str(&format!(", {failed} failed"));
                }
                Ok(Some(line))
            }
            Step::Map { target, prompts } => {
                let answers = self.channel.each(prompts).await?;
                let count = answers.len();
                ns.set(&target, Value::List(answers))?;
                Ok(Some(format!("[MAP -> {target}]: {count} results")))
            }
            Step::Filter {
                target,
                items,
                condition,
            } => {
                let prompts = items
                    .iter()
                    .map(|item| {
                        format!(
                            "Does this item satisfy the condition \"{condition}\"? Answer YES or NO only.\n\nItem: {item}"
                        )
                    })
                    .collect();
                let verdicts = self.channel.each(prompts).await?;
                let kept: Vec<String> = items
                    .into_iter()
                    .zip(verdicts)
                    .filter(|(_, verdict)| verdict.trim().to_uppercase().starts_with("YES"))
                    .map(|(item, _)| item)
                    .collect();
                let count = kept.len();
                ns.set(&target, Value::List(kept))?;
                Ok(Some(format!("[FILTER -> {target}]: {count} items kept")))
            }
        }
    }
}

#[async_trait]
impl Interpreter for DslInterpreter {
    async fn execute(&self, snippet: &str, namespace: &mut Namespace) -> ExecutionResult {
        let commands = match DslParser::parse(snippet) {
            Ok(commands) => commands,
            Err(e) => {
                return ExecutionResult {
                    stdout: String::new(),
                    error: Some(format!("Parse error: {e}")),
                    variables: namespace.names(),
                }
            }
        };

        let mut lines = Vec::new();
        let mut error = None;
        for (i, command) in commands.iter().enumerate() {
            match self.run_command(command, namespace).await {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => {}
                Err(e) => {
                    // earlier commands keep their effects
                    error = Some(format!("command {}: {e}", i + 1));
                    break;
                }
            }
        }

        ExecutionResult {
            stdout: lines.join("\n"),
            error,
            variables: namespace.names(),
        }
    }
}

/// Persistent execution environment for one task.
pub struct ReplExecutor {
    interpreter: Arc<dyn Interpreter>,
    namespace: Namespace,
    logger: Arc<RunLogger>,
    runs: usize,
}

impl ReplExecutor {
    pub fn new(interpreter: Arc<dyn Interpreter>, namespace: Namespace) -> Self {
        Self {
            interpreter,
            namespace,
            logger: Arc::new(RunLogger::disabled()),
            runs: 0,
        }
    }

    pub fn with_logger(mut self, logger: Arc<RunLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Snippets executed so far.
    pub fn runs(&self) -> usize {
        self.runs
    }

    pub async fn run(&mut self, snippet: &str) -> ExecutionResult {
        let started = Instant::now();
        let result = self.interpreter.execute(snippet, &mut self.namespace).await;
        self.runs += 1;
        let took = started.elapsed().as_secs_f64();
        match &result.error {
            None => self.logger.debug(
                "executor",
                format!(
                    "snippet {} ok; stdout={} chars, took={took:.2}s",
                    self.runs,
                    result.stdout.len()
                ),
            ),
            Some(err) => self.logger.warn(
                "executor",
                format!("snippet {} failed after {took:.2}s: {err}", self.runs),
            ),
        }
        result
    }

    /// Text of a namespace variable, for `FINAL_VAR`.
    pub async fn resolve(&self, name: &str) -> Option<String> {
        self.namespace.resolve_text(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextHandle;
    use crate::provider::ScriptedProvider;
    use crate::runlog::MemorySink;
    use crate::sandbox::{MockSandboxFactory, SandboxPool};

    fn executor_with(channel: QueryChannel, context: &str) -> ReplExecutor {
        let interpreter = Arc::new(DslInterpreter::new(Arc::new(channel)));
        let ns = Namespace::new(ContextHandle::Text(Arc::new(context.to_string())));
        ReplExecutor::new(interpreter, ns)
    }

    fn local(replies: &[&str]) -> QueryChannel {
        let provider = ScriptedProvider::new(replies.iter().map(|s| s.to_string()));
        QueryChannel::in_process(Arc::new(provider), "gpt-5-nano")
    }

    #[tokio::test]
    async fn namespace_persists_across_runs() {
        let mut exec = executor_with(local(&[]), "a\nb\nc\n");
        let first = exec.run("LET n = LEN context").await;
        assert!(first.is_ok());
        assert_eq!(first.stdout, "context length = 3");

        let second = exec.run("PRINT n").await;
        assert_eq!(second.stdout, "3");
        assert_eq!(exec.runs(), 2);
        assert!(second.variables.contains(&"n".to_string()));
    }

    #[tokio::test]
    async fn llm_query_binds_answer() {
        let mut exec = executor_with(local(&["seven"]), "the number is 7\n");
        let result = exec
            .run("LET head = SLICE context 0 1\nLET a = LLM_QUERY \"number?\" WITH head")
            .await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(exec.resolve("a").await.as_deref(), Some("seven"));
    }

    #[tokio::test]
    async fn error_is_captured_and_earlier_effects_kept() {
        let mut exec = executor_with(local(&[]), "x\n");
        let result = exec.run("LET a = \"kept\"\nPRINT missing\nLET b = \"never\"").await;
        let err = result.error.unwrap();
        assert!(err.starts_with("command 2:"));
        assert!(exec.namespace().get("a").is_some());
        assert!(exec.namespace().get("b").is_none());
    }

    #[tokio::test]
    async fn parse_error_reported() {
        let mut exec = executor_with(local(&[]), "x\n");
        let result = exec.run("DROP TABLE context").await;
        assert!(result.error.unwrap().starts_with("Parse error"));
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn parallel_query_in_local_mode_is_an_error_not_a_crash() {
        let mut exec = executor_with(local(&[]), "a\nb\n");
        let result = exec
            .run("LET parts = CHUNK context BY_LINES 1\nLET r = PARALLEL_QUERY \"count\" WITH parts")
            .await;
        assert!(result.error.unwrap().contains("Not supported in this mode"));
        assert_eq!(exec.namespace().get("parts").unwrap().as_list().len(), 2);
    }

    #[tokio::test]
    async fn parallel_query_pooled_reports_failures() {
        let factory = Arc::new(MockSandboxFactory::echo());
        factory.fail_always(1);
        let pool = SandboxPool::new(factory.clone(), 2, "gpt-5-nano");
        let mut exec = executor_with(QueryChannel::pooled(pool), "a\nb\nc\nd\n");
        let result = exec
            .run("LET parts = CHUNK context BY_LINES 1\nLET r = PARALLEL_QUERY \"count\" WITH parts")
            .await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert!(result.stdout.contains("[PARALLEL_QUERY -> r]: 4 results, 2 failed"));
        let answers = exec.namespace().get("r").unwrap().as_list();
        assert!(answers[0].starts_with("echo: count"));
        assert!(answers[1].starts_with(PLACEHOLDER_PREFIX));
    }

    #[tokio::test]
    async fn map_and_filter_call_sub_model_per_item() {
        let channel = local(&["s1", "s2", "YES", "no"]);
        let mut exec = executor_with(channel, "alpha\nbeta\n");
        let result = exec
            .run(
                "LET parts = CHUNK context BY_LINES 1\n\
                 LET sums = MAP parts \"summarize: {item}\"\n\
                 LET keep = FILTER parts \"starts with a\"",
            )
            .await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(exec.namespace().get("sums").unwrap().as_list(), vec!["s1", "s2"]);
        assert_eq!(exec.namespace().get("keep").unwrap().as_list(), vec!["alpha\n"]);
    }

    #[tokio::test]
    async fn run_is_logged() {
        let sink = Arc::new(MemorySink::new());
        let logger = Arc::new(RunLogger::new().with_sink(sink.clone()));
        let mut exec = executor_with(local(&[]), "x\n").with_logger(logger);
        exec.run("SHOW_VARS").await;
        exec.run("PRINT nope").await;
        let messages = sink.messages_from("executor");
        assert!(messages[0].starts_with("snippet 1 ok"));
        assert!(messages[1].starts_with("snippet 2 failed"));
    }
}
