//! Snippet namespace: variables plus the bound context handle.

use std::collections::BTreeMap;

use regex::Regex;

use crate::context::{slice_lines, ContextHandle};
use crate::error::{RecurseError, RecurseResult};

use super::dsl::{DslCommand, CONTEXT_PATH_VAR, CONTEXT_VAR};

/// A value held in the namespace
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    List(Vec<String>),
    Number(usize),
}

impl Value {
    pub fn as_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::List(v) => v.join("\n"),
            Value::Number(n) => n.to_string(),
        }
    }

    pub fn as_list(&self) -> Vec<String> {
        match self {
            Value::Text(s) => vec![s.clone()],
            Value::List(v) => v.clone(),
            Value::Number(n) => vec![n.to_string()],
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Number(_) => "number",
        }
    }
}

/// What a single command asks of the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Output(String),
    Silent,
    Query {
        target: String,
        prompt: String,
    },
    ParallelQuery {
        target: String,
        prompts: Vec<String>,
    },
    Map {
        target: String,
        prompts: Vec<String>,
    },
    Filter {
        target: String,
        items: Vec<String>,
        condition: String,
    },
}

/// Variables visible to snippets, persisted across iterations of one task.
///
/// `context` always resolves to the task's [`ContextHandle`] and is never
/// stored as a plain value, so a segmented context is only read through
/// `SLICE` and `LEN` unless a snippet asks for all of it.
pub struct Namespace {
    context: ContextHandle,
    variables: BTreeMap<String, Value>,
}

impl Namespace {
    pub fn new(context: ContextHandle) -> Self {
        let mut variables = BTreeMap::new();
        if let Some(path) = context.path() {
            variables.insert(
                CONTEXT_PATH_VAR.to_string(),
                Value::Text(path.display().to_string()),
            );
        }
        Self { context, variables }
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Bind a value. `context` and `context_path` are reserved.
    pub fn set(&mut self, name: &str, value: Value) -> RecurseResult<()> {
        if name == CONTEXT_VAR || name == CONTEXT_PATH_VAR {
            return Err(RecurseError::Snippet(format!(
                "'{name}' is reserved and cannot be reassigned"
            )));
        }
        self.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        name == CONTEXT_VAR || self.variables.contains_key(name)
    }

    /// Names of user-visible variables, sorted, `context` first.
    pub fn names(&self) -> Vec<String> {
        std::iter::once(CONTEXT_VAR.to_string())
            .chain(self.variables.keys().cloned())
            .collect()
    }

    /// Text of a variable, for `FINAL_VAR`. `context` resolves to the full context.
    pub async fn resolve_text(&self, name: &str) -> Option<String> {
        if name == CONTEXT_VAR {
            return self.context.read_all().await.ok();
        }
        self.variables.get(name).map(Value::as_text)
    }

    /// `name: type` per variable, as `SHOW_VARS` prints it.
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("  {CONTEXT_VAR}: {}", context_type(&self.context))];
        lines.extend(
            self.variables
                .iter()
                .map(|(k, v)| format!("  {k}: {}", v.type_name())),
        );
        format!("Variables:\n{}", lines.join("\n"))
    }

    /// Run a command that needs no model call, or describe the call it needs.
    pub async fn execute(&mut self, command: &DslCommand) -> RecurseResult<Step> {
        match command {
            DslCommand::Len { target, source } => {
                let len = if source == CONTEXT_VAR {
                    self.context.line_count().await?
                } else {
                    match self.require_var(source)? {
                        Value::Text(s) => s.split_inclusive('\n').count(),
                        Value::List(v) => v.len(),
                        Value::Number(n) => *n,
                    }
                };
                self.set(target, Value::Number(len))?;
                Ok(Step::Output(format!("{source} length = {len}")))
            }
            DslCommand::Slice {
                target,
                source,
                start,
                stop,
            } => {
                let slice = if source == CONTEXT_VAR {
                    self.context.slice(*start, *stop).await?
                } else {
                    slice_lines(&self.require_text(source)?, *start, *stop)
                };
                let len = slice.len();
                self.set(target, Value::Text(slice))?;
                Ok(Step::Output(format!(
                    "Sliced lines [{start}:{stop}] of {source}, {len} chars"
                )))
            }
            DslCommand::ChunkByLines {
                target,
                source,
                lines_per_chunk,
            } => {
                let text = self.source_text(source).await?;
                let lines: Vec<&str> = text.split_inclusive('\n').collect();
                let chunks: Vec<String> = lines
                    .chunks(*lines_per_chunk)
                    .map(|chunk| chunk.concat())
                    .collect();
                let count = chunks.len();
                self.set(target, Value::List(chunks))?;
                Ok(Step::Output(format!(
                    "Chunked into {count} parts by {lines_per_chunk} lines each"
                )))
            }
            DslCommand::ChunkByChars {
                target,
                source,
                chars_per_chunk,
            } => {
                let text = self.source_text(source).await?;
                let chunks = chunk_by_chars(&text, *chars_per_chunk);
                let count = chunks.len();
                self.set(target, Value::List(chunks))?;
                Ok(Step::Output(format!(
                    "Chunked into {count} parts by ~{chars_per_chunk} chars"
                )))
            }
            DslCommand::ChunkByRegex {
                target,
                source,
                pattern,
            } => {
                let text = self.source_text(source).await?;
                let re = compile(pattern)?;
                let chunks: Vec<String> = re
                    .split(&text)
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.to_string())
                    .collect();
                let count = chunks.len();
                self.set(target, Value::List(chunks))?;
                Ok(Step::Output(format!(
                    "Split into {count} sections by regex \"{pattern}\""
                )))
            }
            DslCommand::Find {
                target,
                source,
                pattern,
            } => {
                let text = self.source_text(source).await?;
                let re = compile(pattern)?;
                let hits: Vec<String> = text
                    .lines()
                    .enumerate()
                    .filter(|(_, line)| re.is_match(line))
                    .map(|(i, line)| format!("{i}: {line}"))
                    .collect();
                let count = hits.len();
                self.set(target, Value::List(hits))?;
                Ok(Step::Output(format!(
                    "Found {count} matching lines for \"{pattern}\""
                )))
            }
            DslCommand::LlmQuery {
                target,
                prompt,
                with,
            } => {
                let prompt = match with {
                    Some(var) => {
                        let ctx = self.source_text(var).await?;
                        format!("{prompt}\n\nContext:\n{ctx}")
                    }
                    None => prompt.clone(),
                };
                Ok(Step::Query {
                    target: target.clone(),
                    prompt,
                })
            }
            DslCommand::ParallelQuery {
                target,
                prompt,
                source,
            } => {
                let items = self.require_list(source)?;
                let prompts = items
                    .iter()
                    .map(|item| format!("{prompt}\n\n{item}"))
                    .collect();
                Ok(Step::ParallelQuery {
                    target: target.clone(),
                    prompts,
                })
            }
            DslCommand::Map {
                target,
                source,
                prompt_template,
            } => {
                let items = self.require_list(source)?;
                let prompts = items
                    .iter()
                    .map(|item| {
                        if prompt_template.contains("{item}") {
                            prompt_template.replace("{item}", item)
                        } else {
                            format!("{prompt_template}\n\n{item}")
                        }
                    })
                    .collect();
                Ok(Step::Map {
                    target: target.clone(),
                    prompts,
                })
            }
            DslCommand::Filter {
                target,
                source,
                condition,
            } => {
                let items = self.require_list(source)?;
                Ok(Step::Filter {
                    target: target.clone(),
                    items,
                    condition: condition.clone(),
                })
            }
            DslCommand::Join {
                target,
                source,
                separator,
            } => {
                let joined = self.require_list(source)?.join(separator);
                let len = joined.len();
                self.set(target, Value::Text(joined))?;
                Ok(Step::Output(format!("Joined {source} into {len} chars")))
            }
            DslCommand::Get { target, source } => {
                let value = if source == CONTEXT_VAR {
                    Value::Text(self.context.read_all().await?)
                } else {
                    self.require_var(source)?.clone()
                };
                self.set(target, value)?;
                Ok(Step::Silent)
            }
            DslCommand::Concat {
                target,
                left,
                right,
            } => {
                let combined = format!(
                    "{}{}",
                    self.source_text(left).await?,
                    self.source_text(right).await?
                );
                let len = combined.len();
                self.set(target, Value::Text(combined))?;
                Ok(Step::Output(format!("Concatenated into {len} chars")))
            }
            DslCommand::Index {
                target,
                source,
                index,
            } => {
                let list = self.require_list(source)?;
                let item = list.get(*index).cloned().ok_or_else(|| {
                    RecurseError::Snippet(format!(
                        "Index {index} out of bounds for {source} (len={})",
                        list.len()
                    ))
                })?;
                self.set(target, Value::Text(item))?;
                Ok(Step::Output(format!("Got item [{index}] from {source}")))
            }
            DslCommand::Literal { target, text } => {
                self.set(target, Value::Text(text.clone()))?;
                Ok(Step::Silent)
            }
            DslCommand::Print { var_name } => {
                if var_name == CONTEXT_VAR {
                    return Err(RecurseError::Snippet(
                        "PRINT context is not allowed; SLICE it first".into(),
                    ));
                }
                let output = match self.require_var(var_name)? {
                    Value::List(v) => format!("List[{}]: {v:?}", v.len()),
                    other => other.as_text(),
                };
                Ok(Step::Output(output))
            }
            DslCommand::ShowVars => Ok(Step::Output(self.describe())),
        }
    }

    fn require_var(&self, name: &str) -> RecurseResult<&Value> {
        self.variables.get(name).ok_or_else(|| {
            RecurseError::Snippet(format!(
                "Variable '{name}' not found. Available: {:?}",
                self.names()
            ))
        })
    }

    fn require_text(&self, name: &str) -> RecurseResult<String> {
        Ok(self.require_var(name)?.as_text())
    }

    fn require_list(&self, name: &str) -> RecurseResult<Vec<String>> {
        Ok(self.require_var(name)?.as_list())
    }

    async fn source_text(&self, name: &str) -> RecurseResult<String> {
        if name == CONTEXT_VAR {
            self.context.read_all().await
        } else {
            self.require_text(name)
        }
    }
}

fn context_type(handle: &ContextHandle) -> &'static str {
    match handle.mode() {
        crate::config::ContextMode::Text => "context (text)",
        crate::config::ContextMode::File => "context (file)",
        crate::config::ContextMode::Segmented => "context (segmented)",
    }
}

fn compile(pattern: &str) -> RecurseResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| RecurseError::Snippet(format!("Invalid regex pattern \"{pattern}\": {e}")))
}

/// Split into pieces of at most `size` bytes, preferring to break after a newline.
fn chunk_by_chars(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + size).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // a single char wider than `size`
            end = start + text[start..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };
        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn namespace(text: &str) -> Namespace {
        Namespace::new(ContextHandle::Text(Arc::new(text.to_string())))
    }

    fn numbered(n: usize) -> String {
        (0..n).map(|i| format!("Line {i}\n")).collect()
    }

    #[tokio::test]
    async fn len_of_context_counts_lines() {
        let mut ns = namespace(&numbered(12));
        let cmd = DslCommand::Len {
            target: "n".into(),
            source: "context".into(),
        };
        ns.execute(&cmd).await.unwrap();
        assert_eq!(ns.get("n"), Some(&Value::Number(12)));
    }

    #[tokio::test]
    async fn slice_context_with_negative_bounds() {
        let mut ns = namespace(&numbered(10));
        let cmd = DslCommand::Slice {
            target: "tail".into(),
            source: "context".into(),
            start: -2,
            stop: 100,
        };
        ns.execute(&cmd).await.unwrap();
        assert_eq!(ns.get("tail").unwrap().as_text(), "Line 8\nLine 9\n");
    }

    #[tokio::test]
    async fn chunk_by_lines_keeps_every_line() {
        let mut ns = namespace(&numbered(10));
        let cmd = DslCommand::ChunkByLines {
            target: "chunks".into(),
            source: "context".into(),
            lines_per_chunk: 3,
        };
        ns.execute(&cmd).await.unwrap();
        let chunks = ns.get("chunks").unwrap().as_list();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.concat(), numbered(10));
    }

    #[test]
    fn chunk_by_chars_prefers_newlines() {
        let text = "aaaa\nbbbb\ncccc\n";
        let chunks = chunk_by_chars(text, 7);
        assert_eq!(chunks, vec!["aaaa\n", "bbbb\n", "cccc\n"]);
        assert_eq!(chunk_by_chars(&"x".repeat(10), 4).len(), 3);
    }

    #[test]
    fn chunk_by_chars_respects_char_boundaries() {
        let chunks = chunk_by_chars("ééé", 3);
        assert_eq!(chunks.concat(), "ééé");
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[tokio::test]
    async fn chunk_by_regex_drops_blank_sections() {
        let mut ns = namespace("## a\nalpha\n## b\nbeta\n");
        let cmd = DslCommand::ChunkByRegex {
            target: "sections".into(),
            source: "context".into(),
            pattern: "(?m)^## ".into(),
        };
        ns.execute(&cmd).await.unwrap();
        assert_eq!(
            ns.get("sections").unwrap().as_list(),
            vec!["a\nalpha\n".to_string(), "b\nbeta\n".to_string()]
        );
    }

    #[tokio::test]
    async fn find_reports_line_numbers() {
        let mut ns = namespace("ok\nERROR one\nok\nERROR two\n");
        let cmd = DslCommand::Find {
            target: "hits".into(),
            source: "context".into(),
            pattern: "ERROR".into(),
        };
        ns.execute(&cmd).await.unwrap();
        assert_eq!(
            ns.get("hits").unwrap().as_list(),
            vec!["1: ERROR one".to_string(), "3: ERROR two".to_string()]
        );
    }

    #[tokio::test]
    async fn invalid_regex_is_snippet_error() {
        let mut ns = namespace("x");
        let cmd = DslCommand::Find {
            target: "hits".into(),
            source: "context".into(),
            pattern: "(".into(),
        };
        let err = ns.execute(&cmd).await.unwrap_err();
        assert!(matches!(err, RecurseError::Snippet(_)));
    }

    #[tokio::test]
    async fn llm_query_with_variable_appends_context() {
        let mut ns = namespace("x");
        ns.set("head", Value::Text("the magic number is 7".into())).unwrap();
        let cmd = DslCommand::LlmQuery {
            target: "a".into(),
            prompt: "what is the magic number?".into(),
            with: Some("head".into()),
        };
        match ns.execute(&cmd).await.unwrap() {
            Step::Query { target, prompt } => {
                assert_eq!(target, "a");
                assert!(prompt.starts_with("what is the magic number?"));
                assert!(prompt.ends_with("the magic number is 7"));
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn parallel_and_map_build_one_prompt_per_item() {
        let mut ns = namespace("x");
        ns.set("parts", Value::List(vec!["p1".into(), "p2".into()])).unwrap();

        let par = DslCommand::ParallelQuery {
            target: "r".into(),
            prompt: "count".into(),
            source: "parts".into(),
        };
        assert_eq!(
            ns.execute(&par).await.unwrap(),
            Step::ParallelQuery {
                target: "r".into(),
                prompts: vec!["count\n\np1".into(), "count\n\np2".into()],
            }
        );

        let map = DslCommand::Map {
            target: "m".into(),
            source: "parts".into(),
            prompt_template: "summarize: {item}".into(),
        };
        assert_eq!(
            ns.execute(&map).await.unwrap(),
            Step::Map {
                target: "m".into(),
                prompts: vec!["summarize: p1".into(), "summarize: p2".into()],
            }
        );
    }

    #[tokio::test]
    async fn join_concat_index_get_literal() {
        let mut ns = namespace("body\n");
        ns.set("xs", Value::List(vec!["a".into(), "b".into(), "c".into()])).unwrap();

        for cmd in [
            DslCommand::Join {
                target: "j".into(),
                source: "xs".into(),
                separator: ", ".into(),
            },
            DslCommand::Literal {
                target: "pre".into(),
                text: "> ".into(),
            },
            DslCommand::Concat {
                target: "c".into(),
                left: "pre".into(),
                right: "j".into(),
            },
            DslCommand::Index {
                target: "second".into(),
                source: "xs".into(),
                index: 1,
            },
            DslCommand::Get {
                target: "whole".into(),
                source: "context".into(),
            },
        ] {
            ns.execute(&cmd).await.unwrap();
        }

        assert_eq!(ns.get("c").unwrap().as_text(), "> a, b, c");
        assert_eq!(ns.get("second").unwrap().as_text(), "b");
        assert_eq!(ns.get("whole").unwrap().as_text(), "body\n");
    }

    #[tokio::test]
    async fn index_out_of_bounds() {
        let mut ns = namespace("x");
        ns.set("xs", Value::List(vec!["a".into()])).unwrap();
        let cmd = DslCommand::Index {
            target: "y".into(),
            source: "xs".into(),
            index: 5,
        };
        let err = ns.execute(&cmd).await.unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[tokio::test]
    async fn missing_variable_lists_available() {
        let mut ns = namespace("x");
        let cmd = DslCommand::Print {
            var_name: "nope".into(),
        };
        let err = ns.execute(&cmd).await.unwrap_err();
        assert!(err.to_string().contains("'nope' not found"));
        assert!(err.to_string().contains("context"));
    }

    #[tokio::test]
    async fn context_cannot_be_overwritten() {
        let mut ns = namespace("x");
        assert!(ns.set("context", Value::Text("y".into())).is_err());
        assert_eq!(ns.resolve_text("context").await.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn file_mode_binds_context_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.txt");
        std::fs::write(&path, "one\ntwo\n").unwrap();
        let handle = crate::context::ContextSource::file(&path).open().await.unwrap();
        let ns = Namespace::new(handle);
        assert_eq!(
            ns.get("context_path").unwrap().as_text(),
            path.display().to_string()
        );
        assert!(ns.describe().contains("context (file)"));
    }
}
