//! Snippet language the root model writes inside ```repl``` blocks.
//!
//! One command per line; `#` and `//` start comments.
//!
//! ```text
//! LET n = LEN context
//! LET head = SLICE context 0 200
//! LET tail = SLICE context -50 -1
//! LET parts = CHUNK context BY_LINES 500
//! LET parts = CHUNK context BY_CHARS 50000
//! LET parts = CHUNK context BY_REGEX "^## "
//! LET hits = FIND context "ERROR|panic"
//! LET answer = LLM_QUERY "what is the magic number?" WITH head
//! LET notes = PARALLEL_QUERY "summarize" WITH parts
//! LET notes = MAP parts "summarize: {item}"
//! LET keep = FILTER parts "mentions a deadline"
//! LET text = JOIN notes "\n"
//! LET copy = GET text
//! LET both = CONCAT head tail
//! LET first = INDEX parts 0
//! LET label = "literal text"
//! PRINT text
//! SHOW_VARS
//! ```

use std::fmt;

/// Name under which the task's context is bound. Cannot be reassigned.
pub const CONTEXT_VAR: &str = "context";
/// Name bound to the context file path in file mode.
pub const CONTEXT_PATH_VAR: &str = "context_path";

/// Fence tag marking an executable block.
pub const FENCE_TAG: &str = "repl";

/// A parsed snippet command
#[derive(Debug, Clone, PartialEq)]
pub enum DslCommand {
    /// LET var = LEN source
    Len { target: String, source: String },
    /// LET var = SLICE source start stop (line indices, negatives count from the end)
    Slice {
        target: String,
        source: String,
        start: i64,
        stop: i64,
    },
    /// LET var = CHUNK source BY_LINES n
    ChunkByLines {
        target: String,
        source: String,
        lines_per_chunk: usize,
    },
    /// LET var = CHUNK source BY_CHARS n
    ChunkByChars {
        target: String,
        source: String,
        chars_per_chunk: usize,
    },
    /// LET var = CHUNK source BY_REGEX "pattern"
    ChunkByRegex {
        target: String,
        source: String,
        pattern: String,
    },
    /// LET var = FIND source "pattern"
    Find {
        target: String,
        source: String,
        pattern: String,
    },
    /// LET var = LLM_QUERY "prompt" [WITH var]
    LlmQuery {
        target: String,
        prompt: String,
        with: Option<String>,
    },
    /// LET var = PARALLEL_QUERY "prompt" WITH list
    ParallelQuery {
        target: String,
        prompt: String,
        source: String,
    },
    /// LET var = MAP source "template with {item}"
    Map {
        target: String,
        source: String,
        prompt_template: String,
    },
    /// LET var = FILTER source "condition"
    Filter {
        target: String,
        source: String,
        condition: String,
    },
    /// LET var = JOIN source "separator"
    Join {
        target: String,
        source: String,
        separator: String,
    },
    /// LET var = GET source
    Get { target: String, source: String },
    /// LET var = CONCAT left right
    Concat {
        target: String,
        left: String,
        right: String,
    },
    /// LET var = INDEX source n
    Index {
        target: String,
        source: String,
        index: usize,
    },
    /// LET var = "text"
    Literal { target: String, text: String },
    /// PRINT var
    Print { var_name: String },
    /// SHOW_VARS
    ShowVars,
}

impl DslCommand {
    /// Variable written by this command, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            DslCommand::Len { target, .. }
            | DslCommand::Slice { target, .. }
            | DslCommand::ChunkByLines { target, .. }
            | DslCommand::ChunkByChars { target, .. }
            | DslCommand::ChunkByRegex { target, .. }
            | DslCommand::Find { target, .. }
            | DslCommand::LlmQuery { target, .. }
            | DslCommand::ParallelQuery { target, .. }
            | DslCommand::Map { target, .. }
            | DslCommand::Filter { target, .. }
            | DslCommand::Join { target, .. }
            | DslCommand::Get { target, .. }
            | DslCommand::Concat { target, .. }
            | DslCommand::Index { target, .. }
            | DslCommand::Literal { target, .. } => Some(target),
            DslCommand::Print { .. } | DslCommand::ShowVars => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DslError {
    pub line: usize,
    pub message: String,
    pub source_line: String,
}

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {}: {} ({})", self.line, self.message, self.source_line)
    }
}

impl std::error::Error for DslError {}

pub struct DslParser;

impl DslParser {
    /// Parse a snippet (the body of one ```repl``` block).
    pub fn parse(input: &str) -> Result<Vec<DslCommand>, DslError> {
        let mut commands = Vec::new();
        for (line_num, line) in input.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
                continue;
            }
            match Self::parse_line(trimmed) {
                Ok(cmd) => commands.push(cmd),
                Err(msg) => {
                    return Err(DslError {
                        line: line_num + 1,
                        message: msg,
                        source_line: trimmed.to_string(),
                    });
                }
            }
        }
        Ok(commands)
    }

    /// Bodies of every ```repl``` block, in order.
    pub fn extract_blocks(text: &str) -> Vec<String> {
        let mut blocks = Vec::new();
        let mut in_block = false;
        let mut current = String::new();

        for line in text.lines() {
            let trimmed = line.trim();
            if !in_block && Self::is_opening_fence(trimmed) {
                in_block = true;
                current.clear();
            } else if in_block && trimmed == "```" {
                in_block = false;
                if !current.trim().is_empty() {
                    blocks.push(current.trim().to_string());
                }
            } else if in_block {
                current.push_str(line);
                current.push('\n');
            }
        }
        blocks
    }

    /// Only the first block is actionable; later ones are discarded.
    pub fn extract_first_block(text: &str) -> Option<String> {
        Self::extract_blocks(text).into_iter().next()
    }

    /// `text` with every fenced block (any language) removed.
    pub fn strip_fenced(text: &str) -> String {
        let mut out = String::new();
        let mut in_block = false;
        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_block = !in_block;
                continue;
            }
            if !in_block {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    fn is_opening_fence(trimmed: &str) -> bool {
        trimmed
            .strip_prefix("```")
            .map(|tag| tag.trim() == FENCE_TAG)
            .unwrap_or(false)
    }

    fn parse_line(line: &str) -> Result<DslCommand, String> {
        let tokens: Vec<&str> = Self::tokenize(line);
        if tokens.is_empty() {
            return Err("Empty line".into());
        }

        match tokens[0].to_uppercase().as_str() {
            "LET" => Self::parse_let(&tokens),
            "PRINT" => {
                if tokens.len() < 2 {
                    return Err("PRINT requires a variable name".into());
                }
                Ok(DslCommand::Print {
                    var_name: tokens[1].to_string(),
                })
            }
            "SHOW_VARS" => Ok(DslCommand::ShowVars),
            _ => Err(format!("Unknown command: {}", tokens[0])),
        }
    }

    fn parse_let(tokens: &[&str]) -> Result<DslCommand, String> {
        // LET target = OPERATION ...
        if tokens.len() < 4 || tokens[2] != "=" {
            return Err("LET syntax: LET <var> = <operation> ...".into());
        }
        let target = tokens[1].to_string();
        if !is_identifier(&target) {
            return Err(format!("Invalid variable name: {target}"));
        }
        if target == CONTEXT_VAR || target == CONTEXT_PATH_VAR {
            return Err(format!("'{target}' is reserved and cannot be reassigned"));
        }

        if tokens[3].starts_with('"') {
            let text = Self::extract_quoted_at(tokens, 3)?;
            return Ok(DslCommand::Literal {
                target,
                text: unescape(&text),
            });
        }

        let operation = tokens[3].to_uppercase();
        match operation.as_str() {
            "LEN" => {
                let source = Self::arg(tokens, 4, "LEN syntax: LEN <source>")?;
                Ok(DslCommand::Len { target, source })
            }
            "SLICE" => {
                if tokens.len() < 7 {
                    return Err("SLICE syntax: SLICE <source> <start> <stop>".into());
                }
                let source = tokens[4].to_string();
                let start: i64 = tokens[5].parse().map_err(|_| "SLICE start must be an integer")?;
                let stop: i64 = tokens[6].parse().map_err(|_| "SLICE stop must be an integer")?;
                Ok(DslCommand::Slice {
                    target,
                    source,
                    start,
                    stop,
                })
            }
            "CHUNK" => {
                if tokens.len() < 7 {
                    return Err("CHUNK syntax: CHUNK <source> BY_LINES|BY_CHARS|BY_REGEX <value>".into());
                }
                let source = tokens[4].to_string();
                let strategy = tokens[5].to_uppercase();
                match strategy.as_str() {
                    "BY_LINES" => {
                        let n = Self::positive(tokens[6], "BY_LINES")?;
                        Ok(DslCommand::ChunkByLines {
                            target,
                            source,
                            lines_per_chunk: n,
                        })
                    }
                    "BY_CHARS" => {
                        let n = Self::positive(tokens[6], "BY_CHARS")?;
                        Ok(DslCommand::ChunkByChars {
                            target,
                            source,
                            chars_per_chunk: n,
                        })
                    }
                    "BY_REGEX" => {
                        let pattern = Self::extract_quoted_at(tokens, 6)?;
                        Ok(DslCommand::ChunkByRegex {
                            target,
                            source,
                            pattern,
                        })
                    }
                    _ => Err(format!("Unknown chunk strategy: {strategy}")),
                }
            }
            "FIND" => {
                if tokens.len() < 6 {
                    return Err("FIND syntax: FIND <source> \"pattern\"".into());
                }
                let source = tokens[4].to_string();
                let pattern = Self::extract_quoted_at(tokens, 5)?;
                Ok(DslCommand::Find {
                    target,
                    source,
                    pattern,
                })
            }
            "LLM_QUERY" => {
                // LET target = LLM_QUERY "prompt" [WITH var]
                let full_line = tokens[4..].join(" ");
                let (prompt, rest) = Self::split_quoted_and_rest(&full_line)?;
                let rest_tokens: Vec<&str> = rest.split_whitespace().collect();
                let with = match rest_tokens.as_slice() {
                    [] => None,
                    [kw, var] if kw.eq_ignore_ascii_case("WITH") => Some(var.to_string()),
                    _ => return Err("LLM_QUERY syntax: LLM_QUERY \"prompt\" [WITH <var>]".into()),
                };
                Ok(DslCommand::LlmQuery {
                    target,
                    prompt: unescape(&prompt),
                    with,
                })
            }
            "PARALLEL_QUERY" => {
                let full_line = tokens[4..].join(" ");
                let (prompt, rest) = Self::split_quoted_and_rest(&full_line)?;
                let rest_tokens: Vec<&str> = rest.split_whitespace().collect();
                match rest_tokens.as_slice() {
                    [kw, var] if kw.eq_ignore_ascii_case("WITH") => Ok(DslCommand::ParallelQuery {
                        target,
                        prompt: unescape(&prompt),
                        source: var.to_string(),
                    }),
                    _ => Err("PARALLEL_QUERY syntax: PARALLEL_QUERY \"prompt\" WITH <list>".into()),
                }
            }
            "MAP" => {
                if tokens.len() < 6 {
                    return Err("MAP syntax: MAP <source> \"prompt template\"".into());
                }
                let source = tokens[4].to_string();
                let prompt_template = unescape(&Self::extract_quoted_at(tokens, 5)?);
                Ok(DslCommand::Map {
                    target,
                    source,
                    prompt_template,
                })
            }
            "FILTER" => {
                if tokens.len() < 6 {
                    return Err("FILTER syntax: FILTER <source> \"condition\"".into());
                }
                let source = tokens[4].to_string();
                let condition = Self::extract_quoted_at(tokens, 5)?;
                Ok(DslCommand::Filter {
                    target,
                    source,
                    condition,
                })
            }
            "JOIN" => {
                if tokens.len() < 6 {
                    return Err("JOIN syntax: JOIN <source> \"separator\"".into());
                }
                let source = tokens[4].to_string();
                let separator = unescape(&Self::extract_quoted_at(tokens, 5)?);
                Ok(DslCommand::Join {
                    target,
                    source,
                    separator,
                })
            }
            "GET" => {
                let source = Self::arg(tokens, 4, "GET syntax: GET <source>")?;
                Ok(DslCommand::Get { target, source })
            }
            "CONCAT" => {
                if tokens.len() < 6 {
                    return Err("CONCAT syntax: CONCAT <left> <right>".into());
                }
                Ok(DslCommand::Concat {
                    target,
                    left: tokens[4].to_string(),
                    right: tokens[5].to_string(),
                })
            }
            "INDEX" => {
                if tokens.len() < 6 {
                    return Err("INDEX syntax: INDEX <source> <index>".into());
                }
                let index: usize = tokens[5].parse().map_err(|_| "INDEX requires a number")?;
                Ok(DslCommand::Index {
                    target,
                    source: tokens[4].to_string(),
                    index,
                })
            }
            _ => Err(format!("Unknown operation: {operation}")),
        }
    }

    fn arg(tokens: &[&str], index: usize, usage: &str) -> Result<String, String> {
        tokens
            .get(index)
            .map(|t| t.to_string())
            .ok_or_else(|| usage.to_string())
    }

    fn positive(token: &str, what: &str) -> Result<usize, String> {
        match token.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(format!("{what} requires a positive number")),
        }
    }

    /// Tokenize respecting quoted strings
    fn tokenize(line: &str) -> Vec<&str> {
        let mut tokens = Vec::new();
        let mut chars = line.char_indices().peekable();
        let mut token_start: Option<usize> = None;

        while let Some(&(i, c)) = chars.peek() {
            if c == '"' && token_start.is_none() {
                let start = i;
                chars.next();
                let mut escaped = false;
                while let Some(&(_, ch)) = chars.peek() {
                    chars.next();
                    if ch == '"' && !escaped {
                        break;
                    }
                    escaped = ch == '\\' && !escaped;
                }
                let end = chars.peek().map(|&(i, _)| i).unwrap_or(line.len());
                tokens.push(&line[start..end]);
            } else if c.is_whitespace() {
                if let Some(start) = token_start {
                    tokens.push(&line[start..i]);
                    token_start = None;
                }
                chars.next();
            } else {
                if token_start.is_none() {
                    token_start = Some(i);
                }
                chars.next();
            }
        }
        if let Some(start) = token_start {
            tokens.push(&line[start..]);
        }
        tokens
    }

    fn extract_quoted_at(tokens: &[&str], index: usize) -> Result<String, String> {
        let token = tokens.get(index).ok_or("Missing quoted string")?;
        if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
            Ok(token[1..token.len() - 1].to_string())
        } else {
            Err(format!("Expected quoted string at position {index}, got: {token}"))
        }
    }

    fn split_quoted_and_rest(input: &str) -> Result<(String, String), String> {
        let trimmed = input.trim();
        if !trimmed.starts_with('"') {
            return Err("Expected quoted string".into());
        }
        let mut escaped = false;
        for (i, ch) in trimmed.char_indices().skip(1) {
            if ch == '"' && !escaped {
                let quoted = trimmed[1..i].to_string();
                let rest = trimmed[i + 1..].trim().to_string();
                return Ok((quoted, rest));
            }
            escaped = ch == '\\' && !escaped;
        }
        Err("Unterminated quoted string".into())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolve `\n`, `\t`, `\"` and `\\` inside quoted arguments.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
