//! `FINAL(...)` and `FINAL_VAR(name)` recognition in root-model replies.
//!
//! Directives are looked for in prose only; text inside fenced code blocks
//! is ignored. When both forms appear, the earliest one wins.

use std::sync::OnceLock;

use regex::Regex;

use super::dsl::DslParser;

/// How the root model declared it is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `FINAL(text)`: the answer is the literal text.
    Literal(String),
    /// `FINAL_VAR(name)`: the answer is the value of a namespace variable.
    /// `raw` is the directive as written, used when the variable is missing.
    Variable { name: String, raw: String },
}

fn final_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bFINAL_VAR\(([^)]*)\)").expect("valid FINAL_VAR regex")
    })
}

fn final_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bFINAL\(").expect("valid FINAL regex"))
}

/// Body of the `FINAL(` opening at `open_end`, up to its balanced `)`.
///
/// Nested parentheses stay in the answer. An unbalanced body runs to the
/// last `)` in the reply.
fn literal_body(prose: &str, open_end: usize) -> Option<&str> {
    let rest = &prose[open_end..];
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(&rest[..i]),
            ')' => depth -= 1,
            _ => {}
        }
    }
    rest.rfind(')').map(|i| &rest[..i])
}

/// Find the directive in a reply, if any.
pub fn parse_directive(reply: &str) -> Option<Directive> {
    let prose = DslParser::strip_fenced(reply);

    let var = final_var_re().captures(&prose).map(|caps| {
        let whole = caps.get(0).map(|m| (m.start(), m.as_str().to_string()));
        let name = caps[1]
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string();
        (whole, name)
    });
    let literal = final_open_re().find_iter(&prose).find_map(|open| {
        literal_body(&prose, open.end()).map(|body| (open.start(), body.trim().to_string()))
    });

    match (var, literal) {
        (Some((Some((var_start, raw)), name)), Some((lit_start, text))) => {
            if lit_start < var_start {
                Some(Directive::Literal(text))
            } else {
                Some(Directive::Variable { name, raw })
            }
        }
        (Some((Some((_, raw)), name)), None) => Some(Directive::Variable { name, raw }),
        (_, Some((_, text))) => Some(Directive::Literal(text)),
        _ => None,
    }
}
