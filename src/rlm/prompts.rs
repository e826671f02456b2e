//! Prompt templates for the root model.

use super::executor::ExecutionResult;

const TRUNCATION_MARKER: &str = "\n... [truncated]";

const SYSTEM_PROMPT: &str = r#"You are answering a query about a context that is too large to read in one go. The context lives in a REPL environment that you drive with short snippets, and the REPL can call a sub-LLM (which handles around 500K chars) on any piece of it. Use the sub-LLM as much as you can. You will be asked for your next action until you give a final answer.

The REPL starts with:
1. `context`, a handle on the context. Measure it with LEN, read lines with SLICE (negative indices count from the end), split it with CHUNK or search it with FIND.
2. LLM_QUERY, which sends a prompt (optionally followed by a variable's text) to the sub-LLM.
3. PRINT and SHOW_VARS to look at what you have built.

You only see truncated REPL output, so hand large pieces to LLM_QUERY instead of printing them. Use variables as buffers for your answer. Inspect enough of the context before answering: look at its format, pick a chunking strategy, process the chunks, then combine what you found.

Write snippets inside triple backticks tagged repl. One command per line:
```repl
LET n = LEN context
LET head = SLICE context 0 200
LET answer = LLM_QUERY "What is the magic number in this text?" WITH head
PRINT answer
```

Another example:
```repl
LET parts = CHUNK context BY_CHARS 50000
LET notes = MAP parts "Summarize the facts in this chunk that help answer the user query:\n\n{item}"
LET joined = JOIN notes "\n"
LET final_answer = LLM_QUERY "Use these chunk summaries to answer the original query:" WITH joined
```
In the next step you could then return FINAL_VAR(final_answer).

Commands:
- LET v = LEN src | SLICE src start stop | CHUNK src BY_LINES n | CHUNK src BY_CHARS n | CHUNK src BY_REGEX "re"
- LET v = FIND src "re" | LLM_QUERY "prompt" [WITH var] | MAP list "template with {item}" | FILTER list "condition"
- LET v = JOIN list "sep" | GET src | CONCAT a b | INDEX list n | "literal text"
- PRINT v, SHOW_VARS
{parallel_section}
IMPORTANT: when you are done, give the final answer outside of any code block using one of:
1. FINAL(your final answer here)
2. FINAL_VAR(variable_name) to return a variable you built in the REPL
Do not use them before you are done.

Think step by step, plan, and carry the plan out in the same reply. Do not just describe what you will do. Make sure the final answer addresses the original query."#;

const PARALLEL_SECTION: &str = r#"- LET v = PARALLEL_QUERY "prompt" WITH list sends one sub-LLM call per item concurrently and returns the answers in item order
"#;

const FORCE_PARALLEL_SECTION: &str = r#"- LET v = PARALLEL_QUERY "prompt" WITH list sends one sub-LLM call per item concurrently and returns the answers in item order

You MUST process chunks with PARALLEL_QUERY rather than MAP or repeated LLM_QUERY calls. Chunk the context first, then fan the chunks out in one PARALLEL_QUERY.
"#;

const NEXT_ACTION: &str = "Think step-by-step on what to do using the REPL environment (which holds `context`) to answer the original query: \"{query}\".\n\nKeep using the REPL by writing ```repl``` blocks, reading from `context` and calling the sub-LLM with LLM_QUERY to work out your answer. Your next action:";

/// System prompt. `parallel` advertises PARALLEL_QUERY; `force_parallel` requires it.
pub fn system_prompt(parallel: bool, force_parallel: bool) -> String {
    let section = match (parallel, force_parallel) {
        (true, true) => FORCE_PARALLEL_SECTION,
        (true, false) => PARALLEL_SECTION,
        (false, _) => "",
    };
    SYSTEM_PROMPT.replace("{parallel_section}", section)
}

/// Opening user turn: context description plus the first action request.
pub fn first_turn(query: &str, metadata: &str) -> String {
    format!("{metadata}\n\n{}", next_action(query, 0))
}

/// User turn asking for the next action.
pub fn next_action(query: &str, iteration: usize) -> String {
    let ask = NEXT_ACTION.replace("{query}", query);
    if iteration == 0 {
        format!(
            "You have not interacted with the REPL environment or looked at `context` yet. \
             Your next action should inspect the context, not give a final answer yet.\n\n{ask}"
        )
    } else {
        format!("The history before is your previous interactions with the REPL environment. {ask}")
    }
}

/// Final-answer-only turn once the budget is spent.
pub fn forced_final() -> &'static str {
    "Based on all the information you have, provide a final answer to the user's query now, \
     using FINAL(...) or FINAL_VAR(...). Do not write any more code."
}

/// Reply to a turn with neither code nor a final directive.
pub fn no_action() -> &'static str {
    "Your reply had no ```repl``` block and no FINAL(...) or FINAL_VAR(...). \
     Either run code in a ```repl``` block or give your final answer."
}

/// Corrective turn after `FINAL_VAR` named a variable that does not exist.
pub fn missing_variable(name: &str, available: &[String]) -> String {
    format!(
        "FINAL_VAR({name}) refers to a variable that does not exist. \
         Available variables: {}. Return an existing variable with FINAL_VAR, \
         or give the answer directly with FINAL(...).",
        available.join(", ")
    )
}

/// REPL feedback for one executed snippet, capped at `max_chars`.
pub fn execution_feedback(result: &ExecutionResult, max_chars: usize) -> String {
    let mut body = String::new();
    if !result.stdout.is_empty() {
        body.push_str(&result.stdout);
    }
    if let Some(err) = &result.error {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("Error: ");
        body.push_str(err);
    }
    if body.is_empty() {
        body.push_str("(no output)");
    }
    format!(
        "REPL output:\n{}\n\nREPL variables: {}",
        truncate_output(&body, max_chars),
        result.variables.join(", ")
    )
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
    }
}
