//! Chat glue: where contexts come from and where answers go.
//!
//! Transcript storage and front ends live outside this crate. They plug in
//! through [`ChatLog`] and call an [`Agent`]; [`answer_and_record`] ties the
//! two together for one user turn.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextSource;
use crate::error::{RecurseError, RecurseResult};
use crate::rlm::RlmEngine;

/// Source of the context text and sink for answered turns.
#[async_trait]
pub trait ChatLog: Send + Sync {
    /// Current conversation rendered as plain text.
    async fn read_context(&self) -> RecurseResult<String>;

    async fn append_turn(&self, query: &str, answer: &str) -> RecurseResult<()>;
}

/// Anything that answers a query over a context.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke_agent(&self, query: &str, context: &str) -> RecurseResult<String>;
}

#[async_trait]
impl Agent for RlmEngine {
    async fn invoke_agent(&self, query: &str, context: &str) -> RecurseResult<String> {
        let result = self
            .completion(ContextSource::text(context.to_string()), query)
            .await?;
        Ok(result.answer)
    }
}

/// Read the context, answer `query`, record the turn. Returns the answer.
pub async fn answer_and_record(
    log: &dyn ChatLog,
    agent: &dyn Agent,
    query: &str,
) -> RecurseResult<String> {
    let query = query.trim();
    if query.is_empty() {
        return Err(RecurseError::Config("query cannot be empty".into()));
    }
    let context = log.read_context().await?;
    let answer = agent.invoke_agent(query, &context).await?;
    log.append_turn(query, &answer).await?;
    Ok(answer)
}

/// One answered turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub query: String,
    pub answer: String,
    pub at: DateTime<Utc>,
}

/// In-memory chat log seeded with a transcript.
pub struct MemoryChatLog {
    transcript: String,
    turns: Mutex<Vec<Turn>>,
}

impl MemoryChatLog {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            turns: Mutex::new(Vec::new()),
        }
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatLog for MemoryChatLog {
    async fn read_context(&self) -> RecurseResult<String> {
        let mut text = self.transcript.clone();
        for turn in self.turns.lock().unwrap().iter() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("user: {}\nassistant: {}\n", turn.query, turn.answer));
        }
        Ok(text)
    }

    async fn append_turn(&self, query: &str, answer: &str) -> RecurseResult<()> {
        self.turns.lock().unwrap().push(Turn {
            query: query.to_string(),
            answer: answer.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::RlmConfig;
    use crate::provider::ScriptedProvider;

    struct Upper;

    #[async_trait]
    impl Agent for Upper {
        async fn invoke_agent(&self, query: &str, context: &str) -> RecurseResult<String> {
            Ok(format!("{} ({} chars)", query.to_uppercase(), context.len()))
        }
    }

    #[tokio::test]
    async fn records_turn_after_answering() {
        let log = MemoryChatLog::new("alice: hi\nbob: hello\n");
        let answer = answer_and_record(&log, &Upper, " who spoke? ").await.unwrap();
        assert_eq!(answer, "WHO SPOKE? (21 chars)");
        let turns = log.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].query, "who spoke?");
    }

    #[tokio::test]
    async fn later_turns_see_earlier_answers() {
        let log = MemoryChatLog::new("start");
        answer_and_record(&log, &Upper, "one").await.unwrap();
        let context = log.read_context().await.unwrap();
        assert_eq!(context, "start\nuser: one\nassistant: ONE (5 chars)\n");
    }

    #[tokio::test]
    async fn empty_query_is_rejected_before_any_work() {
        let log = MemoryChatLog::new("x");
        let err = answer_and_record(&log, &Upper, "   ").await.unwrap_err();
        assert!(matches!(err, RecurseError::Config(_)));
        assert!(log.turns().is_empty());
    }

    #[tokio::test]
    async fn engine_is_an_agent() {
        let provider = Arc::new(ScriptedProvider::new(["FINAL(bob)"]));
        let engine = RlmEngine::new(provider, RlmConfig::default()).unwrap();
        let log = MemoryChatLog::new("alice: hi\nbob: hello\n");
        let answer = answer_and_record(&log, &engine, "who answered?").await.unwrap();
        assert_eq!(answer, "bob");
        assert_eq!(log.turns()[0].answer, "bob");
    }
}
