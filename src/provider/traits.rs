use async_trait::async_trait;

use crate::error::RecurseResult;
use crate::types::*;

/// Chat-completion backend used for both root and subordinate calls.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in logs and rate-limit errors.
    fn name(&self) -> &str;

    /// One non-streaming completion. `messages` may start with a system turn.
    async fn complete(&self, messages: &[Message], model: &str) -> RecurseResult<Message>;

    /// Token estimate for a message list (~4 chars per token).
    fn estimate_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| m.estimate_tokens()).sum()
    }
}
