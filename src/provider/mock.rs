use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{RecurseError, RecurseResult};
use crate::types::*;

use super::traits::Provider;

/// Provider that replays canned replies in order and records what it was sent.
///
/// When the script runs dry it repeats the fallback reply, or errors if none was set.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    calls: Mutex<Vec<(String, Vec<Message>)>>,
}

impl ScriptedProvider {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with the same text.
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(Vec::<String>::new()).with_fallback(reply)
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// `(model, messages)` of every call so far.
    pub fn calls(&self) -> Vec<(String, Vec<Message>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[Message], model: &str) -> RecurseResult<Message> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        let next = self.replies.lock().unwrap().pop_front();
        let text = match next.or_else(|| self.fallback.clone()) {
            Some(text) => text,
            None => return Err(RecurseError::Provider("script exhausted".into())),
        };
        let mut msg = Message::assistant(text);
        msg.model = Some(model.to_string());
        msg.usage = Some(TokenUsage::new(
            self.estimate_tokens(messages),
            msg.estimate_tokens(),
        ));
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_then_falls_back() {
        let provider = ScriptedProvider::new(["one", "two"]).with_fallback("again");
        let msgs = vec![Message::user("q")];
        assert_eq!(provider.complete(&msgs, "m").await.unwrap().content, "one");
        assert_eq!(provider.complete(&msgs, "m").await.unwrap().content, "two");
        assert_eq!(provider.complete(&msgs, "m").await.unwrap().content, "again");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let provider = ScriptedProvider::new(Vec::<String>::new());
        let err = provider.complete(&[Message::user("q")], "m").await.unwrap_err();
        assert!(matches!(err, RecurseError::Provider(_)));
    }
}
