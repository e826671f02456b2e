use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Message Types ──────────────────────────────────────────────────────────

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            model: None,
            usage: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Estimate tokens for this message (rough: 4 chars ≈ 1 token, plus framing)
    pub fn estimate_tokens(&self) -> usize {
        (self.content.len() + 3) / 4 + 4
    }
}

// ─── Token Usage ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

// ─── Worker Prompts ──────────────────────────────────────────────────────────

/// A role/content pair as it appears on the worker wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Prompt accepted by a subordinate-model call: plain text, one turn, or a turn list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPayload {
    Text(String),
    Turn(ChatTurn),
    Turns(Vec<ChatTurn>),
}

impl PromptPayload {
    /// Normalize into a message list: text becomes a single user turn.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            PromptPayload::Text(text) => vec![Message::user(text)],
            PromptPayload::Turn(turn) => vec![Message::new(turn.role, turn.content)],
            PromptPayload::Turns(turns) => turns
                .into_iter()
                .map(|t| Message::new(t.role, t.content))
                .collect(),
        }
    }

    /// Total characters across all turns.
    pub fn char_len(&self) -> usize {
        match self {
            PromptPayload::Text(text) => text.len(),
            PromptPayload::Turn(turn) => turn.content.len(),
            PromptPayload::Turns(turns) => turns.iter().map(|t| t.content.len()).sum(),
        }
    }
}

impl From<String> for PromptPayload {
    fn from(text: String) -> Self {
        PromptPayload::Text(text)
    }
}

impl From<&str> for PromptPayload {
    fn from(text: &str) -> Self {
        PromptPayload::Text(text.to_string())
    }
}
