mod client;
mod parser;
mod transcript;

pub use client::AgentProcessClient;
pub use transcript::Transcripts;

use serde::{Deserialize, Serialize};

/// Who authored a text fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Token usage reported by a single invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

impl UsageStats {
    /// Input tokens actually consumed, excluding cache hits
    pub fn net_input(&self) -> u64 {
        self.input_tokens.saturating_sub(self.cached_tokens)
    }
}

/// One normalized unit of agent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The agent announced the session it is running in
    Init {
        session_id: String,
        model: Option<String>,
    },
    /// Content fragment
    Text {
        content: String,
        role: Option<Role>,
    },
    /// Internal reasoning, not primary output
    Thought { content: String },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResponse {
        id: String,
        output: String,
        success: bool,
    },
    Error { message: String },
    /// Terminal event, nothing follows it
    Done { usage: Option<UsageStats> },
}

impl AgentEvent {
    /// Text the agent itself produced; echoed user prompts are excluded
    pub fn assistant_text(&self) -> Option<&str> {
        match self {
            AgentEvent::Text {
                content,
                role: Some(Role::Assistant) | None,
            } => Some(content),
            _ => None,
        }
    }
}
