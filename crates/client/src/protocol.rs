//! Wire shapes of the chat backend.
//!
//! Every response field is optional on the wire; missing fields deserialize to their defaults
//! and the reconciler decides what an absent value means.

use serde::{Deserialize, Serialize};

/// Incremental fetch cursor.
///
/// `history` counts fully consumed history entries, `text` counts characters of the last
/// consumed entry already applied. `text` is only nonzero while that entry is still streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SessionOffsets {
    #[serde(default)]
    pub history: usize,
    #[serde(default)]
    pub text: usize,
}

impl SessionOffsets {
    pub const fn new(history: usize, text: usize) -> Self {
        Self { history, text }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitResponse {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInput {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub id: String,
    pub input: ChatInput,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl ChatRequest {
    pub fn new(id: impl Into<String>, text: impl Into<String>, preset: Option<String>) -> Self {
        Self {
            id: id.into(),
            input: ChatInput { text: text.into() },
            stream: true,
            preset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_tool_call: bool,
}

impl HistoryEntry {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", text)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new("agent", text)
    }

    /// Agent entry announcing a tool invocation that has not produced text yet.
    pub fn tool_call() -> Self {
        Self {
            role: "agent".to_string(),
            is_tool_call: true,
            ..Self::default()
        }
    }

    pub fn with_date_time(mut self, date_time: impl Into<String>) -> Self {
        self.date_time = Some(date_time.into());
        self
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn has_text(&self) -> bool {
        !self.text().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InfoResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<SessionOffsets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
}

impl InfoResponse {
    pub fn new(history: Vec<HistoryEntry>) -> Self {
        Self {
            history,
            ..Self::default()
        }
    }

    pub fn with_offsets(mut self, offsets: SessionOffsets) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    /// An absent flag means the agent is idle.
    pub fn is_running(&self) -> bool {
        self.running.unwrap_or(false)
    }
}
