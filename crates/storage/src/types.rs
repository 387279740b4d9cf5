use chrono::{DateTime, Utc};

/// Transcript speaker role. Anything the backend does not report as a user is the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Agent,
}

/// Delivery state of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Index trackers owned by the message store.
///
/// Each anchor names one store position and is shifted or invalidated by the store
/// whenever an earlier message is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    /// Message that should display the "tool working" indicator.
    ToolCall,
    /// Message after which the typing indicator is painted.
    Typing,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    /// Display text, HTML entities decoded.
    pub content: String,
    /// Server text exactly as received. Sync offsets count characters of this text, not of
    /// `content`. `None` for messages created by this client.
    pub raw_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Only set for user messages.
    pub status: Option<DeliveryStatus>,
    /// True until the server has echoed this message back in history.
    pub local_only: bool,
    pub is_tool_call: bool,
    pub is_tool_placeholder: bool,
    pub is_streaming_placeholder: bool,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            raw_content: None,
            timestamp: Utc::now(),
            status: None,
            local_only: false,
            is_tool_call: false,
            is_tool_placeholder: false,
            is_streaming_placeholder: false,
        }
    }

    /// Optimistic user message inserted before the backend has seen it.
    pub fn user_pending(content: impl Into<String>) -> Self {
        Self {
            status: Some(DeliveryStatus::Pending),
            local_only: true,
            ..Self::new(MessageRole::User, content)
        }
    }

    /// Agent-side notice that only exists in this client, e.g. a connection error.
    pub fn local_notice(content: impl Into<String>) -> Self {
        Self {
            local_only: true,
            ..Self::new(MessageRole::Agent, content)
        }
    }

    pub fn with_raw_content(mut self, raw_content: impl Into<String>) -> Self {
        self.raw_content = Some(raw_content.into());
        self
    }

    /// Text that server offsets refer to.
    pub fn synced_text(&self) -> &str {
        self.raw_content.as_deref().unwrap_or(&self.content)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }

    pub fn is_local_notice(&self) -> bool {
        self.role == MessageRole::Agent && self.local_only
    }

    pub fn is_failed(&self) -> bool {
        self.status == Some(DeliveryStatus::Failed)
    }
}

/// Partial update applied by [`crate::MessageStore::update`]. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub raw_content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: Option<DeliveryStatus>,
    pub local_only: Option<bool>,
    pub is_tool_call: Option<bool>,
    pub is_tool_placeholder: Option<bool>,
    pub is_streaming_placeholder: Option<bool>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn status(status: DeliveryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub(crate) fn apply_to(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(raw_content) = self.raw_content {
            message.raw_content = Some(raw_content);
        }
        if let Some(timestamp) = self.timestamp {
            message.timestamp = timestamp;
        }
        if let Some(status) = self.status {
            message.status = Some(status);
        }
        if let Some(local_only) = self.local_only {
            message.local_only = local_only;
        }
        if let Some(is_tool_call) = self.is_tool_call {
            message.is_tool_call = is_tool_call;
        }
        if let Some(is_tool_placeholder) = self.is_tool_placeholder {
            message.is_tool_placeholder = is_tool_placeholder;
        }
        if let Some(is_streaming_placeholder) = self.is_streaming_placeholder {
            message.is_streaming_placeholder = is_streaming_placeholder;
        }
    }
}
