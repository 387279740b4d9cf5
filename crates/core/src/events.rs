/// Whether the user may submit a message right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendAvailability {
    Ready,
    /// A reply is still being produced.
    AwaitingAgent,
    /// Privacy consent is required and has not been given yet.
    ConsentPending,
    /// Consent was declined; only a reset reopens the conversation.
    Terminated,
}

impl SendAvailability {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

/// UI-facing flags published with every [`TranscriptEvent::StateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub awaiting_agent: bool,
    pub availability: SendAvailability,
    pub tool_call_anchor: Option<usize>,
    pub typing_anchor: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The backend reported that the agent finished.
    Idle,
    /// Too many consecutive fetch failures.
    FailureCeiling,
    /// The backend forgot the session.
    SessionExpired,
    /// No session was left to poll.
    NoSession,
    /// Stopped by reset, consent decline or an explicit stop.
    Cancelled,
}

/// Change notifications for the rendering layer. Indices refer to the store after the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    MessageAdded { index: usize },
    /// Content or flags of the message changed; repaint it.
    MessageUpdated { index: usize },
    /// The message at `index` is gone and every later message moved down by one.
    MessageRemoved { index: usize },
    Cleared,
    StateChanged(EngineStatus),
    PollingStopped { reason: StopReason },
}
