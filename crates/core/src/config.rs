pub const DEFAULT_MAX_POLL_FAILURES: u32 = 3;
pub const DEFAULT_CONNECTION_LOST_TEXT: &str =
    "Die Verbindung zum Server wurde unterbrochen. Bitte versuchen Sie es später erneut.";

/// Localized texts the engine itself inserts into the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTexts {
    /// Non-blocking notice shown once polling gives up.
    pub connection_lost: String,
}

impl Default for EngineTexts {
    fn default() -> Self {
        Self {
            connection_lost: DEFAULT_CONNECTION_LOST_TEXT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Consecutive failed fetches after which polling stops for the session.
    pub max_poll_failures: u32,
    pub require_privacy_consent: bool,
    pub texts: EngineTexts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            require_privacy_consent: false,
            texts: EngineTexts::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_poll_failures(mut self, max_poll_failures: u32) -> Self {
        self.max_poll_failures = max_poll_failures;
        self.normalized()
    }

    pub fn with_privacy_consent(mut self, required: bool) -> Self {
        self.require_privacy_consent = required;
        self
    }

    pub fn with_connection_lost_text(mut self, text: impl Into<String>) -> Self {
        self.texts.connection_lost = text.into();
        self.normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.max_poll_failures = self.max_poll_failures.max(1);
        if self.texts.connection_lost.trim().is_empty() {
            self.texts.connection_lost = DEFAULT_CONNECTION_LOST_TEXT.to_string();
        }
        self
    }
}
