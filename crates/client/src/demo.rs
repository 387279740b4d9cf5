use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::protocol::{
    ChatRequest, HistoryEntry, InfoResponse, InitRequest, InitResponse, SessionOffsets,
};
use super::transport::{BoxFuture, ChatTransport, TransportError, TransportResult};

const DEFAULT_CHUNK_CHARS: usize = 6;

pub fn default_demo_replies() -> Vec<String> {
    vec![
        "Danke für Ihre Nachricht! Ich schaue mir das gleich an.".to_string(),
        "Können Sie mir noch ein paar Details geben?".to_string(),
        "Verstanden. Ich fasse die wichtigsten Punkte für Sie zusammen.".to_string(),
        "Super! Gibt es sonst noch etwas, wobei ich helfen kann?".to_string(),
    ]
}

#[derive(Debug, Default)]
struct DemoSession {
    history: Vec<HistoryEntry>,
    reply: Vec<char>,
    emitted: usize,
}

impl DemoSession {
    fn is_running(&self) -> bool {
        self.emitted < self.reply.len()
    }

    fn advance(&mut self, chunk_chars: usize) {
        if !self.is_running() {
            return;
        }
        self.emitted = (self.emitted + chunk_chars).min(self.reply.len());
        let text = self.reply[..self.emitted].iter().collect::<String>();
        if let Some(last) = self.history.last_mut() {
            last.text = Some(text);
        }
    }

    /// Offsets that point the next fetch at the still-streaming tail, or past the end.
    fn offsets(&self) -> SessionOffsets {
        if self.is_running() {
            SessionOffsets::new(self.history.len().saturating_sub(1), self.emitted)
        } else {
            SessionOffsets::new(self.history.len(), 0)
        }
    }

    fn page(&self, from: Option<SessionOffsets>) -> Vec<HistoryEntry> {
        let Some(from) = from else {
            return self.history.clone();
        };

        self.history
            .iter()
            .skip(from.history)
            .enumerate()
            .map(|(position, entry)| {
                if position > 0 || from.text == 0 {
                    return entry.clone();
                }
                let tail = entry.text().chars().skip(from.text).collect::<String>();
                HistoryEntry {
                    text: Some(tail),
                    ..entry.clone()
                }
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct DemoState {
    sessions: HashMap<String, DemoSession>,
    next_session: u64,
    next_reply: usize,
}

/// In-memory backend that speaks the chat protocol without a network.
///
/// Every sent message is echoed into history and answered with the next canned reply, revealed
/// a few characters per info request so clients see the same streaming offsets a real backend
/// produces.
pub struct DemoTransport {
    replies: Vec<String>,
    chunk_chars: usize,
    latency: Duration,
    state: Mutex<DemoState>,
}

impl Default for DemoTransport {
    fn default() -> Self {
        Self::new(default_demo_replies())
    }
}

impl DemoTransport {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies,
            chunk_chars: DEFAULT_CHUNK_CHARS,
            latency: Duration::ZERO,
            state: Mutex::new(DemoState::default()),
        }
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    /// Delay applied before answering each request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Forgets a session so later requests for it answer 404.
    pub fn expire_session(&self, session_id: &str) -> bool {
        self.state().sessions.remove(session_id).is_some()
    }

    fn state(&self) -> MutexGuard<'_, DemoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn session_gone(path: &str) -> TransportError {
        TransportError::Status {
            stage: "demo-lookup-session",
            path: path.to_string(),
            status: 404,
            body: String::new(),
        }
    }
}

impl ChatTransport for DemoTransport {
    fn name(&self) -> &str {
        "demo"
    }

    fn init_session<'a>(
        &'a self,
        _request: InitRequest,
    ) -> BoxFuture<'a, TransportResult<InitResponse>> {
        Box::pin(async move {
            self.simulate_latency().await;
            let mut state = self.state();
            state.next_session += 1;
            let id = format!("demo-{}", state.next_session);
            state.sessions.insert(id.clone(), DemoSession::default());
            tracing::debug!(session_id = %id, "demo session created");
            Ok(InitResponse { id: Some(id) })
        })
    }

    fn send_chat<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.simulate_latency().await;
            let mut state = self.state();
            let reply = if self.replies.is_empty() {
                String::new()
            } else {
                let reply = self.replies[state.next_reply % self.replies.len()].clone();
                state.next_reply += 1;
                reply
            };

            let session = state
                .sessions
                .get_mut(&request.id)
                .ok_or_else(|| Self::session_gone("/chat"))?;
            session.history.push(HistoryEntry::user(request.input.text));
            if !reply.is_empty() {
                session.history.push(HistoryEntry::agent(""));
                session.reply = reply.chars().collect();
                session.emitted = 0;
            }
            Ok(())
        })
    }

    fn fetch_info<'a>(
        &'a self,
        session_id: &'a str,
        offsets: Option<SessionOffsets>,
    ) -> BoxFuture<'a, TransportResult<InfoResponse>> {
        Box::pin(async move {
            self.simulate_latency().await;
            let mut state = self.state();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| Self::session_gone("/info"))?;

            // Offsets and the running flag describe the page being returned, not the
            // state after this request advanced the reply.
            let mut response = InfoResponse::new(session.page(offsets))
                .with_offsets(session.offsets())
                .with_running(session.is_running());
            response.id = Some(session_id.to_string());
            session.advance(self.chunk_chars);
            Ok(response)
        })
    }
}
