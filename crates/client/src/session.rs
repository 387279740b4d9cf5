use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use palaver_storage::SessionPersistence;
use snafu::{OptionExt, ResultExt};

use super::config::ServiceConfig;
use super::error::{ClientResult, InitializationFailedSnafu, NoSessionSnafu, SendSnafu};
use super::protocol::{ChatRequest, InfoResponse, InitRequest, SessionOffsets};
use super::transport::{ChatTransport, FailureKind};

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// A successful info response together with the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedInfo {
    pub session_id: String,
    /// Offsets sent with the request; `None` for a full refresh.
    pub requested: Option<SessionOffsets>,
    pub response: InfoResponse,
}

impl FetchedInfo {
    pub fn is_full(&self) -> bool {
        self.requested.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(FetchedInfo),
    /// There was no session to fetch for.
    NoSession,
    /// The backend answered 404; the session has already been cleared.
    SessionExpired,
    Failed {
        kind: FailureKind,
        failure_count: u32,
        message: String,
    },
}

#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    offsets: Option<SessionOffsets>,
    poll_failure_count: u32,
}

struct SessionInner {
    config: ServiceConfig,
    transport: Arc<dyn ChatTransport>,
    persistence: Arc<dyn SessionPersistence>,
    state: Mutex<SessionState>,
    init_flight: Mutex<Option<Flight<bool>>>,
    fetch_flight: Mutex<Option<Flight<FetchOutcome>>>,
}

/// Owns the remote session id and performs the three remote operations.
///
/// Cloning is cheap and every clone shares one session. `init_session` and `fetch_info` are
/// single-flight: callers arriving while a request is pending await that same request.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionClient {
    pub fn new(
        config: ServiceConfig,
        transport: Arc<dyn ChatTransport>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config: config.normalized(),
                transport,
                persistence,
                state: Mutex::new(SessionState::default()),
                init_flight: Mutex::new(None),
                fetch_flight: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.state).session_id.clone()
    }

    pub fn has_session(&self) -> bool {
        lock(&self.inner.state).session_id.is_some()
    }

    pub fn offsets(&self) -> Option<SessionOffsets> {
        lock(&self.inner.state).offsets
    }

    pub fn set_offsets(&self, offsets: SessionOffsets) {
        lock(&self.inner.state).offsets = Some(offsets);
    }

    pub fn poll_failure_count(&self) -> u32 {
        lock(&self.inner.state).poll_failure_count
    }

    /// Adopts a session id left in durable storage by an earlier run.
    ///
    /// Offsets stay unset so the first fetch is a full refresh.
    pub fn load_persisted_session(&self) -> Option<String> {
        let key = &self.inner.config.storage_key;
        let stored = match self.inner.persistence.load(key) {
            Ok(stored) => stored,
            Err(error) => {
                tracing::warn!(storage_key = %key, error = %error, "failed to read persisted session id");
                None
            }
        };
        let session_id = stored.filter(|id| !id.trim().is_empty())?;

        let mut state = lock(&self.inner.state);
        state.session_id = Some(session_id.clone());
        state.offsets = None;
        state.poll_failure_count = 0;
        tracing::info!(session_id = %session_id, "restored persisted chat session");
        Some(session_id)
    }

    pub async fn init_session(&self) -> bool {
        let flight = {
            let mut slot = lock(&self.inner.init_flight);
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let flight = async move {
                        let initialized = inner.run_init().await;
                        *lock(&inner.init_flight) = None;
                        initialized
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Returns the live session id, initializing a session first when there is none.
    pub async fn ensure_session(&self) -> ClientResult<String> {
        if let Some(session_id) = self.session_id() {
            return Ok(session_id);
        }
        if !self.init_session().await {
            return InitializationFailedSnafu {
                stage: "ensure-session",
            }
            .fail();
        }
        self.session_id().context(InitializationFailedSnafu {
            stage: "ensure-session",
        })
    }

    /// Delivers one user message. A 404 is reported through the error and left for the
    /// caller to recover from.
    pub async fn send_message(&self, text: &str) -> ClientResult<()> {
        let session_id = self.session_id().context(NoSessionSnafu {
            stage: "send-message",
        })?;
        let request = ChatRequest::new(session_id.clone(), text, self.inner.config.preset.clone());

        self.inner
            .transport
            .send_chat(request)
            .await
            .inspect_err(|error| {
                tracing::warn!(
                    session_id = %session_id,
                    status = ?error.status(),
                    error = %error,
                    "chat message delivery failed"
                );
            })
            .context(SendSnafu {
                stage: "send-message",
            })?;

        tracing::debug!(session_id = %session_id, "chat message delivered");
        Ok(())
    }

    /// Fetches session info, incrementally from the current offsets unless `full_refresh`
    /// is set or no offsets are known yet.
    pub async fn fetch_info(&self, full_refresh: bool) -> FetchOutcome {
        let flight = {
            let mut slot = lock(&self.inner.fetch_flight);
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let flight = async move {
                        let outcome = inner.run_fetch(full_refresh).await;
                        *lock(&inner.fetch_flight) = None;
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    pub fn clear_session(&self) {
        self.inner.clear_session();
    }
}

impl SessionInner {
    async fn run_init(&self) -> bool {
        let request = InitRequest {
            preset: self.config.preset.clone(),
            title: self.config.title.clone(),
        };

        let session_id = match self.transport.init_session(request).await {
            Ok(response) => response.id.filter(|id| !id.trim().is_empty()),
            Err(error) => {
                tracing::warn!(
                    transport = self.transport.name(),
                    status = ?error.status(),
                    error = %error,
                    "chat session initialization failed"
                );
                self.clear_session();
                return false;
            }
        };

        let Some(session_id) = session_id else {
            tracing::warn!(
                transport = self.transport.name(),
                "chat session initialization returned no session id"
            );
            self.clear_session();
            return false;
        };

        {
            let mut state = lock(&self.state);
            state.session_id = Some(session_id.clone());
            state.offsets = Some(SessionOffsets::default());
            state.poll_failure_count = 0;
        }
        if let Err(error) = self.persistence.save(&self.config.storage_key, &session_id) {
            tracing::warn!(
                storage_key = %self.config.storage_key,
                error = %error,
                "failed to persist session id"
            );
        }

        tracing::info!(session_id = %session_id, transport = self.transport.name(), "chat session initialized");
        true
    }

    async fn run_fetch(&self, full_refresh: bool) -> FetchOutcome {
        let (session_id, requested) = {
            let state = lock(&self.state);
            let Some(session_id) = state.session_id.clone() else {
                return FetchOutcome::NoSession;
            };
            let requested = if full_refresh { None } else { state.offsets };
            (session_id, requested)
        };

        match self.transport.fetch_info(&session_id, requested).await {
            Ok(response) => {
                lock(&self.state).poll_failure_count = 0;
                FetchOutcome::Fetched(FetchedInfo {
                    session_id,
                    requested,
                    response,
                })
            }
            Err(error) if error.is_session_expired() => {
                tracing::info!(session_id = %session_id, "chat session expired on the backend");
                if lock(&self.state).session_id.as_deref() == Some(session_id.as_str()) {
                    self.clear_session();
                }
                FetchOutcome::SessionExpired
            }
            Err(error) => {
                let failure_count = {
                    let mut state = lock(&self.state);
                    state.poll_failure_count += 1;
                    state.poll_failure_count
                };
                tracing::warn!(
                    session_id = %session_id,
                    status = ?error.status(),
                    failure_count,
                    error = %error,
                    "session info fetch failed"
                );
                FetchOutcome::Failed {
                    kind: error.kind(),
                    failure_count,
                    message: error.to_string(),
                }
            }
        }
    }

    fn clear_session(&self) {
        let previous = std::mem::take(&mut *lock(&self.state)).session_id;
        if let Err(error) = self.persistence.remove(&self.config.storage_key) {
            tracing::warn!(
                storage_key = %self.config.storage_key,
                error = %error,
                "failed to remove persisted session id"
            );
        }
        if let Some(session_id) = previous {
            tracing::info!(session_id = %session_id, "chat session cleared");
        }
    }
}
