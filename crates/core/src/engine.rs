use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use palaver_client::{FetchOutcome, FetchedInfo, SessionClient, SessionOffsets};
use palaver_storage::{Anchor, DeliveryStatus, Message, MessagePatch, MessageRole, MessageStore};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;

use super::config::EngineConfig;
use super::error::{
    DeliverySnafu, EmptyMessageSnafu, EngineResult, SendUnavailableSnafu, SessionSnafu,
};
use super::events::{EngineStatus, SendAvailability, StopReason, TranscriptEvent};
use super::reconciler::{MergeMode, finish_streaming, needs_full_refresh, reconcile};
use super::scheduler::PollScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consent {
    NotRequired,
    Pending,
    Granted,
    Declined,
}

impl Consent {
    fn initial(config: &EngineConfig) -> Self {
        if config.require_privacy_consent {
            Self::Pending
        } else {
            Self::NotRequired
        }
    }
}

struct EngineState {
    store: MessageStore,
    awaiting_agent: bool,
    consent: Consent,
    force_full_refresh: bool,
}

impl EngineState {
    fn availability(&self) -> SendAvailability {
        match self.consent {
            Consent::Declined => SendAvailability::Terminated,
            Consent::Pending => SendAvailability::ConsentPending,
            Consent::NotRequired | Consent::Granted if self.awaiting_agent => {
                SendAvailability::AwaitingAgent
            }
            Consent::NotRequired | Consent::Granted => SendAvailability::Ready,
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            awaiting_agent: self.awaiting_agent,
            availability: self.availability(),
            tool_call_anchor: self.store.anchor(Anchor::ToolCall),
            typing_anchor: self.store.anchor(Anchor::Typing),
        }
    }

    /// The typing indicator follows the last message while a reply is expected and no agent
    /// text is showing yet.
    fn refresh_typing_anchor(&mut self) {
        let target = self
            .store
            .last()
            .filter(|last| {
                self.awaiting_agent && !(last.role == MessageRole::Agent && !last.content.is_empty())
            })
            .map(|_| self.store.count() - 1);
        self.store.set_anchor(Anchor::Typing, target);
    }

    /// Latest optimistic copy of `text` that is still waiting for delivery.
    fn pending_index(&self, text: &str) -> Option<usize> {
        self.store.messages().iter().rposition(|message| {
            message.is_user()
                && message.local_only
                && message.status == Some(DeliveryStatus::Pending)
                && message.content.trim() == text
        })
    }
}

struct EngineInner {
    config: EngineConfig,
    client: SessionClient,
    scheduler: PollScheduler,
    state: Mutex<EngineState>,
    refresh_flight: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    events: mpsc::UnboundedSender<TranscriptEvent>,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TranscriptEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = TranscriptEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

/// Keeps a local transcript in sync with a remote chat session.
///
/// The engine owns the [`MessageStore`], inserts optimistic user messages, drives polling, and
/// folds every fetched history page into the store. Rendering layers read snapshots and follow
/// the [`TranscriptEvent`] channel returned by [`ChatEngine::new`]. Clones share one engine.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn new(
        config: EngineConfig,
        client: SessionClient,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptEvent>) {
        let config = config.normalized();
        let (events, receiver) = mpsc::unbounded_channel();
        let state = EngineState {
            store: MessageStore::new(),
            awaiting_agent: false,
            consent: Consent::initial(&config),
            force_full_refresh: false,
        };
        let engine = Self {
            inner: Arc::new(EngineInner {
                scheduler: PollScheduler::new(client.config().poll_interval()),
                config,
                client,
                state: Mutex::new(state),
                refresh_flight: Mutex::new(None),
                events,
            }),
        };
        (engine, receiver)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &SessionClient {
        &self.inner.client
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state().store.messages().to_vec()
    }

    pub fn message(&self, index: usize) -> Option<Message> {
        self.inner.state().store.get(index).cloned()
    }

    pub fn message_count(&self) -> usize {
        self.inner.state().store.count()
    }

    /// Runs `read` against the store without copying it.
    pub fn with_store<R>(&self, read: impl FnOnce(&MessageStore) -> R) -> R {
        read(&self.inner.state().store)
    }

    pub fn tool_call_anchor(&self) -> Option<usize> {
        self.inner.state().store.anchor(Anchor::ToolCall)
    }

    pub fn typing_anchor(&self) -> Option<usize> {
        self.inner.state().store.anchor(Anchor::Typing)
    }

    pub fn is_awaiting_agent(&self) -> bool {
        self.inner.state().awaiting_agent
    }

    pub fn send_availability(&self) -> SendAvailability {
        self.inner.state().availability()
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.state().status()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.scheduler.is_armed()
    }

    pub fn mark_rendered(&self, index: usize, rendered: bool) {
        self.inner.state().store.mark_rendered(index, rendered);
    }

    pub fn is_rendered(&self, index: usize) -> bool {
        self.inner.state().store.is_rendered(index)
    }

    pub fn grant_consent(&self) {
        let status = {
            let mut state = self.inner.state();
            if state.consent != Consent::Pending {
                return;
            }
            state.consent = Consent::Granted;
            state.status()
        };
        tracing::info!("privacy consent granted");
        self.inner.emit(TranscriptEvent::StateChanged(status));
    }

    /// Ends the conversation until [`ChatEngine::reset`].
    pub fn decline_consent(&self) {
        let events = {
            let mut state = self.inner.state();
            let mut events = finish_streaming(&mut state.store);
            state.consent = Consent::Declined;
            state.awaiting_agent = false;
            state.refresh_typing_anchor();
            events.push(TranscriptEvent::StateChanged(state.status()));
            events
        };
        tracing::info!("privacy consent declined, conversation terminated");
        self.stop_polling();
        self.inner.emit_all(events);
    }

    /// Restores a persisted session and loads its full transcript. Returns whether a session
    /// is live afterwards.
    pub async fn resume(&self) -> bool {
        if self.inner.client.load_persisted_session().is_none() {
            return false;
        }
        self.inner.state().force_full_refresh = true;
        self.refresh().await;
        self.inner.client.has_session()
    }

    /// Forgets the session and the transcript and starts over with a fresh consent prompt.
    pub fn reset(&self) {
        let was_polling = self.inner.scheduler.stop();
        self.inner.client.clear_session();
        let status = {
            let mut state = self.inner.state();
            state.store.clear();
            state.awaiting_agent = false;
            state.force_full_refresh = false;
            state.consent = Consent::initial(&self.inner.config);
            state.status()
        };
        tracing::info!("conversation reset");

        self.inner.emit(TranscriptEvent::Cleared);
        if was_polling {
            self.inner.emit(TranscriptEvent::PollingStopped {
                reason: StopReason::Cancelled,
            });
        }
        self.inner.emit(TranscriptEvent::StateChanged(status));
    }

    /// Cancels the pending poll. A fetch that is already running still completes and is
    /// applied, but does not re-arm the timer.
    pub fn stop_polling(&self) {
        if self.inner.scheduler.stop() {
            tracing::debug!("polling stopped");
            self.inner.emit(TranscriptEvent::PollingStopped {
                reason: StopReason::Cancelled,
            });
        }
    }

    /// Sends one user message.
    ///
    /// The message shows up immediately as pending. It is marked failed when no session can
    /// be established or delivery fails; a failed message is never retried automatically.
    pub async fn send(&self, text: &str) -> EngineResult<()> {
        let text = text.trim();
        ensure!(
            !text.is_empty(),
            EmptyMessageSnafu {
                stage: "send-message",
            }
        );

        let events = {
            let mut state = self.inner.state();
            let availability = state.availability();
            ensure!(
                availability.is_ready(),
                SendUnavailableSnafu {
                    stage: "send-message",
                    availability,
                }
            );
            let index = state.store.add(Message::user_pending(text));
            state.awaiting_agent = true;
            state.refresh_typing_anchor();
            [
                TranscriptEvent::MessageAdded { index },
                TranscriptEvent::StateChanged(state.status()),
            ]
        };
        self.inner.emit_all(events);

        if let Err(error) = self
            .inner
            .client
            .ensure_session()
            .await
            .context(SessionSnafu {
                stage: "send-init-session",
            })
        {
            tracing::warn!(error = %error, "no chat session for outgoing message");
            self.mark_failed(text);
            return Err(error);
        }

        match self.inner.client.send_message(text).await {
            Ok(()) => {
                self.confirm_delivery(text);
                self.schedule_poll(Some(Duration::ZERO));
                Ok(())
            }
            Err(source) => {
                let expired = source.is_session_expired();
                self.mark_failed(text);
                if expired {
                    self.recover_session(true).await;
                }
                Err(source).context(DeliverySnafu {
                    stage: "send-message",
                })
            }
        }
    }

    /// Fetches and applies session info once. Concurrent callers share the same fetch.
    pub async fn refresh(&self) {
        let flight = {
            let mut slot = self
                .inner
                .refresh_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let engine = Arc::downgrade(&self.inner);
                    let flight = async move {
                        run_refresh(&engine).await;
                        if let Some(inner) = engine.upgrade() {
                            *inner
                                .refresh_flight
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner) = None;
                        }
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

    fn apply_fetched(&self, fetched: FetchedInfo, prior: Option<SessionOffsets>, epoch: u64) {
        if self.inner.client.session_id().as_deref() != Some(fetched.session_id.as_str()) {
            tracing::debug!(session_id = %fetched.session_id, "ignoring info of a replaced session");
            return;
        }

        let (reconciliation, status) = {
            let mut state = self.inner.state();
            let reconciliation = reconcile(&mut state.store, &fetched, prior);
            if reconciliation.mode == MergeMode::FullRebuild {
                state.force_full_refresh = false;
            }
            state.awaiting_agent = reconciliation.running && state.consent != Consent::Declined;
            state.refresh_typing_anchor();
            (reconciliation, state.status())
        };
        self.inner.client.set_offsets(reconciliation.offsets);
        tracing::debug!(
            session_id = %fetched.session_id,
            mode = ?reconciliation.mode,
            offset_history = reconciliation.offsets.history,
            offset_text = reconciliation.offsets.text,
            running = reconciliation.running,
            "session info applied"
        );

        self.inner.emit_all(reconciliation.events);
        self.inner.emit(TranscriptEvent::StateChanged(status));

        if status.awaiting_agent {
            self.resume_poll(epoch);
        } else {
            self.inner.scheduler.stop();
            self.inner.emit(TranscriptEvent::PollingStopped {
                reason: StopReason::Idle,
            });
        }
    }

    fn handle_fetch_failure(&self, failure_count: u32, epoch: u64) {
        if failure_count < self.inner.config.max_poll_failures {
            self.resume_poll(epoch);
            return;
        }

        self.inner.scheduler.stop();
        let events = {
            let mut state = self.inner.state();
            let mut events = finish_streaming(&mut state.store);
            let notice = Message::local_notice(self.inner.config.texts.connection_lost.clone());
            let index = state.store.add(notice);
            state.awaiting_agent = false;
            state.refresh_typing_anchor();
            events.extend([
                TranscriptEvent::MessageAdded { index },
                TranscriptEvent::StateChanged(state.status()),
                TranscriptEvent::PollingStopped {
                    reason: StopReason::FailureCeiling,
                },
            ]);
            events
        };
        tracing::warn!(failure_count, "polling stopped after repeated fetch failures");
        self.inner.emit_all(events);
    }

    fn halt(&self, reason: StopReason) {
        self.inner.scheduler.stop();
        let events = {
            let mut state = self.inner.state();
            let mut events = finish_streaming(&mut state.store);
            state.awaiting_agent = false;
            state.refresh_typing_anchor();
            events.push(TranscriptEvent::StateChanged(state.status()));
            events.push(TranscriptEvent::PollingStopped { reason });
            events
        };
        tracing::debug!(?reason, "polling halted");
        self.inner.emit_all(events);
    }

    /// Drops the expired session and its transcript, then silently opens a new session.
    /// With `keep_failed`, failed user messages stay visible so they can be resent by hand.
    async fn recover_session(&self, keep_failed: bool) {
        let client = self.expire_session(keep_failed);
        reinitialize_session(&client).await;
    }

    fn expire_session(&self, keep_failed: bool) -> SessionClient {
        self.inner.scheduler.stop();
        self.inner.client.clear_session();

        let events = {
            let mut state = self.inner.state();
            let kept = if keep_failed {
                state
                    .store
                    .messages()
                    .iter()
                    .filter(|message| message.is_user() && message.is_failed())
                    .cloned()
                    .collect::<Vec<_>>()
            } else {
                Vec::new()
            };

            state.store.clear();
            let mut events = vec![TranscriptEvent::Cleared];
            for message in kept {
                let index = state.store.add(message);
                events.push(TranscriptEvent::MessageAdded { index });
            }
            state.awaiting_agent = false;
            state.force_full_refresh = true;
            state.refresh_typing_anchor();
            events.push(TranscriptEvent::StateChanged(state.status()));
            events.push(TranscriptEvent::PollingStopped {
                reason: StopReason::SessionExpired,
            });
            events
        };
        self.inner.emit_all(events);
        self.inner.client.clone()
    }

    fn confirm_delivery(&self, text: &str) {
        let events = {
            let mut state = self.inner.state();
            let mut events = Vec::new();
            if let Some(index) = state.pending_index(text) {
                state.store.update(
                    index,
                    MessagePatch {
                        status: Some(DeliveryStatus::Sent),
                        local_only: Some(false),
                        ..MessagePatch::default()
                    },
                );
                events.push(TranscriptEvent::MessageUpdated { index });
            }

            // Earlier abandoned attempts and surfaced errors are obsolete now.
            let removed = state.store.remove_where(|message| {
                (message.is_user() && message.is_failed()) || message.is_local_notice()
            });
            events.extend(
                removed
                    .into_iter()
                    .map(|index| TranscriptEvent::MessageRemoved { index }),
            );
            state.refresh_typing_anchor();
            events.push(TranscriptEvent::StateChanged(state.status()));
            events
        };
        self.inner.emit_all(events);
    }

    fn mark_failed(&self, text: &str) {
        let events = {
            let mut state = self.inner.state();
            let mut events = Vec::new();
            if let Some(index) = state.pending_index(text) {
                state
                    .store
                    .update(index, MessagePatch::status(DeliveryStatus::Failed));
                events.push(TranscriptEvent::MessageUpdated { index });
            }
            state.awaiting_agent = false;
            state.refresh_typing_anchor();
            events.push(TranscriptEvent::StateChanged(state.status()));
            events
        };
        self.inner.emit_all(events);
    }

    fn schedule_poll(&self, delay: Option<Duration>) {
        self.inner.scheduler.schedule_next(delay, self.poll_tick());
    }

    /// Re-arms polling after a fetch that started at `epoch`, unless polling was stopped
    /// while it was running.
    fn resume_poll(&self, epoch: u64) {
        if !self
            .inner
            .scheduler
            .schedule_next_since(epoch, None, self.poll_tick())
        {
            tracing::debug!("polling was stopped during the fetch, not rescheduling");
        }
    }

    fn poll_tick(&self) -> impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static {
        let engine = Arc::downgrade(&self.inner);
        move || {
            async move {
                if let Some(inner) = engine.upgrade() {
                    ChatEngine { inner }.refresh().await;
                }
            }
            .boxed()
        }
    }
}

/// One fetch-and-apply cycle. Only a weak handle is held while the request is in flight, so
/// an abandoned refresh never keeps the engine alive.
async fn run_refresh(engine: &Weak<EngineInner>) {
    let Some((client, full_refresh, prior, epoch)) = engine.upgrade().map(|inner| {
        let full_refresh = {
            let state = inner.state();
            needs_full_refresh(&state.store, state.force_full_refresh)
        };
        (
            inner.client.clone(),
            full_refresh,
            inner.client.offsets(),
            inner.scheduler.epoch(),
        )
    }) else {
        return;
    };

    let outcome = client.fetch_info(full_refresh).await;
    let Some(inner) = engine.upgrade() else {
        return;
    };
    let engine = ChatEngine { inner };

    match outcome {
        FetchOutcome::Fetched(fetched) => engine.apply_fetched(fetched, prior, epoch),
        FetchOutcome::NoSession => engine.halt(StopReason::NoSession),
        FetchOutcome::SessionExpired => {
            let client = engine.expire_session(false);
            drop(engine);
            reinitialize_session(&client).await;
        }
        FetchOutcome::Failed { failure_count, .. } => {
            engine.handle_fetch_failure(failure_count, epoch)
        }
    }
}

async fn reinitialize_session(client: &SessionClient) {
    if client.init_session().await {
        tracing::info!(
            session_id = ?client.session_id(),
            "chat session recreated after expiry"
        );
    } else {
        tracing::warn!("chat session could not be recreated after expiry");
    }
}
