//! Folds fetched history pages into the [`MessageStore`].

use palaver_client::{FetchedInfo, HistoryEntry, SessionOffsets};
use palaver_storage::{Anchor, DeliveryStatus, Message, MessagePatch, MessageRole, MessageStore};

use super::events::TranscriptEvent;
use super::text::{
    decode_html_entities, merge_range, normalize_role, parse_timestamp, shows_tool_placeholder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeMode {
    FullRebuild,
    Incremental,
}

/// What one reconciliation did and what should happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub mode: MergeMode,
    /// Cursor for the next incremental fetch.
    pub offsets: SessionOffsets,
    /// Keep polling while the agent is still running.
    pub running: bool,
    pub events: Vec<TranscriptEvent>,
}

/// A full rebuild is needed when explicitly asked for, or while an optimistic message has not
/// been echoed yet, because local and remote positions may then disagree.
pub fn needs_full_refresh(store: &MessageStore, forced: bool) -> bool {
    forced || store.has_local_only()
}

/// Applies `fetched` to `store`.
///
/// A fetch made without offsets rebuilds the store from scratch; any other fetch is merged
/// incrementally starting at the requested history position. `prior` is the cursor in effect
/// before the fetch and is kept when an incremental response carries no offsets.
pub fn reconcile(
    store: &mut MessageStore,
    fetched: &FetchedInfo,
    prior: Option<SessionOffsets>,
) -> Reconciliation {
    let history = &fetched.response.history;
    let running = fetched.response.is_running();
    let mut events = Vec::new();

    let (mode, derived) = match fetched.requested {
        None => {
            rebuild(store, history, &mut events);
            (MergeMode::FullRebuild, SessionOffsets::new(history.len(), 0))
        }
        Some(requested) => {
            merge(store, history, requested, &mut events);
            let derived = prior.unwrap_or_else(|| SessionOffsets::new(store.synced_count(), 0));
            (MergeMode::Incremental, derived)
        }
    };

    settle_streaming(store, running, &mut events);
    events.dedup();

    Reconciliation {
        mode,
        offsets: fetched.response.offsets.unwrap_or(derived),
        running,
        events,
    }
}

/// Clears every streaming and tool indicator, for when polling ends without the backend
/// reporting that the agent finished.
pub fn finish_streaming(store: &mut MessageStore) -> Vec<TranscriptEvent> {
    let mut events = Vec::new();
    settle_streaming(store, false, &mut events);
    events
}

fn rebuild(store: &mut MessageStore, history: &[HistoryEntry], events: &mut Vec<TranscriptEvent>) {
    // Optimistic sends and local notices survive unless the history echoes them.
    let mut unechoed = MessageStore::new();
    for message in store.messages().iter().filter(|message| message.local_only) {
        unechoed.add(message.clone());
    }

    store.clear();
    events.push(TranscriptEvent::Cleared);

    for (position, entry) in history.iter().enumerate() {
        let placeholder = shows_tool_placeholder(entry, history.get(position + 1));
        let message = message_from_entry(entry, placeholder);
        if message.is_user()
            && let Some(echoed) = unechoed.find_local_user_message(&message.content)
        {
            unechoed.remove(echoed);
        }

        let index = store.add(message);
        store.bind_history_slot(position, index);
        if placeholder {
            store.set_anchor(Anchor::ToolCall, Some(index));
        }
        events.push(TranscriptEvent::MessageAdded { index });
    }

    for message in unechoed.messages() {
        let index = store.add(message.clone());
        events.push(TranscriptEvent::MessageAdded { index });
    }
}

fn merge(
    store: &mut MessageStore,
    history: &[HistoryEntry],
    requested: SessionOffsets,
    events: &mut Vec<TranscriptEvent>,
) {
    let mut previous = requested
        .history
        .checked_sub(1)
        .and_then(|position| store.history_slot(position));

    for (step, entry) in history.iter().enumerate() {
        let position = requested.history + step;
        let placeholder = shows_tool_placeholder(entry, history.get(step + 1));
        let text_offset = if step == 0 { requested.text } else { 0 };

        let index = match store.history_slot(position) {
            Some(index) => {
                let existing = store
                    .get(index)
                    .map(Message::synced_text)
                    .unwrap_or_default();
                let raw = merge_range(existing, entry.text(), text_offset);
                store.update(
                    index,
                    MessagePatch {
                        content: Some(decode_html_entities(&raw)),
                        raw_content: Some(raw),
                        timestamp: entry.date_time.as_deref().map(|raw| parse_timestamp(Some(raw))),
                        is_tool_call: Some(entry.is_tool_call),
                        is_tool_placeholder: Some(placeholder),
                        ..MessagePatch::default()
                    },
                );
                events.push(TranscriptEvent::MessageUpdated { index });
                index
            }
            None => {
                let index = append_or_adopt(store, entry, placeholder, events);
                store.bind_history_slot(position, index);
                index
            }
        };

        let has_text = store
            .get(index)
            .is_some_and(|message| !message.content.is_empty());
        if has_text && let Some(previous) = previous {
            resolve_placeholder(store, previous, events);
        }

        if placeholder {
            store.set_anchor(Anchor::ToolCall, Some(index));
        } else if store.anchor(Anchor::ToolCall) == Some(index) {
            store.set_anchor(Anchor::ToolCall, None);
        }
        previous = Some(index);
    }
}

/// Appends `entry`, unless it is the echo of a user message this client already shows.
fn append_or_adopt(
    store: &mut MessageStore,
    entry: &HistoryEntry,
    placeholder: bool,
    events: &mut Vec<TranscriptEvent>,
) -> usize {
    let message = message_from_entry(entry, placeholder);
    let echoed = if message.is_user() {
        store.find_unsynced_user_message(&message.content)
    } else {
        None
    };

    let Some(index) = echoed else {
        let index = store.add(message);
        events.push(TranscriptEvent::MessageAdded { index });
        return index;
    };

    let timestamp = entry.date_time.as_ref().map(|_| message.timestamp);
    store.update(
        index,
        MessagePatch {
            content: Some(message.content),
            raw_content: message.raw_content,
            timestamp,
            status: Some(DeliveryStatus::Sent),
            local_only: Some(false),
            ..MessagePatch::default()
        },
    );
    events.push(TranscriptEvent::MessageUpdated { index });
    index
}

/// The tool call before `index` produced output, so its indicator goes away.
fn resolve_placeholder(store: &mut MessageStore, index: usize, events: &mut Vec<TranscriptEvent>) {
    if !store.get(index).is_some_and(|message| message.is_tool_placeholder) {
        return;
    }

    store.update(
        index,
        MessagePatch {
            is_tool_placeholder: Some(false),
            ..MessagePatch::default()
        },
    );
    if store.anchor(Anchor::ToolCall) == Some(index) {
        store.set_anchor(Anchor::ToolCall, None);
    }
    events.push(TranscriptEvent::MessageUpdated { index });
}

/// Moves the streaming flag onto the last synced agent message while running, and clears every
/// streaming and tool indicator once the agent is done.
fn settle_streaming(store: &mut MessageStore, running: bool, events: &mut Vec<TranscriptEvent>) {
    let streaming_target = store
        .messages()
        .iter()
        .rposition(|message| message.role == MessageRole::Agent && !message.local_only);
    let target = if running { streaming_target } else { None };

    let stale = store
        .messages()
        .iter()
        .enumerate()
        .filter(|(index, message)| {
            Some(*index) != target
                && (message.is_streaming_placeholder || (!running && message.is_tool_placeholder))
        })
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    for index in stale {
        store.update(
            index,
            MessagePatch {
                is_streaming_placeholder: Some(false),
                is_tool_placeholder: if running { None } else { Some(false) },
                ..MessagePatch::default()
            },
        );
        events.push(TranscriptEvent::MessageUpdated { index });
    }

    if running {
        if let Some(index) = target
            && store
                .get(index)
                .is_some_and(|message| !message.is_streaming_placeholder)
        {
            store.update(
                index,
                MessagePatch {
                    is_streaming_placeholder: Some(true),
                    ..MessagePatch::default()
                },
            );
            events.push(TranscriptEvent::MessageUpdated { index });
        }
        return;
    }

    store.set_anchor(Anchor::ToolCall, None);
    // Final flush: the last chunk is now complete.
    if let Some(index) = streaming_target {
        events.push(TranscriptEvent::MessageUpdated { index });
    }
}

fn message_from_entry(entry: &HistoryEntry, placeholder: bool) -> Message {
    let role = normalize_role(&entry.role);
    let mut message = Message::new(role, decode_html_entities(entry.text()))
        .with_raw_content(entry.text())
        .with_timestamp(parse_timestamp(entry.date_time.as_deref()));
    if role == MessageRole::User {
        message.status = Some(DeliveryStatus::Sent);
    }
    message.is_tool_call = entry.is_tool_call;
    message.is_tool_placeholder = placeholder;
    message
}

#[cfg(test)]
mod tests {
    use palaver_client::InfoResponse;
    use pretty_assertions::assert_eq;

    use super::*;

    fn fetched(requested: Option<SessionOffsets>, response: InfoResponse) -> FetchedInfo {
        FetchedInfo {
            session_id: "abc".to_string(),
            requested,
            response,
        }
    }

    fn contents(store: &MessageStore) -> Vec<&str> {
        store
            .messages()
            .iter()
            .map(|message| message.content.as_str())
            .collect()
    }

    #[test]
    fn local_only_messages_force_a_full_refresh() {
        let mut store = MessageStore::new();
        assert!(!needs_full_refresh(&store, false));
        assert!(needs_full_refresh(&store, true));

        store.add(Message::user_pending("Hi"));
        assert!(needs_full_refresh(&store, false));
    }

    #[test]
    fn full_rebuild_derives_offsets_and_normalizes_entries() {
        let mut store = MessageStore::new();
        store.add(Message::new(MessageRole::Agent, "stale"));
        let response = InfoResponse::new(vec![
            HistoryEntry::new("human", "Fish &amp; chips?")
                .with_date_time("2024-05-01T10:00:00Z"),
            HistoryEntry::agent("Sure"),
        ]);

        let outcome = reconcile(&mut store, &fetched(None, response), None);

        assert_eq!(outcome.mode, MergeMode::FullRebuild);
        assert_eq!(outcome.offsets, SessionOffsets::new(2, 0));
        assert!(!outcome.running);
        assert_eq!(contents(&store), vec!["Fish & chips?", "Sure"]);
        assert_eq!(store.messages()[0].role, MessageRole::User);
        assert_eq!(store.messages()[0].status, Some(DeliveryStatus::Sent));
        assert_eq!(store.messages()[0].timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(outcome.events[0], TranscriptEvent::Cleared);
    }

    #[test]
    fn full_rebuild_keeps_unechoed_local_messages() {
        let mut store = MessageStore::new();
        store.add(Message::user_pending("Hi"));
        store.add(Message::user_pending("Still there?"));
        store.add(Message::local_notice("Connection lost"));
        let response = InfoResponse::new(vec![HistoryEntry::user("Hi "), HistoryEntry::agent("Hello")]);

        reconcile(&mut store, &fetched(None, response), None);

        assert_eq!(contents(&store), vec!["Hi ", "Hello", "Still there?", "Connection lost"]);
        assert!(!store.messages()[0].local_only);
        assert!(store.messages()[2].local_only);
        assert_eq!(store.history_slot(1), Some(1));
        assert!(!store.is_synced(2));
    }

    #[test]
    fn placeholder_lookahead_is_one_entry() {
        let mut store = MessageStore::new();
        let waiting = InfoResponse::new(vec![HistoryEntry::tool_call(), HistoryEntry::agent("")])
            .with_running(true);

        reconcile(&mut store, &fetched(None, waiting), None);
        assert!(store.messages()[0].is_tool_placeholder);
        assert_eq!(store.anchor(Anchor::ToolCall), Some(0));

        let resolved = InfoResponse::new(vec![HistoryEntry::tool_call(), HistoryEntry::agent("hello")])
            .with_running(true);
        reconcile(&mut store, &fetched(None, resolved), None);
        assert!(!store.messages()[0].is_tool_placeholder);
        assert_eq!(store.anchor(Anchor::ToolCall), None);
    }

    #[test]
    fn streaming_continuation_appends_and_splices() {
        let mut store = MessageStore::new();
        let first = InfoResponse::new(vec![HistoryEntry::agent("Hel")])
            .with_offsets(SessionOffsets::new(0, 3))
            .with_running(true);
        let outcome = reconcile(&mut store, &fetched(Some(SessionOffsets::default()), first), None);
        assert_eq!(outcome.offsets, SessionOffsets::new(0, 3));
        assert!(store.messages()[0].is_streaming_placeholder);

        let second = InfoResponse::new(vec![HistoryEntry::agent("lo")]).with_running(false);
        let outcome = reconcile(
            &mut store,
            &fetched(Some(SessionOffsets::new(0, 3)), second.clone()),
            Some(SessionOffsets::new(0, 3)),
        );
        assert_eq!(contents(&store), vec!["Hello"]);
        assert_eq!(outcome.offsets, SessionOffsets::new(0, 3));
        assert!(!store.messages()[0].is_streaming_placeholder);

        // The same delta applied again splices instead of duplicating.
        reconcile(
            &mut store,
            &fetched(Some(SessionOffsets::new(0, 3)), second),
            Some(SessionOffsets::new(0, 3)),
        );
        assert_eq!(contents(&store), vec!["Hello"]);
    }

    #[test]
    fn text_offsets_count_raw_server_characters() {
        let mut store = MessageStore::new();
        let first = InfoResponse::new(vec![HistoryEntry::agent("a &amp; xyz")])
            .with_offsets(SessionOffsets::new(0, 11))
            .with_running(true);
        reconcile(&mut store, &fetched(Some(SessionOffsets::default()), first), None);
        assert_eq!(contents(&store), vec!["a & xyz"]);
        assert_eq!(store.messages()[0].synced_text(), "a &amp; xyz");

        // Offset 8 lands inside the raw text, so the chunk replaces its tail.
        let second = InfoResponse::new(vec![HistoryEntry::agent("XYZ")]).with_running(false);
        reconcile(
            &mut store,
            &fetched(Some(SessionOffsets::new(0, 8)), second),
            Some(SessionOffsets::new(0, 8)),
        );
        assert_eq!(contents(&store), vec!["a & XYZ"]);
        assert_eq!(store.messages()[0].synced_text(), "a &amp; XYZ");
    }

    #[test]
    fn incremental_merge_adopts_the_echo_of_a_sent_message() {
        let mut store = MessageStore::new();
        let sent = store.add(Message::user_pending("Hi"));
        store.update(
            sent,
            MessagePatch {
                status: Some(DeliveryStatus::Sent),
                local_only: Some(false),
                ..MessagePatch::default()
            },
        );
        let response = InfoResponse::new(vec![HistoryEntry::user("Hi"), HistoryEntry::agent("Hello")]);

        let outcome = reconcile(
            &mut store,
            &fetched(Some(SessionOffsets::default()), response.clone()),
            Some(SessionOffsets::default()),
        );

        assert_eq!(contents(&store), vec!["Hi", "Hello"]);
        assert_eq!(store.history_slot(0), Some(sent));
        assert_eq!(outcome.offsets, SessionOffsets::default());

        // Re-reading the same page from offset zero replaces in place.
        reconcile(
            &mut store,
            &fetched(Some(SessionOffsets::default()), response),
            Some(SessionOffsets::default()),
        );
        assert_eq!(contents(&store), vec!["Hi", "Hello"]);
    }

    #[test]
    fn incremental_merge_without_prior_offsets_counts_synced_entries() {
        let mut store = MessageStore::new();
        let response = InfoResponse::new(vec![HistoryEntry::agent("a"), HistoryEntry::agent("b")]);

        let outcome = reconcile(&mut store, &fetched(Some(SessionOffsets::default()), response), None);

        assert_eq!(outcome.mode, MergeMode::Incremental);
        assert_eq!(outcome.offsets, SessionOffsets::new(2, 0));
    }

    #[test]
    fn tool_output_clears_the_preceding_placeholder() {
        let mut store = MessageStore::new();
        let waiting = InfoResponse::new(vec![HistoryEntry::tool_call()])
            .with_offsets(SessionOffsets::new(1, 0))
            .with_running(true);
        reconcile(&mut store, &fetched(Some(SessionOffsets::default()), waiting), None);
        assert_eq!(store.anchor(Anchor::ToolCall), Some(0));

        let output = InfoResponse::new(vec![HistoryEntry::agent("Found it")]).with_running(true);
        let outcome = reconcile(
            &mut store,
            &fetched(Some(SessionOffsets::new(1, 0)), output),
            Some(SessionOffsets::new(1, 0)),
        );

        assert!(!store.messages()[0].is_tool_placeholder);
        assert_eq!(store.anchor(Anchor::ToolCall), None);
        assert!(store.messages()[1].is_streaming_placeholder);
        assert!(outcome.events.contains(&TranscriptEvent::MessageUpdated { index: 0 }));
    }

    #[test]
    fn finishing_clears_tool_and_streaming_indicators() {
        let mut store = MessageStore::new();
        let waiting = InfoResponse::new(vec![HistoryEntry::tool_call()]).with_running(true);
        reconcile(&mut store, &fetched(None, waiting), None);

        let done = InfoResponse::new(vec![HistoryEntry::tool_call()]).with_running(false);
        let outcome = reconcile(&mut store, &fetched(None, done), None);

        assert_eq!(store.anchor(Anchor::ToolCall), None);
        assert!(!store.messages()[0].is_tool_placeholder);
        assert_eq!(outcome.events.last(), Some(&TranscriptEvent::MessageUpdated { index: 0 }));
    }
}
