use super::types::{Anchor, Message, MessagePatch, MessageRole};

/// Ordered transcript log.
///
/// A message's position is its identity for the lifetime of a session. Every index the store
/// hands out through an [`Anchor`] or a history slot is owned here, so removal can shift or
/// invalidate them in the same step that shifts the messages. Out-of-range indices are ignored
/// by every operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStore {
    messages: Vec<Message>,
    rendered: Vec<bool>,
    // history position -> store index
    history_slots: Vec<Option<usize>>,
    tool_call_anchor: Option<usize>,
    typing_anchor: Option<usize>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends a message and returns its index.
    pub fn add(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.rendered.push(false);
        self.messages.len() - 1
    }

    /// Applies a partial update. Returns false when `index` is out of range.
    pub fn update(&mut self, index: usize, patch: MessagePatch) -> bool {
        let Some(message) = self.messages.get_mut(index) else {
            return false;
        };
        patch.apply_to(message);
        true
    }

    /// Removes the message at `index` and re-indexes every tracker that referenced a later
    /// position. A tracker pointing at the removed message is invalidated.
    pub fn remove(&mut self, index: usize) -> Option<Message> {
        if index >= self.messages.len() {
            return None;
        }

        let removed = self.messages.remove(index);
        self.rendered.remove(index);

        self.tool_call_anchor = shift_after_removal(self.tool_call_anchor, index);
        self.typing_anchor = shift_after_removal(self.typing_anchor, index);
        for slot in &mut self.history_slots {
            *slot = shift_after_removal(*slot, index);
        }

        Some(removed)
    }

    /// Removes every message matching `predicate` and returns the removed indices as they were
    /// before removal, in descending order.
    pub fn remove_where(&mut self, predicate: impl Fn(&Message) -> bool) -> Vec<usize> {
        let doomed = self
            .messages
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, message)| predicate(message))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();

        // Descending order keeps the not-yet-removed indices valid.
        for index in &doomed {
            self.remove(*index);
        }

        doomed
    }

    /// Drops all messages, renderer marks, history slots and anchors.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.rendered.clear();
        self.history_slots.clear();
        self.tool_call_anchor = None;
        self.typing_anchor = None;
    }

    /// Finds the first optimistic user message whose trimmed content equals `content` trimmed.
    pub fn find_local_user_message(&self, content: &str) -> Option<usize> {
        let normalized = content.trim();
        self.messages.iter().position(|message| {
            message.role == MessageRole::User
                && message.local_only
                && message.content.trim() == normalized
        })
    }

    /// Finds the first user message with matching trimmed content that no history slot maps to.
    pub fn find_unsynced_user_message(&self, content: &str) -> Option<usize> {
        let normalized = content.trim();
        self.messages
            .iter()
            .enumerate()
            .find(|(index, message)| {
                message.role == MessageRole::User
                    && message.content.trim() == normalized
                    && !self.is_synced(*index)
            })
            .map(|(index, _)| index)
    }

    pub fn has_local_only(&self) -> bool {
        self.messages.iter().any(|message| message.local_only)
    }

    pub fn mark_rendered(&mut self, index: usize, rendered: bool) {
        if let Some(mark) = self.rendered.get_mut(index) {
            *mark = rendered;
        }
    }

    /// Whether the rendering layer has painted an element for `index`.
    pub fn is_rendered(&self, index: usize) -> bool {
        self.rendered.get(index).copied().unwrap_or(false)
    }

    pub fn anchor(&self, anchor: Anchor) -> Option<usize> {
        match anchor {
            Anchor::ToolCall => self.tool_call_anchor,
            Anchor::Typing => self.typing_anchor,
        }
    }

    /// Points `anchor` at `index`, or clears it with `None`. Out-of-range indices are ignored.
    pub fn set_anchor(&mut self, anchor: Anchor, index: Option<usize>) {
        if index.is_some_and(|index| index >= self.messages.len()) {
            return;
        }

        match anchor {
            Anchor::ToolCall => self.tool_call_anchor = index,
            Anchor::Typing => self.typing_anchor = index,
        }
    }

    /// Store index holding the message for history position `position`.
    pub fn history_slot(&self, position: usize) -> Option<usize> {
        self.history_slots.get(position).copied().flatten()
    }

    /// Records that history position `position` is displayed by the message at `index`.
    pub fn bind_history_slot(&mut self, position: usize, index: usize) {
        if index >= self.messages.len() {
            return;
        }
        if self.history_slots.len() <= position {
            self.history_slots.resize(position + 1, None);
        }
        self.history_slots[position] = Some(index);
    }

    /// Number of history positions that currently map to a stored message.
    pub fn synced_count(&self) -> usize {
        self.history_slots.iter().flatten().count()
    }

    pub fn is_synced(&self, index: usize) -> bool {
        self.history_slots.contains(&Some(index))
    }
}

fn shift_after_removal(tracked: Option<usize>, removed: usize) -> Option<usize> {
    match tracked {
        Some(index) if index == removed => None,
        Some(index) if index > removed => Some(index - 1),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::DeliveryStatus;

    fn agent(content: &str) -> Message {
        Message::new(MessageRole::Agent, content)
    }

    #[test]
    fn removal_shifts_later_anchors_and_invalidates_exact_match() {
        let mut store = MessageStore::new();
        for index in 0..5 {
            store.add(agent(&format!("m{index}")));
        }
        store.set_anchor(Anchor::ToolCall, Some(4));
        store.set_anchor(Anchor::Typing, Some(2));
        store.bind_history_slot(0, 1);
        store.bind_history_slot(1, 2);
        store.bind_history_slot(2, 3);

        store.remove(2);

        assert_eq!(store.count(), 4);
        assert_eq!(store.anchor(Anchor::ToolCall), Some(3));
        assert_eq!(store.anchor(Anchor::Typing), None);
        assert_eq!(store.history_slot(0), Some(1));
        assert_eq!(store.history_slot(1), None);
        assert_eq!(store.history_slot(2), Some(2));
        assert_eq!(store.get(2).map(|message| message.content.as_str()), Some("m3"));
    }

    #[test]
    fn anchors_before_the_removed_index_stay_put() {
        let mut store = MessageStore::new();
        store.add(agent("a"));
        store.add(agent("b"));
        store.set_anchor(Anchor::ToolCall, Some(0));

        store.remove(1);

        assert_eq!(store.anchor(Anchor::ToolCall), Some(0));
    }

    #[test]
    fn out_of_range_operations_are_no_ops() {
        let mut store = MessageStore::new();
        store.add(agent("only"));

        assert!(!store.update(7, MessagePatch::content("nope")));
        assert_eq!(store.remove(3), None);
        store.set_anchor(Anchor::ToolCall, Some(9));
        store.bind_history_slot(0, 9);
        store.mark_rendered(4, true);

        assert_eq!(store.count(), 1);
        assert_eq!(store.anchor(Anchor::ToolCall), None);
        assert_eq!(store.history_slot(0), None);
        assert!(!store.is_rendered(4));
    }

    #[test]
    fn find_local_user_message_matches_trimmed_local_users_only() {
        let mut store = MessageStore::new();
        store.add(agent("Hi"));
        store.add(Message::new(MessageRole::User, "Hi"));
        let local = store.add(Message::user_pending("  Hi \n"));

        assert_eq!(store.find_local_user_message("Hi"), Some(local));
        assert_eq!(store.find_local_user_message("Hello"), None);
    }

    #[test]
    fn unsynced_lookup_skips_messages_bound_to_history() {
        let mut store = MessageStore::new();
        let first = store.add(Message::new(MessageRole::User, "again"));
        let second = store.add(Message::new(MessageRole::User, "again"));
        store.bind_history_slot(0, first);

        assert_eq!(store.find_unsynced_user_message("again"), Some(second));
        assert_eq!(store.synced_count(), 1);
    }

    #[test]
    fn remove_where_drops_failed_users_and_keeps_trackers_consistent() {
        let mut store = MessageStore::new();
        store.add(Message::user_pending("lost"));
        store.update(0, MessagePatch::status(DeliveryStatus::Failed));
        store.add(Message::local_notice("connection lost"));
        let kept = store.add(agent("kept"));
        store.set_anchor(Anchor::ToolCall, Some(kept));

        let removed = store.remove_where(|message| message.is_failed() || message.is_local_notice());

        assert_eq!(removed, vec![1, 0]);
        assert_eq!(store.count(), 1);
        assert_eq!(store.anchor(Anchor::ToolCall), Some(0));
        assert!(!store.has_local_only());
    }

    #[test]
    fn clear_resets_every_tracker() {
        let mut store = MessageStore::new();
        let index = store.add(agent("x"));
        store.set_anchor(Anchor::Typing, Some(index));
        store.bind_history_slot(0, index);
        store.mark_rendered(index, true);

        store.clear();

        assert!(store.is_empty());
        assert_eq!(store.anchor(Anchor::Typing), None);
        assert_eq!(store.synced_count(), 0);
        assert!(!store.is_rendered(0));
    }
}
