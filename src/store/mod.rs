//! Per-conversation message buffers.
//!
//! Every transport feeds the same mutation API: live push events, poll
//! catch-ups, and pagination fetches all merge here. Each operation re-sorts
//! the batch it was handed and dedupes by id, so callers never need to know
//! what else is in flight.

use std::collections::HashMap;
use std::collections::HashSet;

use parking_lot::Mutex;

use crate::model::{ConversationId, Message, MessageId};

/// Fetch page length used by pagination calls. A shorter page proves the
/// history direction is exhausted.
pub const PAGE_SIZE: usize = 20;

/// Retention bound per conversation. Exceeding it trims the oldest entries.
pub const MAX_BUFFER_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationDirection {
    Older,
    Newer,
}

/// Bounded, ordered, deduplicated window over one conversation's messages.
///
/// Invariants, upheld by every [`MessageStore`] mutation:
/// - `messages` is non-decreasing by `created_at` (stable across merges);
/// - no two entries share an id;
/// - `messages.len()` never exceeds the store's retention bound;
/// - boundary ids mirror the first/last entries, `None` iff empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBuffer {
    pub messages: Vec<Message>,
    pub has_older_messages: bool,
    pub has_newer_messages: bool,
    pub is_loading_older: bool,
    pub is_loading_newer: bool,
    pub oldest_message_id: Option<MessageId>,
    pub newest_message_id: Option<MessageId>,
}

impl MessageBuffer {
    fn refresh_bounds(&mut self) {
        self.oldest_message_id = self.messages.first().map(|m| m.id);
        self.newest_message_id = self.messages.last().map(|m| m.id);
    }

    fn contains(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Sort key for merges. `sort_by_key` is stable, so ties keep their
    /// pre-merge relative order.
    fn sort(&mut self) {
        self.messages.sort_by_key(|m| m.created_at);
    }

    /// Drop the oldest entries down to `max`. Returns whether anything was
    /// dropped.
    fn trim_front(&mut self, max: usize) -> bool {
        if self.messages.len() > max {
            let excess = self.messages.len() - max;
            self.messages.drain(0..excess);
            true
        } else {
            false
        }
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

/// The shared map of conversation id to buffer. Created once per session and
/// handed by reference to the router, the poller, and the UI layer; all
/// access goes through these operations.
pub struct MessageStore {
    buffers: Mutex<HashMap<ConversationId, MessageBuffer>>,
    max_buffer_size: usize,
    page_size: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::with_limits(MAX_BUFFER_SIZE, PAGE_SIZE)
    }

    /// Override the retention bound and page length. Exists for tests and
    /// embedders that need a smaller retention window.
    pub fn with_limits(max_buffer_size: usize, page_size: usize) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            max_buffer_size: max_buffer_size.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Seed the buffer for a conversation from an initial history fetch,
    /// replacing whatever was there. Until a backward fetch proves
    /// otherwise, a non-empty seed conservatively assumes more history
    /// exists.
    pub fn initialize_buffer(&self, conversation_id: ConversationId, initial: Vec<Message>) {
        let mut buffer = MessageBuffer {
            messages: dedupe_sorted(initial),
            has_older_messages: false,
            has_newer_messages: false,
            ..MessageBuffer::default()
        };
        buffer.has_older_messages = !buffer.messages.is_empty();
        buffer.trim_front(self.max_buffer_size);
        buffer.refresh_bounds();
        self.buffers.lock().insert(conversation_id, buffer);
    }

    /// Merge a backward-pagination batch. A short page (fewer than
    /// `page_size` entries) proves history is exhausted; trimming re-opens
    /// it, since the dropped entries sit beyond the window again.
    pub fn add_older_messages(&self, conversation_id: ConversationId, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        let fetched = batch.len();
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(conversation_id).or_default();
        let fresh = without_known_ids(batch, buffer);
        let mut merged = dedupe_sorted(fresh);
        merged.append(&mut buffer.messages);
        buffer.messages = merged;
        buffer.sort();
        let trimmed = buffer.trim_front(self.max_buffer_size);
        buffer.has_older_messages = fetched >= self.page_size || trimmed;
        buffer.refresh_bounds();
    }

    /// Merge a forward batch (poll catch-up or forward pagination). Trimming
    /// pushes history out of the window, so it re-arms `has_older_messages`;
    /// a full page suggests more may still be pending on the newer side.
    pub fn add_newer_messages(&self, conversation_id: ConversationId, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        let fetched = batch.len();
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(conversation_id).or_default();
        let fresh = without_known_ids(batch, buffer);
        buffer.messages.extend(dedupe_sorted(fresh));
        buffer.sort();
        if buffer.trim_front(self.max_buffer_size) {
            buffer.has_older_messages = true;
        }
        buffer.has_newer_messages = fetched >= self.page_size;
        buffer.refresh_bounds();
    }

    /// Ingest a single live event. Idempotent: a duplicate delivery (push
    /// racing a poll, or the channel replaying a frame) is a no-op.
    pub fn add_new_message(&self, conversation_id: ConversationId, message: Message) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(conversation_id).or_default();
        if buffer.contains(message.id) {
            return;
        }
        buffer.messages.push(message);
        buffer.sort();
        if buffer.trim_front(self.max_buffer_size) {
            buffer.has_older_messages = true;
        }
        buffer.refresh_bounds();
    }

    /// Replace the buffered message with the same id. An update for a
    /// message we never buffered is dropped, not synthesized into an insert.
    pub fn update_message(&self, conversation_id: ConversationId, updated: Message) {
        let mut buffers = self.buffers.lock();
        let Some(buffer) = buffers.get_mut(&conversation_id) else {
            return;
        };
        let Some(slot) = buffer.messages.iter_mut().find(|m| m.id == updated.id) else {
            return;
        };
        *slot = updated;
        // An update payload should not move the sort key, but re-sorting
        // keeps the ordering invariant even if it does.
        buffer.sort();
        buffer.refresh_bounds();
    }

    /// Snapshot of the buffer, or a well-defined empty buffer when none
    /// exists. Never panics, never returns a partial view.
    pub fn get_buffer(&self, conversation_id: ConversationId) -> MessageBuffer {
        self.buffers
            .lock()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_buffer(&self, conversation_id: ConversationId) {
        self.buffers.lock().remove(&conversation_id);
    }

    /// Drop every buffer. Logout / session-end path.
    pub fn clear_all(&self) {
        self.buffers.lock().clear();
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.buffers.lock().keys().copied().collect()
    }

    /// Record that a pagination fetch is outstanding in the given direction.
    /// The store only keeps the flag; the paginator owns the guard.
    pub fn set_loading_state(
        &self,
        conversation_id: ConversationId,
        direction: PaginationDirection,
        loading: bool,
    ) {
        let mut buffers = self.buffers.lock();
        let Some(buffer) = buffers.get_mut(&conversation_id) else {
            return;
        };
        match direction {
            PaginationDirection::Older => buffer.is_loading_older = loading,
            PaginationDirection::Newer => buffer.is_loading_newer = loading,
        }
    }

    pub fn update_has_older_messages(&self, conversation_id: ConversationId, value: bool) {
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers.get_mut(&conversation_id) {
            buffer.has_older_messages = value;
        }
    }
}

/// Stable-sort a batch by `created_at` and drop duplicate ids within it,
/// keeping the first occurrence.
fn dedupe_sorted(mut batch: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(batch.len());
    batch.retain(|m| seen.insert(m.id));
    batch.sort_by_key(|m| m.created_at);
    batch
}

/// Drop batch entries whose id is already buffered.
fn without_known_ids(batch: Vec<Message>, buffer: &MessageBuffer) -> Vec<Message> {
    let known: HashSet<MessageId> = buffer.messages.iter().map(|m| m.id).collect();
    batch.into_iter().filter(|m| !known.contains(&m.id)).collect()
}
