//! Classifies inbound push frames and dispatches them.
//!
//! Message events land in the buffer directly (the buffer is the rendered,
//! latency-critical structure); everything else only signals collaborators
//! to refresh their caches over a normal fetch.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::ConversationId;
use crate::protocol::{
    EventEnvelope, EventKind, InboundFrame, classify, conversation_id_of, message_from_event,
};
use crate::store::MessageStore;

/// Cache keys the router can ask collaborators to refresh. The router never
/// owns or reads these caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey {
    Conversations,
    ConversationsMeta,
    Messages(ConversationId),
}

/// Collaborator seam for cache refresh signals.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: CacheKey);
}

/// No-op invalidator for embedders without list caches.
pub struct NullInvalidator;

impl CacheInvalidator for NullInvalidator {
    fn invalidate(&self, _key: CacheKey) {}
}

/// Typing/presence signals. Forwarded only; never persisted.
#[derive(Debug, Clone)]
pub enum EphemeralSignal {
    TypingOn { conversation_id: Option<ConversationId> },
    TypingOff { conversation_id: Option<ConversationId> },
    Presence { data: Value },
}

/// Which conversation the console currently has open. Shared between the
/// supervisor (resubscribe on switch) and the router (buffer routing).
#[derive(Clone, Default)]
pub struct ActiveConversation(Arc<Mutex<Option<ConversationId>>>);

impl ActiveConversation {
    pub fn set(&self, id: Option<ConversationId>) {
        *self.0.lock() = id;
    }

    pub fn get(&self) -> Option<ConversationId> {
        *self.0.lock()
    }
}

pub struct EventRouter {
    store: Arc<MessageStore>,
    invalidator: Arc<dyn CacheInvalidator>,
    active: ActiveConversation,
    ephemeral_tx: Option<mpsc::UnboundedSender<EphemeralSignal>>,
}

impl EventRouter {
    pub fn new(
        store: Arc<MessageStore>,
        invalidator: Arc<dyn CacheInvalidator>,
        active: ActiveConversation,
    ) -> Self {
        Self {
            store,
            invalidator,
            active,
            ephemeral_tx: None,
        }
    }

    /// Attach a listener for typing/presence signals.
    pub fn ephemeral_listener(&mut self) -> mpsc::UnboundedReceiver<EphemeralSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ephemeral_tx = Some(tx);
        rx
    }

    /// Route one raw text frame. Malformed frames are logged and dropped;
    /// the connection stays up.
    pub fn route_text(&self, raw: &str) {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.route(&value),
            Err(err) => warn!(error = %err, "dropping malformed push frame"),
        }
    }

    pub fn route(&self, frame: &Value) {
        match classify(frame) {
            InboundFrame::Ping => {}
            InboundFrame::Welcome | InboundFrame::ConfirmSubscription => {
                debug!("push channel lifecycle ack");
            }
            InboundFrame::Unhandled => {}
            InboundFrame::Event(envelope) => self.dispatch(envelope),
        }
    }

    fn dispatch(&self, envelope: EventEnvelope) {
        let conversation = conversation_id_of(&envelope.data);
        match envelope.kind {
            EventKind::MessageCreated => {
                match message_from_event(&envelope.data) {
                    Some(message) => {
                        let conversation_id = conversation.unwrap_or(message.conversation_id);
                        if self.active.get() == Some(conversation_id) {
                            self.store.add_new_message(conversation_id, message);
                        }
                    }
                    None => warn!("message.created event with undecodable payload"),
                }
                // A new message reorders the list and bumps unread counts
                // even when its conversation is off-screen.
                self.invalidator.invalidate(CacheKey::Conversations);
                self.invalidator.invalidate(CacheKey::ConversationsMeta);
            }
            EventKind::MessageUpdated => {
                if let Some(message) = message_from_event(&envelope.data) {
                    let conversation_id = conversation.unwrap_or(message.conversation_id);
                    if self.active.get() == Some(conversation_id) {
                        self.store.update_message(conversation_id, message);
                    }
                }
            }
            EventKind::ConversationCreated
            | EventKind::ConversationUpdated
            | EventKind::ConversationStatusChanged
            | EventKind::AssigneeChanged
            | EventKind::ContactCreated
            | EventKind::ContactUpdated => {
                self.invalidator.invalidate(CacheKey::Conversations);
                self.invalidator.invalidate(CacheKey::ConversationsMeta);
                if let Some(conversation_id) = conversation {
                    if self.active.get() == Some(conversation_id)
                        && payload_touches_messages(&envelope.data)
                    {
                        self.invalidator.invalidate(CacheKey::Messages(conversation_id));
                    }
                }
            }
            EventKind::TypingOn => {
                self.forward(EphemeralSignal::TypingOn {
                    conversation_id: conversation,
                });
            }
            EventKind::TypingOff => {
                self.forward(EphemeralSignal::TypingOff {
                    conversation_id: conversation,
                });
            }
            EventKind::PresenceUpdate => {
                self.forward(EphemeralSignal::Presence {
                    data: envelope.data,
                });
            }
            EventKind::Unknown => {
                debug!(kind = %envelope.raw_kind, "unrecognized push event kind");
                if envelope.raw_kind.contains("message") {
                    // An unknown message-ish kind may still have changed
                    // list ordering; refresh rather than drop silently.
                    self.invalidator.invalidate(CacheKey::Conversations);
                }
            }
        }
    }

    fn forward(&self, signal: EphemeralSignal) {
        if let Some(tx) = &self.ephemeral_tx {
            let _ = tx.send(signal);
        }
    }
}

/// Whether a conversation payload suggests its message content changed.
fn payload_touches_messages(data: &Value) -> bool {
    data.get("messages").is_some_and(|m| !m.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingInvalidator {
        keys: Mutex<Vec<CacheKey>>,
    }

    impl RecordingInvalidator {
        fn keys(&self) -> Vec<CacheKey> {
            self.keys.lock().clone()
        }
    }

    impl CacheInvalidator for RecordingInvalidator {
        fn invalidate(&self, key: CacheKey) {
            self.keys.lock().push(key);
        }
    }

    fn setup(open: Option<ConversationId>) -> (Arc<MessageStore>, Arc<RecordingInvalidator>, EventRouter) {
        let store = Arc::new(MessageStore::new());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let active = ActiveConversation::default();
        active.set(open);
        let router = EventRouter::new(store.clone(), invalidator.clone(), active);
        (store, invalidator, router)
    }

    fn created_frame(id: i64, created_at: i64, conversation_id: i64) -> Value {
        json!({
            "message": {
                "event": "message.created",
                "data": {
                    "id": id,
                    "created_at": created_at,
                    "conversation_id": conversation_id,
                    "content": "hello"
                }
            }
        })
    }

    #[test]
    fn live_message_lands_in_the_open_conversation_buffer() {
        let (store, invalidator, router) = setup(Some(42));
        store.initialize_buffer(
            42,
            vec![
                Message::new(1, 42, 100),
                Message::new(2, 42, 200),
                Message::new(3, 42, 300),
            ],
        );

        router.route(&created_frame(4, 400, 42));

        let buffer = store.get_buffer(42);
        let ids: Vec<i64> = buffer.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(buffer.newest_message_id, Some(4));
        assert_eq!(
            invalidator.keys(),
            vec![CacheKey::Conversations, CacheKey::ConversationsMeta]
        );
    }

    #[test]
    fn duplicate_live_delivery_does_not_duplicate_the_message() {
        let (store, _, router) = setup(Some(42));
        store.initialize_buffer(42, vec![Message::new(1, 42, 100)]);

        router.route(&created_frame(4, 400, 42));
        router.route(&created_frame(4, 400, 42));

        let ids: Vec<i64> = store.get_buffer(42).messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn off_screen_message_only_refreshes_list_caches() {
        let (store, invalidator, router) = setup(Some(7));

        router.route(&created_frame(4, 400, 42));

        assert!(store.get_buffer(42).is_empty());
        assert_eq!(
            invalidator.keys(),
            vec![CacheKey::Conversations, CacheKey::ConversationsMeta]
        );
    }

    #[test]
    fn message_update_replaces_only_in_the_open_conversation() {
        let (store, _, router) = setup(Some(42));
        store.initialize_buffer(42, vec![Message::new(4, 42, 400)]);

        router.route(&json!({
            "message": {
                "event": "message.updated",
                "data": {"id": 4, "created_at": 400, "conversation_id": 42, "content": "edited"}
            }
        }));

        let buffer = store.get_buffer(42);
        assert_eq!(buffer.messages[0].content.as_deref(), Some("edited"));
    }

    #[test]
    fn conversation_events_never_touch_the_buffer() {
        let (store, invalidator, router) = setup(Some(42));
        store.initialize_buffer(42, vec![Message::new(1, 42, 100)]);
        let before = store.get_buffer(42);

        router.route(&json!({
            "message": {
                "event": "conversation.status_changed",
                "data": {"id": 42, "status": "resolved"}
            }
        }));

        assert_eq!(store.get_buffer(42), before);
        assert_eq!(
            invalidator.keys(),
            vec![CacheKey::Conversations, CacheKey::ConversationsMeta]
        );
    }

    #[test]
    fn conversation_update_with_message_payload_refreshes_the_open_message_list() {
        let (_, invalidator, router) = setup(Some(42));

        router.route(&json!({
            "message": {
                "event": "conversation.updated",
                "data": {"id": 42, "messages": [{"id": 9}]}
            }
        }));

        assert_eq!(
            invalidator.keys(),
            vec![
                CacheKey::Conversations,
                CacheKey::ConversationsMeta,
                CacheKey::Messages(42)
            ]
        );
    }

    #[test]
    fn typing_events_are_forwarded_and_nothing_else() {
        let (store, invalidator, mut router) = setup(Some(42));
        let mut signals = router.ephemeral_listener();

        router.route(&json!({
            "message": {
                "event": "conversation_typing_on",
                "data": {"conversation": {"id": 42}}
            }
        }));

        match signals.try_recv() {
            Ok(EphemeralSignal::TypingOn { conversation_id }) => {
                assert_eq!(conversation_id, Some(42));
            }
            other => panic!("expected typing signal, got {other:?}"),
        }
        assert!(store.get_buffer(42).is_empty());
        assert!(invalidator.keys().is_empty());
    }

    #[test]
    fn unknown_message_like_kinds_trigger_a_defensive_list_refresh() {
        let (_, invalidator, router) = setup(None);

        router.route(&json!({
            "message": {"event": "message.vanished", "data": {"id": 1}}
        }));
        assert_eq!(invalidator.keys(), vec![CacheKey::Conversations]);

        router.route(&json!({
            "message": {"event": "webhook.fired", "data": {}}
        }));
        assert_eq!(invalidator.keys(), vec![CacheKey::Conversations]);
    }

    #[test]
    fn keepalives_and_malformed_frames_are_ignored() {
        let (store, invalidator, router) = setup(Some(42));

        router.route(&json!({"type": "ping"}));
        router.route(&json!({"type": "welcome"}));
        router.route_text("{not json");
        router.route_text(r#"{"message": 7}"#);

        assert!(store.get_buffer(42).is_empty());
        assert!(invalidator.keys().is_empty());
    }
}
