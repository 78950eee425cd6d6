//! Realtime conversation sync core for a messaging admin console.
//!
//! Keeps a bounded, ordered, deduplicated window of each conversation's
//! messages current across three transports that may interleave freely:
//! a WebSocket push channel (with reconnect/backoff), a periodic catch-up
//! poll, and bidirectional history pagination. Every transport merges
//! through the same [`store::MessageStore`] mutation API, which absorbs
//! duplicates and out-of-order arrivals instead of treating them as errors.

pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use api::{ApiError, ChatApi, HttpChatApi, MessagePage, MessageQuery, Profile};
pub use config::{MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_BASE, SyncConfig};
pub use error::SyncError;
pub use model::{ConversationId, Message, MessageId, MessageStatus, SenderRef};
pub use session::router::{
    ActiveConversation, CacheInvalidator, CacheKey, EphemeralSignal, EventRouter, NullInvalidator,
};
pub use session::{ConnectionState, ConnectionSupervisor};
pub use store::{
    MAX_BUFFER_SIZE, MessageBuffer, MessageStore, PAGE_SIZE, PaginationDirection,
};
pub use sync::{DEFAULT_POLL_INTERVAL, MessagePaginator, PollingFallback};
