//! Complementary consistency mechanisms around the push channel: a periodic
//! cursor-based catch-up poll and bidirectional history pagination. Both
//! merge through the store's mutation API, so their writes compose with live
//! events in any interleaving.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::api::{ApiError, ChatApi, MessageQuery};
use crate::error::SyncError;
use crate::model::ConversationId;
use crate::store::{MessageStore, PaginationDirection};

/// Default period between catch-up polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(8000);

/// Periodic catch-up poll for one conversation, used while push is degraded
/// or as a safety net alongside it. A failed tick logs and waits for the
/// next one; the loop only stops on teardown.
pub struct PollingFallback {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollingFallback {
    pub fn spawn(
        store: Arc<MessageStore>,
        api: Arc<dyn ChatApi>,
        conversation_id: ConversationId,
        period: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately; consume it so
            // polling starts one period after spawn.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = poll_once(&store, api.as_ref(), conversation_id).await {
                            warn!(conversation_id, error = %err, "catch-up poll failed");
                        }
                    }
                }
            }
            debug!(conversation_id, "polling fallback stopped");
        });
        Self { shutdown, task }
    }

    /// Deterministic teardown. No tick runs after this returns.
    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// One poll pass: catch up from the newest buffered timestamp, or do a
/// bounded initial fetch when the buffer is empty. Idempotent either way.
async fn poll_once(
    store: &MessageStore,
    api: &dyn ChatApi,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    let newest_ts = store
        .get_buffer(conversation_id)
        .newest()
        .map(|m| m.created_at);
    match newest_ts {
        Some(after) => {
            let page = api
                .get_messages(
                    conversation_id,
                    MessageQuery::after(after).with_limit(store.page_size()),
                )
                .await?;
            store.add_newer_messages(conversation_id, page.payload);
        }
        None => {
            let page = api
                .get_messages(
                    conversation_id,
                    MessageQuery::default().with_limit(store.page_size()),
                )
                .await?;
            // One-by-one ingestion stays safe when a live event already
            // inserted some of these.
            for message in page.payload {
                store.add_new_message(conversation_id, message);
            }
        }
    }
    Ok(())
}

/// Caller-side pagination over the same merge path. Owns the loading-flag
/// guard the store deliberately does not enforce: a fetch is skipped while
/// one is already outstanding in that direction.
pub struct MessagePaginator {
    store: Arc<MessageStore>,
    api: Arc<dyn ChatApi>,
}

impl MessagePaginator {
    pub fn new(store: Arc<MessageStore>, api: Arc<dyn ChatApi>) -> Self {
        Self { store, api }
    }

    /// Seed the buffer with the most recent page. Returns the number of
    /// messages fetched.
    pub async fn load_initial(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, SyncError> {
        let page = self
            .api
            .get_messages(
                conversation_id,
                MessageQuery::default().with_limit(self.store.page_size()),
            )
            .await?;
        let fetched = page.payload.len();
        self.store.initialize_buffer(conversation_id, page.payload);
        Ok(fetched)
    }

    /// Fetch one page of older history. No-op while a backward fetch is
    /// outstanding or once history is exhausted.
    pub async fn load_older(&self, conversation_id: ConversationId) -> Result<usize, SyncError> {
        let buffer = self.store.get_buffer(conversation_id);
        if buffer.is_loading_older {
            return Ok(0);
        }
        let Some(oldest_ts) = buffer.oldest().map(|m| m.created_at) else {
            return self.load_initial(conversation_id).await;
        };
        if !buffer.has_older_messages {
            return Ok(0);
        }

        self.store
            .set_loading_state(conversation_id, PaginationDirection::Older, true);
        let result = self
            .api
            .get_messages(
                conversation_id,
                MessageQuery::before(oldest_ts).with_limit(self.store.page_size()),
            )
            .await;
        self.store
            .set_loading_state(conversation_id, PaginationDirection::Older, false);

        let page = result?;
        let fetched = page.payload.len();
        if fetched == 0 {
            // An empty page is the strongest exhaustion proof; the store's
            // empty-batch no-op would otherwise leave the flag stale.
            self.store.update_has_older_messages(conversation_id, false);
            return Ok(0);
        }
        self.store.add_older_messages(conversation_id, page.payload);
        Ok(fetched)
    }

    /// Catch up on newer history past the buffer window. No-op while a
    /// forward fetch is outstanding.
    pub async fn load_newer(&self, conversation_id: ConversationId) -> Result<usize, SyncError> {
        let buffer = self.store.get_buffer(conversation_id);
        if buffer.is_loading_newer {
            return Ok(0);
        }
        let Some(newest_ts) = buffer.newest().map(|m| m.created_at) else {
            return self.load_initial(conversation_id).await;
        };

        self.store
            .set_loading_state(conversation_id, PaginationDirection::Newer, true);
        let result = self
            .api
            .get_messages(
                conversation_id,
                MessageQuery::after(newest_ts).with_limit(self.store.page_size()),
            )
            .await;
        self.store
            .set_loading_state(conversation_id, PaginationDirection::Newer, false);

        let page = result?;
        let fetched = page.payload.len();
        self.store.add_newer_messages(conversation_id, page.payload);
        Ok(fetched)
    }
}
