//! Polling fallback and pagination against a scripted chat API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tidepool::api::{ApiError, ChatApi, MessagePage, MessageQuery, Profile};
use tidepool::model::{ConversationId, Message};
use tidepool::store::{MessageStore, PaginationDirection};
use tidepool::sync::{MessagePaginator, PollingFallback};

enum Scripted {
    Page(Vec<Message>),
    Fail,
}

/// Chat API double that replays a scripted sequence of responses and
/// records every query it was asked. An optional hook runs while a fetch is
/// in flight, between the request and its response, to simulate writes
/// racing the fetch.
#[derive(Default)]
struct ScriptedApi {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<(ConversationId, MessageQuery)>>,
    in_flight: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl ScriptedApi {
    fn push_page(&self, payload: Vec<Message>) {
        self.script.lock().unwrap().push_back(Scripted::Page(payload));
    }

    fn push_failure(&self) {
        self.script.lock().unwrap().push_back(Scripted::Fail);
    }

    fn calls(&self) -> Vec<(ConversationId, MessageQuery)> {
        self.calls.lock().unwrap().clone()
    }

    fn set_while_in_flight(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.in_flight.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        query: MessageQuery,
    ) -> Result<MessagePage, ApiError> {
        self.calls.lock().unwrap().push((conversation_id, query));
        if let Some(hook) = self.in_flight.lock().unwrap().as_ref() {
            hook();
        }
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Page(payload)) => Ok(MessagePage { payload }),
            Some(Scripted::Fail) => Err(ApiError::InvalidConfig("scripted failure".into())),
            None => Ok(MessagePage::default()),
        }
    }

    async fn get_profile(&self) -> Result<Profile, ApiError> {
        Ok(Profile {
            pubsub_token: Some("pubsub-secret".into()),
        })
    }
}

fn msg(id: i64, created_at: i64) -> Message {
    Message::new(id, 42, created_at)
}

fn ids(store: &MessageStore, conversation_id: ConversationId) -> Vec<i64> {
    store
        .get_buffer(conversation_id)
        .messages
        .iter()
        .map(|m| m.id)
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

const PERIOD: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn poll_catches_up_from_the_newest_cursor() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    store.initialize_buffer(42, vec![msg(10, 1000)]);
    api.push_page(vec![msg(11, 1100), msg(12, 1200)]);

    let poller = PollingFallback::spawn(store.clone(), api.clone(), 42, PERIOD);
    wait_until(|| store.get_buffer(42).newest_message_id == Some(12)).await;
    poller.stop();

    assert_eq!(ids(&store, 42), vec![10, 11, 12]);
    let (conversation_id, query) = api.calls()[0];
    assert_eq!(conversation_id, 42);
    assert_eq!(query.after, Some(1000));
    assert_eq!(query.before, None);
    assert_eq!(query.limit, Some(store.page_size()));
}

#[tokio::test(start_paused = true)]
async fn poll_on_empty_buffer_ingests_an_initial_page_idempotently() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    api.push_page(vec![msg(1, 100), msg(2, 200)]);

    // A live event lands while the initial fetch is in flight; the
    // one-by-one ingestion must not duplicate it.
    let race = store.clone();
    api.set_while_in_flight(move || race.add_new_message(42, msg(2, 200)));

    let poller = PollingFallback::spawn(store.clone(), api.clone(), 42, PERIOD);
    wait_until(|| store.get_buffer(42).len() == 2).await;
    poller.stop();

    assert_eq!(ids(&store, 42), vec![1, 2]);
    let (_, query) = api.calls()[0];
    assert_eq!(query.after, None);
}

#[tokio::test(start_paused = true)]
async fn failed_poll_does_not_stop_the_loop() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    store.initialize_buffer(42, vec![msg(10, 1000)]);
    api.push_failure();
    api.push_page(vec![msg(11, 1100)]);

    let poller = PollingFallback::spawn(store.clone(), api.clone(), 42, PERIOD);
    wait_until(|| store.get_buffer(42).newest_message_id == Some(11)).await;
    poller.stop();

    assert!(api.calls().len() >= 2);
}

#[tokio::test(start_paused = true)]
async fn stopped_poller_never_ticks_again() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    store.initialize_buffer(42, vec![msg(10, 1000)]);

    let poller = PollingFallback::spawn(store.clone(), api.clone(), 42, PERIOD);
    wait_until(|| !api.calls().is_empty()).await;
    let seen = api.calls().len();
    poller.stop();

    tokio::time::sleep(PERIOD * 5).await;
    assert_eq!(api.calls().len(), seen);
}

#[tokio::test]
async fn backward_pagination_exhausts_history_on_a_short_page() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    let seed: Vec<Message> = (50..70).map(|i| msg(i, i * 10)).collect();
    store.initialize_buffer(42, seed);
    api.push_page((45..50).map(|i| msg(i, i * 10)).collect());

    let paginator = MessagePaginator::new(store.clone(), api.clone());
    let fetched = paginator.load_older(42).await.unwrap();

    assert_eq!(fetched, 5);
    let buffer = store.get_buffer(42);
    assert_eq!(buffer.len(), 25);
    assert!(!buffer.has_older_messages);
    assert!(!buffer.is_loading_older);

    let (_, query) = api.calls()[0];
    assert_eq!(query.before, Some(500));

    // Exhausted history: no further fetch is issued.
    assert_eq!(paginator.load_older(42).await.unwrap(), 0);
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn outstanding_backward_fetch_blocks_a_second_one() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    store.initialize_buffer(42, vec![msg(1, 100)]);
    store.set_loading_state(42, PaginationDirection::Older, true);

    let paginator = MessagePaginator::new(store.clone(), api.clone());
    assert_eq!(paginator.load_older(42).await.unwrap(), 0);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn load_older_on_an_empty_buffer_seeds_it() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    api.push_page(vec![msg(3, 300), msg(1, 100)]);

    let paginator = MessagePaginator::new(store.clone(), api.clone());
    let fetched = paginator.load_older(42).await.unwrap();

    assert_eq!(fetched, 2);
    assert_eq!(ids(&store, 42), vec![1, 3]);
    assert!(store.get_buffer(42).has_older_messages);
}

#[tokio::test]
async fn empty_backward_page_clears_the_older_flag() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    store.initialize_buffer(42, vec![msg(1, 100)]);
    // No scripted page: the API answers with an empty payload.

    let paginator = MessagePaginator::new(store.clone(), api.clone());
    assert_eq!(paginator.load_older(42).await.unwrap(), 0);
    assert!(!store.get_buffer(42).has_older_messages);
}

#[tokio::test]
async fn pagination_error_clears_the_loading_flag() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    store.initialize_buffer(42, vec![msg(1, 100)]);
    api.push_failure();

    let paginator = MessagePaginator::new(store.clone(), api.clone());
    assert!(paginator.load_older(42).await.is_err());

    let buffer = store.get_buffer(42);
    assert!(!buffer.is_loading_older);
    // Failure proves nothing about history.
    assert!(buffer.has_older_messages);
}

#[tokio::test]
async fn forward_pagination_full_page_keeps_the_newer_hint() {
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ScriptedApi::default());
    store.initialize_buffer(42, vec![msg(0, 0)]);
    let full_page: Vec<Message> = (1..=store.page_size() as i64).map(|i| msg(i, i * 10)).collect();
    api.push_page(full_page);

    let paginator = MessagePaginator::new(store.clone(), api.clone());
    let fetched = paginator.load_newer(42).await.unwrap();

    assert_eq!(fetched, store.page_size());
    let buffer = store.get_buffer(42);
    assert!(buffer.has_newer_messages);
    assert!(!buffer.is_loading_newer);

    let (_, query) = api.calls()[0];
    assert_eq!(query.after, Some(0));
}
