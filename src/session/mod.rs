//! Push-channel connection supervisor.
//!
//! Owns the socket lifecycle: validate config, fetch the pubsub credential,
//! connect, subscribe, and reconnect with linear backoff when the transport
//! drops. Collaborators observe only `state()`, `is_connected()` and
//! `connection_error()`; socket internals never leak.

pub mod router;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::ChatApi;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::model::ConversationId;
use crate::protocol::{NORMAL_CLOSE_CODE, ROOM_CHANNEL, SubscribeCommand, SubscriptionIdentifier};
use router::{ActiveConversation, EventRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Reconnecting,
    Failed,
}

/// State shared between the supervisor handle and its run task. Generation
/// bumps on every `connect()`/`disconnect()`; a task whose generation is
/// stale discards its result instead of applying it.
struct Shared {
    state: Mutex<ConnectionState>,
    connection_error: Mutex<Option<String>>,
    credential: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    generation: AtomicU64,
    attempts: AtomicU32,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            connection_error: Mutex::new(None),
            credential: Mutex::new(None),
            outbound: Mutex::new(None),
            generation: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply a state transition unless this generation has been superseded.
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        *self.state.lock() = state;
        true
    }
}

pub struct ConnectionSupervisor {
    config: SyncConfig,
    api: Arc<dyn ChatApi>,
    router: Arc<EventRouter>,
    active: ActiveConversation,
    shared: Arc<Shared>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn ChatApi>,
        router: Arc<EventRouter>,
        active: ActiveConversation,
    ) -> Self {
        Self {
            config,
            api,
            router,
            active,
            shared: Arc::new(Shared::new()),
            run_task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Subscribed
    }

    pub fn connection_error(&self) -> Option<String> {
        self.shared.connection_error.lock().clone()
    }

    /// Validate the configuration and start the connection run loop. A bad
    /// configuration fails here without opening a socket. Calling while a
    /// previous session is live supersedes it.
    pub fn connect(&self) -> Result<(), SyncError> {
        let url = match self.config.websocket_url() {
            Ok(url) => url,
            Err(err) => {
                *self.shared.connection_error.lock() = Some(err.to_string());
                return Err(err);
            }
        };

        self.teardown();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.connection_error.lock() = None;
        self.shared.attempts.store(0, Ordering::SeqCst);
        *self.shared.state.lock() = ConnectionState::Connecting;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let task = tokio::spawn(run_loop(
            self.config.clone(),
            url,
            self.api.clone(),
            self.router.clone(),
            self.active.clone(),
            self.shared.clone(),
            generation,
            shutdown_rx,
        ));
        *self.run_task.lock() = Some(task);
        Ok(())
    }

    /// Deliberate teardown: cancel any pending reconnect timer, close the
    /// socket with the normal-closure code, and mark the session
    /// disconnected. Safe to call at any point in the lifecycle.
    pub fn disconnect(&self) {
        self.teardown();
        *self.shared.state.lock() = ConnectionState::Disconnected;
    }

    /// Switch the conversation the session is scoped to. While subscribed,
    /// this sends a fresh subscribe command on the existing socket instead
    /// of reconnecting.
    pub fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        self.active.set(conversation_id);
        if self.state() != ConnectionState::Subscribed {
            return;
        }
        let credential = self
            .shared
            .credential
            .lock()
            .clone()
            .unwrap_or_else(|| self.config.api_token.clone());
        let identifier = subscription_identifier(&self.config, credential, conversation_id);
        match subscribe_frame(&identifier) {
            Ok(frame) => {
                if let Some(tx) = self.shared.outbound.lock().as_ref() {
                    let _ = tx.send(WsMessage::Text(frame));
                }
            }
            Err(err) => warn!(error = %err, "failed to encode resubscribe command"),
        }
    }

    /// Stop the run task without touching the visible state.
    fn teardown(&self) {
        // Ask the socket writer to close cleanly before the loop exits.
        if let Some(tx) = self.shared.outbound.lock().take() {
            let _ = tx.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })));
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        self.run_task.lock().take();
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
    }
}

fn subscription_identifier(
    config: &SyncConfig,
    credential: String,
    conversation_id: Option<ConversationId>,
) -> SubscriptionIdentifier {
    SubscriptionIdentifier {
        channel: ROOM_CHANNEL.to_string(),
        pubsub_token: credential,
        account_id: config.account_id,
        user_id: config.user_id,
        conversation_id,
    }
}

fn subscribe_frame(identifier: &SubscriptionIdentifier) -> serde_json::Result<String> {
    SubscribeCommand::subscribe(identifier)?.to_frame()
}

/// How one established connection ended.
enum SessionEnd {
    /// Deliberate close; the loop stops without retrying.
    Clean,
    /// Transport failure or abnormal close; eligible for reconnect.
    Failed(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: SyncConfig,
    url: Url,
    api: Arc<dyn ChatApi>,
    router: Arc<EventRouter>,
    active: ActiveConversation,
    shared: Arc<Shared>,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if !shared.transition(generation, ConnectionState::Authenticating) {
            return;
        }

        // Degraded-but-functional path: if the profile lookup fails, the
        // primary API token doubles as the subscription credential.
        let credential = tokio::select! {
            _ = shutdown.changed() => return,
            profile = api.get_profile() => match profile {
                Ok(profile) => profile
                    .pubsub_token
                    .unwrap_or_else(|| config.api_token.clone()),
                Err(err) => {
                    warn!(error = %err, "pubsub credential fetch failed, falling back to api token");
                    config.api_token.clone()
                }
            },
        };
        if !shared.is_current(generation) {
            return;
        }
        *shared.credential.lock() = Some(credential.clone());

        let end = tokio::select! {
            _ = shutdown.changed() => return,
            connected = connect_async(url.as_str()) => match connected {
                Ok((socket, _)) => {
                    run_session(
                        socket,
                        &config,
                        credential,
                        &router,
                        &active,
                        &shared,
                        generation,
                        &mut shutdown,
                    )
                    .await
                }
                Err(err) => SessionEnd::Failed(format!("connect failed: {err}")),
            },
        };

        shared.outbound.lock().take();
        if !shared.is_current(generation) || *shutdown.borrow() {
            return;
        }

        match end {
            SessionEnd::Clean => {
                shared.transition(generation, ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Failed(reason) => {
                let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > config.max_reconnect_attempts {
                    warn!(
                        attempts = config.max_reconnect_attempts,
                        reason = %reason,
                        "reconnect attempts exhausted"
                    );
                    *shared.connection_error.lock() = Some(
                        SyncError::ReconnectExhausted {
                            attempts: config.max_reconnect_attempts,
                        }
                        .to_string(),
                    );
                    shared.transition(generation, ConnectionState::Failed);
                    return;
                }

                let delay = config.reconnect_delay_base * attempt;
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "push channel lost, scheduling reconnect"
                );
                shared.transition(generation, ConnectionState::Reconnecting);
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

/// Drive one established socket until it ends: send the subscribe command,
/// pump outbound frames, and route inbound frames.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &SyncConfig,
    credential: String,
    router: &EventRouter,
    active: &ActiveConversation,
    shared: &Shared,
    generation: u64,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();

    let identifier = subscription_identifier(config, credential, active.get());
    let frame = match subscribe_frame(&identifier) {
        Ok(frame) => frame,
        Err(err) => return SessionEnd::Failed(format!("subscribe encode failed: {err}")),
    };
    if sink.send(WsMessage::Text(frame)).await.is_err() {
        return SessionEnd::Failed("subscribe send failed".into());
    }

    // The outbound sender must be in place before `Subscribed` becomes
    // visible, or a resubscribe issued right after the flag flips is lost.
    *shared.outbound.lock() = Some(out_tx);
    if !shared.transition(generation, ConnectionState::Subscribed) {
        shared.outbound.lock().take();
        return SessionEnd::Clean;
    }
    shared.attempts.store(0, Ordering::SeqCst);
    *shared.connection_error.lock() = None;
    info!(account_id = config.account_id, "push channel subscribed");

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, WsMessage::Close(_));
                    if sink.send(message).await.is_err() {
                        return SessionEnd::Failed("socket send failed".into());
                    }
                    if closing {
                        return SessionEnd::Clean;
                    }
                }
                None => return SessionEnd::Clean,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => router.route_text(&text),
                Some(Ok(WsMessage::Close(close))) => {
                    let code = close.map(|frame| u16::from(frame.code));
                    if code == Some(NORMAL_CLOSE_CODE) {
                        debug!("push channel closed normally by server");
                        return SessionEnd::Clean;
                    }
                    return SessionEnd::Failed(format!("abnormal close: {code:?}"));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Failed(format!("socket error: {err}")),
                None => return SessionEnd::Failed("socket stream ended".into()),
            },
            _ = shutdown.changed() => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                return SessionEnd::Clean;
            }
        }
    }
}
