//! Client sync agent: the per-client counterpart of the server relay.
//!
//! `SyncAgent` intercepts local document/awareness changes, coalesces them
//! through [`UpdateBatcher`] / [`AwarenessThrottler`], and exchanges frames
//! with the server over a [`SyncTransport`]. It owns the connection
//! lifecycle: joining (resuming a cached identity when one exists),
//! reconnection with exponential backoff, and gating outbound flushes on
//! connectivity while applying inbound deltas unconditionally.
//!
//! Flush discipline:
//!
//! - A flush fires when a batching window elapses inside a live session.
//!   When the transport drops, armed timers are cleared but the backlogs
//!   are kept, so edits made during a connection blip accumulate with
//!   zero sends. After a successful rejoin any kept backlog re-arms a
//!   fresh window, and the next scheduled flush carries everything.
//! - A transport failure during a flush is swallowed: the queue was
//!   already drained and the timer cleared, so the next local change
//!   schedules a fresh window and the CRDT's convergence carries the state
//!   forward on a later flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::batcher::{AwarenessThrottler, UpdateBatcher, UpdateMerger, encode_awareness};
use super::transport::{SyncTransport, TransportConnector, TransportError, WsMessage};
use crate::protocol::{ActivityKind, ChatMessage, ClientEvent, ErrorCode, ServerEvent, UserInfo};
use crate::session_cache::{SessionCache, SessionStore, StoredSession};

/// Reconnection configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to automatically reconnect on disconnect.
    pub enabled: bool,
    /// Maximum number of reconnection attempts (0 = infinite).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff.
    pub base_delay_secs: u64,
    /// Maximum delay in seconds for exponential backoff.
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            base_delay_secs: 2,
            max_delay_secs: 32,
        }
    }
}

/// Configuration for the sync agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// WebSocket endpoint (e.g. "ws://localhost:3030/ws").
    pub server_url: String,
    /// Room to join.
    pub room_id: String,
    /// Nickname presented on join.
    pub nickname: String,
    /// Coalescing window for document updates.
    pub document_window: Duration,
    /// Coalescing window for awareness state (longer: presence is cosmetic).
    pub awareness_window: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl AgentConfig {
    pub fn new(server_url: String, room_id: String, nickname: String) -> Self {
        Self {
            server_url,
            room_id,
            nickname,
            document_window: Duration::from_millis(250),
            awareness_window: Duration::from_millis(400),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Client-local connection lifecycle (never on the wire).
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Reconnected,
    Disconnected,
    ConnectionError { message: String },
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Lifecycle(Lifecycle),
    /// Join succeeded; carries the roster and history snapshot.
    Joined {
        user_id: String,
        owner_id: String,
        users: Vec<UserInfo>,
        messages: Vec<ChatMessage>,
    },
    /// A remote document delta to apply to the local replica.
    RemoteUpdate { update: Vec<u8>, user_id: String },
    /// A remote awareness delta to apply to local presence state.
    RemoteAwareness { awareness: Vec<u8>, user_id: String },
    /// A peer disconnected; drop its awareness entry.
    AwarenessRemoved { user_id: String },
    MessageReceived(ChatMessage),
    UserJoined(UserInfo),
    UserLeft { user_id: String },
    TypingStatus {
        user_id: String,
        nickname: String,
        is_typing: bool,
    },
    OwnerChanged {
        owner_id: String,
        owner_nickname: String,
    },
    ActivityPing {
        kind: ActivityKind,
        ts: DateTime<Utc>,
        user_id: String,
    },
    /// The room was destroyed server-side; local room state must be cleared.
    RoomClosed,
    ServerError { code: ErrorCode, message: String },
}

/// Trait for receiving agent events.
///
/// Implementors translate events into frontend-specific actions (applying
/// deltas to the local document, updating the roster UI, etc.).
pub trait AgentEventHandler: Send + Sync {
    fn on_event(&self, event: AgentEvent);
}

/// How a sync session ended.
enum SessionOutcome {
    /// Transport dropped; eligible for reconnection.
    Dropped,
    /// The server rejected the join or closed the room; do not retry.
    Ended,
}

/// Why the session loop woke up.
enum Wake {
    Incoming(Option<Result<WsMessage, TransportError>>),
    Flush,
    Rearm,
    Control(Option<ClientEvent>),
    Ping,
}

/// Outbound coalescing state shared between the enqueue API and the driver.
struct Outbox {
    doc: UpdateBatcher,
    awareness: AwarenessThrottler,
}

impl Outbox {
    fn next_deadline(&self) -> Option<Instant> {
        match (self.doc.deadline(), self.awareness.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Per-client synchronization agent.
pub struct SyncAgent<C: TransportConnector, S: SessionStore> {
    config: AgentConfig,
    connector: C,
    merger: Arc<dyn UpdateMerger>,
    handler: Arc<dyn AgentEventHandler>,
    sessions: SessionCache<S>,
    outbox: Mutex<Outbox>,
    /// Wakes the driver to recompute its sleep deadline after a window arms.
    wake_tx: mpsc::UnboundedSender<()>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    /// Non-batched sends (chat, typing, activity, leave).
    control_tx: mpsc::UnboundedSender<ClientEvent>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    running: AtomicBool,
}

impl<C: TransportConnector, S: SessionStore> SyncAgent<C, S> {
    pub fn new(
        config: AgentConfig,
        connector: C,
        merger: Arc<dyn UpdateMerger>,
        handler: Arc<dyn AgentEventHandler>,
        sessions: SessionCache<S>,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            outbox: Mutex::new(Outbox {
                doc: UpdateBatcher::new(config.document_window),
                awareness: AwarenessThrottler::new(config.awareness_window),
            }),
            config,
            connector,
            merger,
            handler,
            sessions,
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            running: AtomicBool::new(true),
        }
    }

    // ==================== Local change API ====================

    /// Queue a local document update for the next batched flush.
    pub fn queue_document_update(&self, update: Vec<u8>) {
        let armed = {
            let mut outbox = self.outbox.lock().expect("outbox lock poisoned");
            outbox.doc.push(update, Instant::now())
        };
        if armed.is_some() {
            let _ = self.wake_tx.send(());
        }
    }

    /// Record the latest value for an awareness field (cursor, selection,
    /// color, name). Replaces any value queued for the same field.
    pub fn set_awareness_field(&self, field: impl Into<String>, value: Vec<u8>) {
        let armed = {
            let mut outbox = self.outbox.lock().expect("outbox lock poisoned");
            outbox.awareness.set(field, value, Instant::now())
        };
        if armed.is_some() {
            let _ = self.wake_tx.send(());
        }
    }

    /// Send a chat message (not batched).
    pub fn send_chat(&self, content: String) {
        let _ = self.control_tx.send(ClientEvent::SendMessage { content });
    }

    /// Report typing status (not batched).
    pub fn set_typing(&self, is_typing: bool) {
        let _ = self.control_tx.send(ClientEvent::UserTyping { is_typing });
    }

    /// Emit an activity heartbeat (not batched, not merged into awareness).
    pub fn notify_activity(&self, kind: ActivityKind) {
        let _ = self.control_tx.send(ClientEvent::Activity { kind });
    }

    /// Leave the room and stop the agent.
    pub fn leave(&self) {
        let _ = self.control_tx.send(ClientEvent::LeaveRoom);
        self.shutdown();
    }

    /// Stop the agent: the driver loop exits, pending timers are cancelled,
    /// and queued-but-unsent state is dropped.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.wake_tx.send(());
    }

    // ==================== Driver ====================

    /// Run the agent until [`shutdown`](Self::shutdown), the server ends the
    /// session, or reconnection attempts are exhausted.
    pub async fn run_persistent(&self) {
        let mut wake_rx = match self.wake_rx.lock().expect("wake_rx lock poisoned").take() {
            Some(rx) => rx,
            None => {
                log::error!("[SyncAgent] run_persistent called twice");
                return;
            }
        };
        let mut control_rx = match self.control_rx.lock().expect("control_rx lock poisoned").take()
        {
            Some(rx) => rx,
            None => return,
        };

        let rc = &self.config.reconnect;
        let mut attempt = 0u32;

        while self.running.load(Ordering::SeqCst) {
            if attempt > 0 {
                if !rc.enabled || (rc.max_attempts > 0 && attempt >= rc.max_attempts) {
                    log::info!("[SyncAgent] Max reconnection attempts reached");
                    break;
                }
                let delay = rc.base_delay_secs.saturating_pow(attempt).min(rc.max_delay_secs);
                self.handler
                    .on_event(AgentEvent::Lifecycle(Lifecycle::Reconnecting { attempt }));
                log::info!("[SyncAgent] Reconnecting in {}s (attempt {})", delay, attempt);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
            }

            self.handler
                .on_event(AgentEvent::Lifecycle(Lifecycle::Connecting));

            let mut transport = match self.connector.connect(&self.config.server_url).await {
                Ok(t) => {
                    log::info!("[SyncAgent] Connected to {}", self.config.server_url);
                    self.handler.on_event(AgentEvent::Lifecycle(if attempt > 0 {
                        Lifecycle::Reconnected
                    } else {
                        Lifecycle::Connected
                    }));
                    attempt = 0;
                    t
                }
                Err(e) => {
                    log::error!("[SyncAgent] Connection failed: {}", e);
                    self.handler
                        .on_event(AgentEvent::Lifecycle(Lifecycle::ConnectionError {
                            message: e.to_string(),
                        }));
                    attempt += 1;
                    continue;
                }
            };

            let result = self
                .run_session(&mut transport, &mut wake_rx, &mut control_rx)
                .await;
            let _ = transport.close().await;

            // Clear armed timers but keep the backlogs; a rejoin re-arms
            // fresh windows for whatever accumulated while offline.
            {
                let mut outbox = self.outbox.lock().expect("outbox lock poisoned");
                outbox.doc.disarm();
                outbox.awareness.disarm();
            }

            match result {
                Ok(SessionOutcome::Ended) => break,
                Ok(SessionOutcome::Dropped) => {
                    if self.running.load(Ordering::SeqCst) {
                        self.handler
                            .on_event(AgentEvent::Lifecycle(Lifecycle::Disconnected));
                        attempt += 1;
                    }
                }
                Err(e) => {
                    log::error!("[SyncAgent] Session error: {}", e);
                    if self.running.load(Ordering::SeqCst) {
                        self.handler
                            .on_event(AgentEvent::Lifecycle(Lifecycle::Disconnected));
                        attempt += 1;
                    }
                }
            }
        }

        // Cancel pending timers and drop queued state.
        {
            let mut outbox = self.outbox.lock().expect("outbox lock poisoned");
            outbox.doc.clear();
            outbox.awareness.clear();
        }
        self.handler
            .on_event(AgentEvent::Lifecycle(Lifecycle::Disconnected));
        log::info!("[SyncAgent] Agent stopped");
    }

    /// Run one session: join, then pump frames until the transport drops.
    async fn run_session(
        &self,
        transport: &mut C::Transport,
        wake_rx: &mut mpsc::UnboundedReceiver<()>,
        control_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Result<SessionOutcome, TransportError> {
        // Silent rejoin: reuse a cached identity when one is still valid.
        let resume_user_id = self
            .sessions
            .get(&self.config.room_id, Utc::now())
            .map(|s| s.user_id);

        let join = ClientEvent::JoinRoom {
            room_id: self.config.room_id.clone(),
            nickname: self.config.nickname.clone(),
            user_id: resume_user_id,
        };
        self.send_event(transport, &join).await?;

        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        ping_interval.tick().await; // Consume first immediate tick

        loop {
            if !self.running.load(Ordering::SeqCst) {
                // Drain any explicit leave queued by `leave()` before exit.
                while let Ok(ev) = control_rx.try_recv() {
                    let _ = self.send_event(transport, &ev).await;
                }
                return Ok(SessionOutcome::Ended);
            }

            let next_deadline = self
                .outbox
                .lock()
                .expect("outbox lock poisoned")
                .next_deadline();

            // Resolve the wake reason first: the recv future borrows the
            // transport, so sends happen after the select completes.
            let wake = tokio::select! {
                msg = transport.recv() => Wake::Incoming(msg),
                _ = sleep_until_opt(next_deadline) => Wake::Flush,
                _ = wake_rx.recv() => Wake::Rearm,
                ev = control_rx.recv() => Wake::Control(ev),
                _ = ping_interval.tick() => Wake::Ping,
            };

            match wake {
                Wake::Incoming(msg) => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(outcome) = self.handle_server_frame(&text) {
                            return Ok(outcome);
                        }
                    }
                    Some(Ok(WsMessage::Close)) | None => {
                        log::info!("[SyncAgent] Connection closed by server");
                        return Ok(SessionOutcome::Dropped);
                    }
                    Some(Ok(_)) => {} // pings/pongs/binary: keepalive noise
                    Some(Err(e)) => {
                        log::error!("[SyncAgent] Transport error: {}", e);
                        return Ok(SessionOutcome::Dropped);
                    }
                },
                Wake::Flush => {
                    self.flush_due(transport).await;
                }
                Wake::Rearm => {
                    // A window was armed (or shutdown requested); recompute
                    // the sleep deadline on the next iteration.
                }
                Wake::Control(ev) => {
                    if let Some(ev) = ev {
                        self.send_event(transport, &ev).await?;
                    }
                }
                Wake::Ping => {
                    transport.send_ping().await?;
                }
            }
        }
    }

    /// Flush whichever channels are due; send failures are swallowed.
    async fn flush_due(&self, transport: &mut C::Transport) {
        let (doc_payload, awareness_payload) = {
            let mut outbox = self.outbox.lock().expect("outbox lock poisoned");
            let now = Instant::now();

            let doc = if outbox.doc.is_due(now) {
                outbox.doc.drain(self.merger.as_ref())
            } else {
                None
            };

            let awareness = if outbox.awareness.is_due(now) {
                outbox.awareness.drain().map(|s| encode_awareness(&s))
            } else {
                None
            };

            (doc, awareness)
        };

        if let Some(update) = doc_payload {
            let ev = ClientEvent::DocumentUpdate { update };
            if let Err(e) = self.send_event(transport, &ev).await {
                // Non-fatal: the timer is already cleared, the next local
                // change schedules a fresh flush, and CRDT convergence
                // carries the state forward.
                log::warn!("[SyncAgent] Document flush failed: {}", e);
            }
        }

        if let Some(awareness) = awareness_payload {
            let ev = ClientEvent::AwarenessUpdate { awareness };
            if let Err(e) = self.send_event(transport, &ev).await {
                log::warn!("[SyncAgent] Awareness flush failed: {}", e);
            }
        }
    }

    async fn send_event(
        &self,
        transport: &mut C::Transport,
        event: &ClientEvent,
    ) -> Result<(), TransportError> {
        let frame =
            serde_json::to_string(event).map_err(|e| TransportError::Other(e.to_string()))?;
        transport.send_text(frame).await
    }

    /// Dispatch one inbound frame. Remote deltas are applied (forwarded to
    /// the handler) immediately and unconditionally; whether WE can send is
    /// irrelevant to applying THEIR state.
    ///
    /// Returns `Some(outcome)` when the session must end.
    fn handle_server_frame(&self, text: &str) -> Option<SessionOutcome> {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(ev) => ev,
            Err(e) => {
                log::warn!("[SyncAgent] Ignoring malformed server frame: {}", e);
                return None;
            }
        };

        match event {
            ServerEvent::RoomJoined {
                success: true,
                users,
                messages,
                user_id,
                owner_id,
                ..
            } => {
                self.sessions.put(&StoredSession {
                    user_id: user_id.clone(),
                    nickname: self.config.nickname.clone(),
                    room_id: self.config.room_id.clone(),
                    last_activity: Utc::now(),
                });
                // Schedule a flush for anything queued while offline; the
                // session loop picks the deadline up on its next turn.
                {
                    let mut outbox = self.outbox.lock().expect("outbox lock poisoned");
                    let now = Instant::now();
                    outbox.doc.rearm(now);
                    outbox.awareness.rearm(now);
                }
                self.handler.on_event(AgentEvent::Joined {
                    user_id,
                    owner_id,
                    users,
                    messages,
                });
                None
            }
            ServerEvent::RoomJoined { error, .. } => {
                let code = error.unwrap_or(ErrorCode::InternalError);
                log::warn!("[SyncAgent] Join rejected: {}", code);
                if code == ErrorCode::RoomNotFound {
                    // Stale identity for a dead room is useless.
                    self.sessions.clear(&self.config.room_id);
                }
                self.handler.on_event(AgentEvent::ServerError {
                    code,
                    message: format!("join rejected: {}", code),
                });
                Some(SessionOutcome::Ended)
            }
            ServerEvent::RoomClosed { .. } => {
                self.sessions.clear(&self.config.room_id);
                self.handler.on_event(AgentEvent::RoomClosed);
                Some(SessionOutcome::Ended)
            }
            ServerEvent::DocumentUpdate { update, user_id } => {
                self.sessions.touch(&self.config.room_id, Utc::now());
                self.handler
                    .on_event(AgentEvent::RemoteUpdate { update, user_id });
                None
            }
            ServerEvent::AwarenessUpdate { awareness, user_id } => {
                self.handler
                    .on_event(AgentEvent::RemoteAwareness { awareness, user_id });
                None
            }
            ServerEvent::AwarenessRemoval { user_id } => {
                self.handler.on_event(AgentEvent::AwarenessRemoved { user_id });
                None
            }
            ServerEvent::NewMessage { message } => {
                self.sessions.touch(&self.config.room_id, Utc::now());
                self.handler.on_event(AgentEvent::MessageReceived(message));
                None
            }
            ServerEvent::UserJoined { user } => {
                self.handler.on_event(AgentEvent::UserJoined(user));
                None
            }
            ServerEvent::UserLeft { user_id } => {
                self.handler.on_event(AgentEvent::UserLeft { user_id });
                None
            }
            ServerEvent::UserTypingStatus {
                user_id,
                nickname,
                is_typing,
            } => {
                self.handler.on_event(AgentEvent::TypingStatus {
                    user_id,
                    nickname,
                    is_typing,
                });
                None
            }
            ServerEvent::Activity { kind, ts, user_id } => {
                self.handler
                    .on_event(AgentEvent::ActivityPing { kind, ts, user_id });
                None
            }
            ServerEvent::OwnerChanged {
                owner_id,
                owner_nickname,
            } => {
                self.handler.on_event(AgentEvent::OwnerChanged {
                    owner_id,
                    owner_nickname,
                });
                None
            }
            ServerEvent::Error { code, message } => {
                self.handler.on_event(AgentEvent::ServerError { code, message });
                None
            }
        }
    }
}

/// Sleep until an optional deadline; pends forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_cache::MemorySessionStore;
    use crate::sync::batcher::ConcatMerger;
    use std::sync::Mutex as StdMutex;

    /// Transport fed by a test-controlled channel; records every sent frame.
    struct ScriptedTransport {
        incoming: mpsc::UnboundedReceiver<WsMessage>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Hands out scripted transports in order, then refuses further dials.
    struct ScriptedConnector {
        transports: StdMutex<std::collections::VecDeque<ScriptedTransport>>,
    }

    impl ScriptedConnector {
        fn new(transports: Vec<ScriptedTransport>) -> Self {
            Self {
                transports: StdMutex::new(transports.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl TransportConnector for ScriptedConnector {
        type Transport = ScriptedTransport;

        async fn connect(&self, _url: &str) -> Result<Self::Transport, TransportError> {
            self.transports
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(TransportError::Closed)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: StdMutex<Vec<AgentEvent>>,
    }

    impl AgentEventHandler for RecordingHandler {
        fn on_event(&self, event: AgentEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn joined_frame() -> String {
        serde_json::to_string(&ServerEvent::RoomJoined {
            success: true,
            users: vec![],
            messages: vec![],
            user_id: "u1".to_string(),
            owner_id: "u1".to_string(),
            owner_nickname: "ada".to_string(),
            capacity: crate::protocol::CapacityInfo { current: 1, max: 8 },
            error: None,
        })
        .unwrap()
    }

    fn new_agent(
        incoming: mpsc::UnboundedReceiver<WsMessage>,
        sent: Arc<StdMutex<Vec<String>>>,
        handler: Arc<RecordingHandler>,
    ) -> SyncAgent<ScriptedConnector, MemorySessionStore> {
        let connector = ScriptedConnector::new(vec![ScriptedTransport { incoming, sent }]);
        let mut config = AgentConfig::new(
            "ws://test/ws".to_string(),
            "room-1".to_string(),
            "ada".to_string(),
        );
        config.reconnect.enabled = false;
        SyncAgent::new(
            config,
            connector,
            Arc::new(ConcatMerger),
            handler,
            SessionCache::new(MemorySessionStore::new()),
        )
    }

    fn sent_types(sent: &Arc<StdMutex<Vec<String>>>) -> Vec<String> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|f| {
                serde_json::from_str::<serde_json::Value>(f).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_produces_one_outbound_update() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler::default());
        let agent = Arc::new(new_agent(rx, sent.clone(), handler));

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run_persistent().await })
        };

        // Let the agent connect and send join-room, then accept it.
        tokio::task::yield_now().await;
        tx.send(WsMessage::Text(joined_frame())).unwrap();
        tokio::task::yield_now().await;

        agent.queue_document_update(b"e1".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.queue_document_update(b"e2".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.queue_document_update(b"e3".to_vec());

        // Past the 250ms window (measured from the first edit)
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        let types = sent_types(&sent);
        assert_eq!(types[0], "join-room");
        assert_eq!(
            types.iter().filter(|t| *t == "editor:document-update").count(),
            1
        );

        agent.shutdown();
        tx.send(WsMessage::Close).ok();
        let _ = runner.await;
    }

    #[tokio::test(start_paused = true)]
    async fn awareness_flush_carries_latest_field_values() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler::default());
        let agent = Arc::new(new_agent(rx, sent.clone(), handler));

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run_persistent().await })
        };
        tokio::task::yield_now().await;
        tx.send(WsMessage::Text(joined_frame())).unwrap();
        tokio::task::yield_now().await;

        agent.set_awareness_field("cursor", b"1:1".to_vec());
        agent.set_awareness_field("cursor", b"1:9".to_vec());

        tokio::time::sleep(Duration::from_millis(450)).await;
        tokio::task::yield_now().await;

        let frames = sent.lock().unwrap().clone();
        let awareness: Vec<_> = frames
            .iter()
            .filter(|f| f.contains("editor:awareness-update"))
            .collect();
        assert_eq!(awareness.len(), 1);

        // The payload is our own encoding, so the test may decode it.
        let v: serde_json::Value = serde_json::from_str(awareness[0]).unwrap();
        let bytes = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(v["awareness"].as_str().unwrap())
                .unwrap()
        };
        let snapshot: std::collections::BTreeMap<String, String> =
            serde_json::from_slice(&bytes).unwrap();
        use base64::Engine;
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(&snapshot["cursor"])
                .unwrap(),
            b"1:9".to_vec()
        );

        agent.shutdown();
        tx.send(WsMessage::Close).ok();
        let _ = runner.await;
    }

    #[tokio::test(start_paused = true)]
    async fn edits_made_while_disconnected_flush_once_after_rejoin() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler::default());

        let connector = ScriptedConnector::new(vec![
            ScriptedTransport {
                incoming: rx1,
                sent: sent.clone(),
            },
            ScriptedTransport {
                incoming: rx2,
                sent: sent.clone(),
            },
        ]);
        let config = AgentConfig::new(
            "ws://test/ws".to_string(),
            "room-1".to_string(),
            "ada".to_string(),
        );
        let agent = Arc::new(SyncAgent::new(
            config,
            connector,
            Arc::new(ConcatMerger),
            handler,
            SessionCache::new(MemorySessionStore::new()),
        ));

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run_persistent().await })
        };
        tokio::task::yield_now().await;
        tx1.send(WsMessage::Text(joined_frame())).unwrap();
        tokio::task::yield_now().await;

        // Edits land, then the connection drops before the window elapses
        agent.queue_document_update(b"e1".to_vec());
        agent.queue_document_update(b"e2".to_vec());
        tx1.send(WsMessage::Close).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(
            sent_types(&sent)
                .iter()
                .filter(|t| *t == "editor:document-update")
                .count(),
            0,
            "nothing goes out while disconnected"
        );

        // Ride out the reconnect backoff, accept the rejoin, and let the
        // re-armed window elapse.
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx2.send(WsMessage::Text(joined_frame())).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;

        let types = sent_types(&sent);
        assert_eq!(types.iter().filter(|t| *t == "join-room").count(), 2);
        assert_eq!(
            types
                .iter()
                .filter(|t| *t == "editor:document-update")
                .count(),
            1,
            "the backlog flushes as one merged update"
        );

        agent.shutdown();
        tx2.send(WsMessage::Close).ok();
        let _ = runner.await;
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_deltas_are_applied_immediately() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler::default());
        let agent = Arc::new(new_agent(rx, sent.clone(), handler.clone()));

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run_persistent().await })
        };
        tokio::task::yield_now().await;
        tx.send(WsMessage::Text(joined_frame())).unwrap();

        let remote = serde_json::to_string(&ServerEvent::DocumentUpdate {
            update: vec![1, 2, 3],
            user_id: "u2".to_string(),
        })
        .unwrap();
        tx.send(WsMessage::Text(remote)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let events = handler.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::RemoteUpdate { update, user_id }
                if update == &vec![1, 2, 3] && user_id == "u2"
        )));
        drop(events);

        agent.shutdown();
        tx.send(WsMessage::Close).ok();
        let _ = runner.await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_join_ends_the_agent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler::default());
        let agent = Arc::new(new_agent(rx, sent.clone(), handler.clone()));

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run_persistent().await })
        };
        tokio::task::yield_now().await;

        let rejected =
            serde_json::to_string(&ServerEvent::join_rejected(ErrorCode::RoomFull)).unwrap();
        tx.send(WsMessage::Text(rejected)).unwrap();

        // The agent must terminate on its own (no reconnect on admission errors).
        runner.await.unwrap();

        let events = handler.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ServerError { code: ErrorCode::RoomFull, .. }
        )));
    }
}
