//! Persistent WebSocket connection management.
//!
//! One [`ConnectionManager`] owns one logical collaboration session:
//! a single transport handle, its heartbeat and reconnect timers, and a
//! bounded outbound queue. Multiple sessions require multiple instances.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Connected
//!       ▲                         │                   │
//!       │ disconnect()            │ failure           │ unexpected close
//!       │                         ▼                   ▼
//!       └──────────────────── Reconnecting ◄── schedule_reconnect()
//!                                 │
//!                                 │ attempts exhausted
//!                                 ▼
//!                               Error  (terminal until connect())
//! ```
//!
//! Delivery contract: `send_message` transmits when connected and queues
//! otherwise; queued frames are flushed oldest-first on (re)connect,
//! dropped after 5 minutes or 3 failed retries, and the oldest entry is
//! evicted when the queue overflows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    build_session_url, ClientMessage, DocumentActivityData, ServerMessage, UserPresenceData,
};

/// Queued frames older than this are dropped at flush time, never
/// retransmitted.
pub const QUEUE_MESSAGE_TTL: Duration = Duration::from_secs(300);

/// A message is permanently dropped after this many failed flush retries.
pub const MAX_SEND_RETRIES: u32 = 3;

/// Hard cap on the exponential reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

const WRITER_CHANNEL_CAPACITY: usize = 256;
const NOTIFY_CHANNEL_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection lifecycle state. Exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Configuration for one collaboration session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Base HTTP(S) address of the collaboration server; upgraded to its
    /// WebSocket scheme when connecting.
    pub base_url: String,
    pub project_id: i32,
    /// Optional auth token attached to the session URL.
    pub token: Option<String>,
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay, doubled per attempt up to
    /// [`MAX_RECONNECT_DELAY`].
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    pub message_queue_size: usize,
}

impl ConnectionConfig {
    pub fn new(base_url: impl Into<String>, project_id: i32) -> Self {
        Self {
            base_url: base_url.into(),
            project_id,
            token: None,
            max_reconnect_attempts: 10,
            reconnect_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(30_000),
            message_queue_size: 100,
        }
    }
}

/// Notifications delivered to UI subscribers.
///
/// Any number of listeners may subscribe; registering a new one never
/// displaces an existing one.
#[derive(Debug, Clone)]
pub enum CollabNotification {
    /// Fires exactly once per distinct state transition.
    StateChanged(ConnectionState),
    UserPresence(UserPresenceData),
    BulkPresence(Vec<UserPresenceData>),
    DocumentActivity(DocumentActivityData),
    Error(String),
}

/// Result of a send attempt. `Queued` is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

/// Compute the backoff delay for the given attempt number.
///
/// `min(base × 2^attempts, 30s)`.
pub fn reconnect_delay(attempts: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempts.min(16));
    base.saturating_mul(factor).min(MAX_RECONNECT_DELAY)
}

/// An outbound frame waiting for the connection to come back.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: ClientMessage,
    pub enqueued_at: Instant,
    pub retry_count: u32,
}

/// Bounded FIFO queue for outbound messages.
///
/// Overflow evicts the oldest entry — recency beats completeness for
/// transient traffic like cursor positions.
pub struct MessageQueue {
    queue: VecDeque<QueuedMessage>,
    max_size: usize,
}

impl MessageQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Enqueue a fresh message. Returns `true` if an older entry was
    /// evicted to make room.
    pub fn push(&mut self, message: ClientMessage) -> bool {
        let evicted = if self.queue.len() >= self.max_size {
            self.queue.pop_front();
            true
        } else {
            false
        };
        self.queue.push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
            retry_count: 0,
        });
        evicted
    }

    /// Put a failed flush back with its retry count incremented.
    /// Returns `false` when the message has exhausted its retries and was
    /// dropped instead.
    pub fn requeue(&mut self, mut entry: QueuedMessage) -> bool {
        entry.retry_count += 1;
        if entry.retry_count >= MAX_SEND_RETRIES {
            return false;
        }
        if self.queue.len() >= self.max_size {
            self.queue.pop_front();
        }
        self.queue.push_back(entry);
        true
    }

    /// Drain everything, keeping only entries younger than `ttl` —
    /// stale entries are dropped here, never retransmitted.
    pub fn drain_fresh(&mut self, ttl: Duration) -> Vec<QueuedMessage> {
        self.queue
            .drain(..)
            .filter(|m| m.enqueued_at.elapsed() <= ttl)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.queue.iter()
    }

    #[cfg(test)]
    fn backdate_all(&mut self, age: Duration) {
        for entry in &mut self.queue {
            entry.enqueued_at -= age;
        }
    }
}

#[derive(Default)]
struct TaskHandles {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct ConnectionInner {
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    queue: Mutex<MessageQueue>,
    /// Channel into the writer task; present only while a transport lives.
    writer_tx: Mutex<Option<mpsc::Sender<Message>>>,
    reconnect_attempts: AtomicU32,
    intentional_disconnect: AtomicBool,
    notify_tx: broadcast::Sender<CollabNotification>,
    tasks: Mutex<TaskHandles>,
}

/// Manages one persistent duplex connection to the collaboration server.
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        let queue_size = config.message_queue_size;
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                queue: Mutex::new(MessageQueue::new(queue_size)),
                writer_tx: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                intentional_disconnect: AtomicBool::new(false),
                notify_tx,
                tasks: Mutex::new(TaskHandles::default()),
            }),
        }
    }

    /// Subscribe to connection notifications. Every subscriber receives
    /// every notification independently.
    pub fn subscribe(&self) -> broadcast::Receiver<CollabNotification> {
        self.inner.notify_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn queued_message_count(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Open the session connection.
    ///
    /// Outcomes are reported through the notification stream: state
    /// changes on success, an error notification (and reconnect
    /// scheduling) on failure. Calling while already connected is a no-op.
    pub async fn connect(&self) {
        self.inner
            .intentional_disconnect
            .store(false, Ordering::SeqCst);
        // A manual connect supersedes any scheduled retry.
        if let Some(handle) = self.inner.tasks.lock().await.reconnect.take() {
            handle.abort();
        }
        let state = *self.inner.state.read().await;
        if matches!(state, ConnectionState::Connected | ConnectionState::Connecting) {
            return;
        }
        self.inner.clone().connect_inner().await;
    }

    /// Send a message now, or queue it for the next flush.
    ///
    /// Never blocks on network I/O; the writer task owns the socket.
    pub async fn send_message(&self, message: ClientMessage) -> SendOutcome {
        self.inner.send_or_queue(message).await
    }

    /// Announce this client within the project session.
    pub async fn join_session(
        &self,
        client_id: impl Into<String>,
        user_name: impl Into<String>,
        avatar_color: Option<String>,
        document_id: Option<String>,
    ) -> SendOutcome {
        self.send_message(ClientMessage::join_session(
            client_id,
            user_name,
            avatar_color,
            document_id,
        ))
        .await
    }

    /// Broadcast the local cursor position for a document.
    pub async fn update_cursor(
        &self,
        document_id: &str,
        x: f64,
        y: f64,
        selected_node_id: Option<String>,
    ) -> SendOutcome {
        self.send_message(ClientMessage::cursor_update(
            document_id,
            x,
            y,
            selected_node_id,
            Utc::now().timestamp_millis(),
        ))
        .await
    }

    pub async fn switch_document(&self, document_id: &str) -> SendOutcome {
        self.send_message(ClientMessage::switch_document(document_id))
            .await
    }

    pub async fn leave_session(&self, document_id: Option<String>) -> SendOutcome {
        self.send_message(ClientMessage::leave_session(document_id))
            .await
    }

    /// Close the session intentionally.
    ///
    /// Idempotent. Cancels the reconnect and heartbeat timers before
    /// returning, sends a normal-closure frame, and transitions to
    /// `Disconnected` with no reconnect.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.intentional_disconnect.store(true, Ordering::SeqCst);
        {
            let mut tasks = inner.tasks.lock().await;
            if let Some(handle) = tasks.reconnect.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.heartbeat.take() {
                handle.abort();
            }
        }
        if let Some(tx) = inner.writer_tx.lock().await.take() {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            }));
            let _ = tx.try_send(close);
        }
        inner.set_state(ConnectionState::Disconnected).await;
    }
}

impl ConnectionInner {
    /// Transition states, notifying exactly once per distinct change.
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == next {
            return;
        }
        let previous = *state;
        *state = next;
        drop(state);
        log::debug!("Connection state {previous:?} -> {next:?}");
        let _ = self.notify_tx.send(CollabNotification::StateChanged(next));
    }

    fn notify_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        let _ = self.notify_tx.send(CollabNotification::Error(message));
    }

    fn connect_inner(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.connect_inner_impl())
    }

    async fn connect_inner_impl(self: Arc<Self>) {
        // A scheduled retry stays visibly Reconnecting until the open
        // succeeds; a fresh connect shows Connecting.
        if *self.state.read().await != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting).await;
        }

        let url = match build_session_url(
            &self.config.base_url,
            self.config.project_id,
            self.config.token.as_deref(),
        ) {
            Ok(url) => url,
            Err(e) => {
                self.notify_error(format!("Failed to build session URL: {e}"));
                self.set_state(ConnectionState::Error).await;
                return;
            }
        };

        match tokio_tungstenite::connect_async(&url).await {
            Ok((mut ws_stream, _)) => {
                if self.intentional_disconnect.load(Ordering::SeqCst) {
                    // disconnect() raced the handshake; honor it.
                    let _ = ws_stream.close(None).await;
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }

                let (ws_sink, ws_source) = ws_stream.split();
                let (out_tx, out_rx) = mpsc::channel::<Message>(WRITER_CHANNEL_CAPACITY);
                *self.writer_tx.lock().await = Some(out_tx);

                let writer = tokio::spawn(Self::writer_loop(ws_sink, out_rx));
                let reader = tokio::spawn(Self::reader_loop(self.clone(), ws_source));
                let heartbeat = tokio::spawn(Self::heartbeat_loop(self.clone()));
                {
                    let mut tasks = self.tasks.lock().await;
                    for old in [
                        tasks.writer.replace(writer),
                        tasks.reader.replace(reader),
                        tasks.heartbeat.replace(heartbeat),
                    ]
                    .into_iter()
                    .flatten()
                    {
                        old.abort();
                    }
                }

                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected).await;
                log::info!("Collaboration session connected ({url})");
                self.flush_queue().await;
            }
            Err(e) => {
                self.notify_error(format!("Connection failed: {e}"));
                self.schedule_reconnect().await;
            }
        }
    }

    /// Forward outbound frames from the channel onto the socket.
    async fn writer_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    }

    /// Parse and dispatch inbound frames until the transport closes.
    async fn reader_loop(inner: Arc<Self>, mut source: WsSource) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => inner.dispatch_frame(text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // binary and control frames are not part of the protocol
                Err(e) => {
                    log::warn!("WebSocket read error: {e}");
                    break;
                }
            }
        }
        inner.handle_transport_closed().await;
    }

    /// Route one inbound frame. Malformed frames are reported, never
    /// fatal — the connection stays open.
    fn dispatch_frame(&self, text: &str) {
        match ServerMessage::decode(text) {
            Ok(ServerMessage::UserPresence { data }) => {
                let _ = self.notify_tx.send(CollabNotification::UserPresence(data));
            }
            Ok(ServerMessage::BulkPresence { data }) => {
                let _ = self.notify_tx.send(CollabNotification::BulkPresence(data));
            }
            Ok(ServerMessage::DocumentActivity { data }) => {
                let _ = self
                    .notify_tx
                    .send(CollabNotification::DocumentActivity(data));
            }
            Ok(ServerMessage::Error { message }) => {
                self.notify_error(format!("Server error: {message}"));
            }
            Ok(ServerMessage::Pong) => {
                log::trace!("Heartbeat acknowledged");
            }
            Err(e) => {
                self.notify_error(format!("Unparseable server frame: {e}"));
            }
        }
    }

    async fn handle_transport_closed(self: &Arc<Self>) {
        *self.writer_tx.lock().await = None;
        if let Some(handle) = self.tasks.lock().await.heartbeat.take() {
            handle.abort();
        }

        if self.intentional_disconnect.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected).await;
        } else {
            self.notify_error("Connection lost");
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        if self.intentional_disconnect.load(Ordering::SeqCst) {
            return;
        }
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= self.config.max_reconnect_attempts {
            self.notify_error(format!(
                "Giving up after {attempts} reconnect attempts"
            ));
            self.set_state(ConnectionState::Error).await;
            return;
        }

        self.set_state(ConnectionState::Reconnecting).await;
        let delay = reconnect_delay(attempts, self.config.reconnect_interval);
        log::info!(
            "Reconnecting in {}ms (attempt {} of {})",
            delay.as_millis(),
            attempts + 1,
            self.config.max_reconnect_attempts
        );

        let inner = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            inner.clone().connect_inner().await;
        });
        if let Some(old) = self.tasks.lock().await.reconnect.replace(task) {
            old.abort();
        }
    }

    /// Send a protocol-level ping every heartbeat interval while
    /// connected. A send failure here is tolerated; the close handler
    /// surfaces the real outcome.
    async fn heartbeat_loop(inner: Arc<Self>) {
        let interval = inner.config.heartbeat_interval;
        loop {
            tokio::time::sleep(interval).await;
            if *inner.state.read().await != ConnectionState::Connected {
                break;
            }
            let frame = match ClientMessage::Ping.encode() {
                Ok(json) => json,
                Err(_) => continue,
            };
            match inner.writer_tx.lock().await.clone() {
                Some(tx) => {
                    if tx.try_send(Message::Text(frame.into())).is_err() {
                        log::debug!("Heartbeat send failed; awaiting close handler");
                    } else {
                        log::trace!("Heartbeat ping sent");
                    }
                }
                None => break,
            }
        }
    }

    async fn send_or_queue(&self, message: ClientMessage) -> SendOutcome {
        if *self.state.read().await == ConnectionState::Connected {
            if let Some(tx) = self.writer_tx.lock().await.clone() {
                if let Ok(json) = message.encode() {
                    if tx.try_send(Message::Text(json.into())).is_ok() {
                        return SendOutcome::Sent;
                    }
                    // Transport raced to closed or the writer is
                    // saturated: fall through and queue for retry.
                }
            }
        }
        let evicted = self.queue.lock().await.push(message);
        if evicted {
            log::debug!("Outbound queue full; evicted oldest message");
        }
        SendOutcome::Queued
    }

    /// Flush queued messages oldest-first after a (re)connect.
    async fn flush_queue(self: &Arc<Self>) {
        let fresh = {
            let mut queue = self.queue.lock().await;
            queue.drain_fresh(QUEUE_MESSAGE_TTL)
        };
        if fresh.is_empty() {
            return;
        }
        log::info!("Flushing {} queued messages", fresh.len());

        let tx = self.writer_tx.lock().await.clone();
        for entry in fresh {
            let sent = match (&tx, entry.message.encode()) {
                (Some(tx), Ok(json)) => tx.try_send(Message::Text(json.into())).is_ok(),
                _ => false,
            };
            if !sent {
                let mut queue = self.queue.lock().await;
                if !queue.requeue(entry) {
                    log::warn!("Dropping queued message after {MAX_SEND_RETRIES} failed retries");
                }
            }
        }
    }
}
