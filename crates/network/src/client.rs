// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2025 Danmu Console Developers. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! A resilient STOMP-over-WebSocket client for live chat streams.
//!
//! The client owns one logical connection shared by the whole application.
//! Concurrent `connect` calls coalesce onto a single in-flight attempt, and
//! handler registrations are held in a registry that outlives the transport,
//! so every registered destination is replayed to the broker after a
//! reconnect. Inbound MESSAGE frames pass through a duplicate-suppression
//! cache before fan-out to handlers.
//!
//! The connection is managed by a small set of background tasks in the
//! spirit of the rest of this crate: a read task draining the socket, a
//! write task owning the sink, an optional heartbeat task, and an optional
//! controller task that reconnects with exponential backoff after an
//! unsolicited close.

use std::{
    fmt::{Debug, Formatter},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::{
    FutureExt, SinkExt, StreamExt,
    future::{BoxFuture, Shared},
    stream::{SplitSink, SplitStream},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use ustr::Ustr;

use crate::{
    backoff::ExponentialBackoff,
    dedup::DedupCache,
    error::StompError,
    message::{ChatHandler, ChatMessage},
    mode::ConnectionState,
    registry::{RemoveOutcome, SubscriptionRegistry},
    stomp::{HEARTBEAT_FRAME, StompCommand, StompFrame},
};

type MessageWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type MessageReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type ConnectFuture = Shared<BoxFuture<'static, Result<(), StompError>>>;

const DISCONNECT_RECEIPT_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Reconnect scheduling parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub delay_initial_ms: u64,
    pub delay_max_ms: u64,
    pub backoff_factor: f64,
    pub jitter_ms: u64,
    /// Fire the first reconnect attempt without delay.
    pub immediate_first: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_initial_ms: 2_000,
            delay_max_ms: 30_000,
            backoff_factor: 1.5,
            jitter_ms: 100,
            immediate_first: true,
        }
    }
}

/// Configuration for [`StompClient`].
///
/// All intervals are in milliseconds. `heartbeat_incoming_ms` is advertised
/// to the broker during the handshake; enforcement of broker liveness is
/// left to the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StompConfig {
    /// WebSocket endpoint, e.g. `ws://host:port/ws`.
    pub url: String,
    /// Extra headers appended to the CONNECT frame (host, credentials).
    pub connect_headers: Vec<(String, String)>,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    /// Upper bound on one connection attempt (upgrade plus handshake).
    pub connect_timeout_ms: u64,
    /// Reconnect automatically after an unsolicited close when set.
    pub reconnect: Option<ReconnectPolicy>,
    /// Window within which a repeated message is suppressed.
    pub dedup_suppression_ms: u64,
    /// How long a message fingerprint is retained.
    pub dedup_retention_ms: u64,
    /// How often expired fingerprints are swept.
    pub dedup_sweep_interval_ms: u64,
}

impl StompConfig {
    /// Creates a configuration for `url` with production defaults.
    #[must_use]
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            connect_headers: Vec::new(),
            heartbeat_outgoing_ms: 10_000,
            heartbeat_incoming_ms: 10_000,
            connect_timeout_ms: 10_000,
            reconnect: Some(ReconnectPolicy::default()),
            dedup_suppression_ms: 10_000,
            dedup_retention_ms: 60_000,
            dedup_sweep_interval_ms: 30_000,
        }
    }
}

impl Default for StompConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// Background tasks and the writer channel for one transport session.
struct Session {
    writer_tx: tokio::sync::mpsc::UnboundedSender<Message>,
    read_task: tokio::task::JoinHandle<()>,
    write_task: tokio::task::JoinHandle<()>,
    heartbeat_task: Option<tokio::task::JoinHandle<()>>,
}

impl Session {
    fn abort(&self) {
        self.read_task.abort();
        self.write_task.abort();
        if let Some(task) = &self.heartbeat_task {
            task.abort();
        }
    }
}

struct ClientInner {
    cfg: StompConfig,
    state: Arc<AtomicU8>,
    /// Set by `disconnect`; suppresses reconnection and new sessions.
    stopped: AtomicBool,
    /// Set by `close`; the client is permanently out of service.
    closed: AtomicBool,
    /// Set after an unsolicited close; consumed by the controller task.
    reconnect_pending: AtomicBool,
    registry: SubscriptionRegistry,
    dedup: Arc<DedupCache>,
    session: Mutex<Option<Session>>,
    /// Resolved by the read task when the broker acknowledges a DISCONNECT.
    disconnect_receipt: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    /// Active protocol subscription id per destination, scoped to the session.
    proto_subs: DashMap<Ustr, u64>,
    sub_seq: AtomicU64,
    /// The in-flight connect attempt shared by all concurrent callers.
    pending_connect: tokio::sync::Mutex<Option<ConnectFuture>>,
}

impl ClientInner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_disconnect_receipt(
        &self,
    ) -> MutexGuard<'_, Option<tokio::sync::oneshot::Sender<()>>> {
        self.disconnect_receipt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects, coalescing concurrent callers onto one attempt.
    ///
    /// Every caller observes the outcome of the single attempt; a new
    /// attempt only starts once the previous one has resolved.
    async fn connect(inner: &Arc<Self>) -> Result<(), StompError> {
        if ConnectionState::from_atomic(&inner.state).is_connected() {
            return Ok(());
        }

        let attempt = {
            let mut pending = inner.pending_connect.lock().await;
            if let Some(shared) = pending.as_ref() {
                shared.clone()
            } else {
                let owner = inner.clone();
                let shared = async move {
                    let result = Self::try_connect(&owner).await;
                    owner.pending_connect.lock().await.take();
                    result
                }
                .boxed()
                .shared();
                *pending = Some(shared.clone());
                shared
            }
        };

        attempt.await
    }

    async fn try_connect(inner: &Arc<Self>) -> Result<(), StompError> {
        inner
            .state
            .store(ConnectionState::Connecting.as_u8(), Ordering::SeqCst);

        let timeout_ms = inner.cfg.connect_timeout_ms;
        let result = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            Self::establish(inner),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StompError::Timeout(timeout_ms)),
        };

        if let Err(e) = &result {
            inner
                .state
                .store(ConnectionState::Disconnected.as_u8(), Ordering::SeqCst);
            tracing::error!("Connection attempt failed: {e}");
        }
        result
    }

    /// Performs the WebSocket upgrade and STOMP handshake, then installs the
    /// session tasks and replays registered destinations.
    async fn establish(inner: &Arc<Self>) -> Result<(), StompError> {
        let cfg = &inner.cfg;
        tracing::debug!(url = %cfg.url, "Connecting");

        let (ws_stream, _) = connect_async(cfg.url.as_str()).await?;
        let (mut writer, mut reader) = ws_stream.split();

        let connect_frame = StompFrame::connect(
            cfg.heartbeat_outgoing_ms,
            cfg.heartbeat_incoming_ms,
            &cfg.connect_headers,
        );
        writer.send(Message::text(connect_frame.to_wire())).await?;

        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => match StompFrame::parse(text.as_str())? {
                    None => continue, // Heartbeat
                    Some(frame) => match frame.command {
                        StompCommand::Connected => break,
                        StompCommand::Error => {
                            let reason = frame
                                .header("message")
                                .map_or_else(|| frame.body.clone(), ToString::to_string);
                            return Err(StompError::Handshake(reason));
                        }
                        other => {
                            return Err(StompError::Protocol(format!(
                                "unexpected {other} frame during handshake"
                            )));
                        }
                    },
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(StompError::Transport(
                        "connection closed during handshake".to_string(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }

        if inner.stopped.load(Ordering::SeqCst) {
            let _ = writer.close().await;
            return Err(StompError::ClientClosed);
        }

        let (writer_tx, writer_rx) = tokio::sync::mpsc::unbounded_channel();
        let write_task = Self::spawn_write_task(inner.clone(), writer, writer_rx);
        let read_task = Self::spawn_read_task(inner.clone(), reader, writer_tx.clone());
        let heartbeat_task = (cfg.heartbeat_outgoing_ms > 0).then(|| {
            Self::spawn_heartbeat_task(inner.clone(), cfg.heartbeat_outgoing_ms, writer_tx.clone())
        });

        let session = Session {
            writer_tx,
            read_task,
            write_task,
            heartbeat_task,
        };
        if let Some(old) = inner.lock_session().replace(session) {
            old.abort();
        }

        inner
            .state
            .store(ConnectionState::Connected.as_u8(), Ordering::SeqCst);
        tracing::info!(url = %cfg.url, "STOMP session established");

        Self::reconcile_subscriptions(inner);
        Ok(())
    }

    /// Re-issues a protocol subscription for every registered destination.
    ///
    /// Runs on every successful connect so handlers registered while
    /// disconnected start receiving as soon as the session is up.
    fn reconcile_subscriptions(inner: &Arc<Self>) {
        inner.proto_subs.clear();
        let destinations = inner.registry.destinations();
        tracing::debug!(count = destinations.len(), "Reconciling subscriptions");
        for destination in destinations {
            Self::protocol_subscribe(inner, destination);
        }
    }

    /// Sends a SUBSCRIBE for `destination` unless one is already active.
    fn protocol_subscribe(inner: &Arc<Self>, destination: Ustr) {
        if let Entry::Vacant(entry) = inner.proto_subs.entry(destination) {
            let id = inner.sub_seq.fetch_add(1, Ordering::SeqCst);
            if Self::send_frame(inner, &StompFrame::subscribe(id, destination.as_str())) {
                entry.insert(id);
            }
        }
    }

    /// Queues `frame` on the session writer. Returns `false` if there is no
    /// session or the writer task has gone away.
    fn send_frame(inner: &Self, frame: &StompFrame) -> bool {
        let guard = inner.lock_session();
        match guard.as_ref() {
            Some(session) => match session.writer_tx.send(Message::text(frame.to_wire())) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Failed to queue {} frame: {e}", frame.command);
                    false
                }
            },
            None => {
                tracing::warn!("No active session to send {} frame", frame.command);
                false
            }
        }
    }

    /// Tears down after a close the client did not request. The registry is
    /// preserved for replay; protocol subscription state is dropped with the
    /// dead session.
    fn handle_unsolicited_close(inner: &Arc<Self>) {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        // Only the first task to observe the drop performs the teardown
        if inner
            .state
            .compare_exchange(
                ConnectionState::Connected.as_u8(),
                ConnectionState::Disconnected.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        tracing::warn!("Connection closed unexpectedly");
        inner.proto_subs.clear();
        if let Some(session) = inner.lock_session().take() {
            session.abort();
        }
        if inner.cfg.reconnect.is_some() {
            inner.reconnect_pending.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_read_task(
        inner: Arc<Self>,
        mut reader: MessageReader,
        writer_tx: tokio::sync::mpsc::UnboundedSender<Message>,
    ) -> tokio::task::JoinHandle<()> {
        tracing::debug!("Started task 'read'");

        // Interval between checking the stop flag
        let check_interval = Duration::from_millis(10);

        tokio::spawn(async move {
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    tracing::debug!("Stopped - terminating read task");
                    return;
                }

                match tokio::time::timeout(check_interval, reader.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => Self::handle_text(&inner, text.as_str()),
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let _ = writer_tx.send(Message::Pong(payload));
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        tracing::debug!("Received close frame: {frame:?}");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        tracing::error!("Transport read error - terminating: {e}");
                        break;
                    }
                    Ok(None) => {
                        tracing::debug!("Transport stream ended - terminating");
                        break;
                    }
                    Err(_) => {
                        // Timeout - continue loop and check the stop flag
                        continue;
                    }
                }
            }

            Self::handle_unsolicited_close(&inner);
            tracing::debug!("Completed task 'read'");
        })
    }

    /// Routes one inbound text message: heartbeats are dropped, MESSAGE
    /// frames are decoded, gated through the dedup cache, and fanned out.
    /// Malformed frames and payloads are logged and skipped without
    /// disturbing the session.
    fn handle_text(inner: &Arc<Self>, text: &str) {
        let frame = match StompFrame::parse(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::trace!("Received heartbeat");
                return;
            }
            Err(e) => {
                tracing::warn!("Discarding invalid frame: {e}");
                return;
            }
        };

        match frame.command {
            StompCommand::Message => {
                let Some(destination) = frame.header("destination") else {
                    tracing::warn!("Discarding MESSAGE frame without destination");
                    return;
                };
                let destination = Ustr::from(destination);

                match serde_json::from_str::<ChatMessage>(&frame.body) {
                    Ok(message) => {
                        if inner.dedup.should_deliver(&message) {
                            let delivered = inner.registry.dispatch(destination, &message);
                            tracing::trace!(%destination, delivered, "Dispatched message");
                        } else {
                            tracing::debug!(%destination, "Suppressed duplicate message");
                        }
                    }
                    Err(e) => tracing::warn!(%destination, "Discarding malformed payload: {e}"),
                }
            }
            StompCommand::Error => {
                let reason = frame.header("message").unwrap_or(&frame.body);
                tracing::error!("Broker reported error: {reason}");
            }
            StompCommand::Receipt => {
                let receipt_id = frame.header("receipt-id");
                tracing::debug!(receipt = receipt_id, "Received receipt");
                if receipt_id == Some("disconnect")
                    && let Some(tx) = inner.lock_disconnect_receipt().take()
                {
                    let _ = tx.send(());
                }
            }
            other => tracing::debug!("Ignoring {other} frame"),
        }
    }

    fn spawn_write_task(
        inner: Arc<Self>,
        writer: MessageWriter,
        mut writer_rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
    ) -> tokio::task::JoinHandle<()> {
        tracing::debug!("Started task 'write'");

        // Interval between checking the stop flag
        let check_interval = Duration::from_millis(10);

        tokio::spawn(async move {
            let mut writer = writer;

            loop {
                match tokio::time::timeout(check_interval, writer_rx.recv()).await {
                    Ok(Some(msg)) => {
                        if let Err(e) = writer.send(msg).await {
                            tracing::error!("Failed to send message: {e}");
                            Self::handle_unsolicited_close(&inner);
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("Writer channel closed - terminating");
                        break;
                    }
                    Err(_) => {
                        if inner.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        continue;
                    }
                }
            }

            // The writer may already be closed
            let _ = writer.close().await;
            tracing::debug!("Completed task 'write'");
        })
    }

    fn spawn_heartbeat_task(
        inner: Arc<Self>,
        interval_ms: u64,
        writer_tx: tokio::sync::mpsc::UnboundedSender<Message>,
    ) -> tokio::task::JoinHandle<()> {
        tracing::debug!("Started task 'heartbeat'");

        tokio::spawn(async move {
            let interval = Duration::from_millis(interval_ms);

            loop {
                tokio::time::sleep(interval).await;

                if inner.stopped.load(Ordering::SeqCst)
                    || !ConnectionState::from_atomic(&inner.state).is_connected()
                {
                    break;
                }

                if writer_tx.send(Message::text(HEARTBEAT_FRAME.to_string())).is_err() {
                    break;
                }
                tracing::trace!("Sent heartbeat");
            }

            tracing::debug!("Completed task 'heartbeat'");
        })
    }

    /// Retries connection with exponential backoff whenever an unsolicited
    /// close has been flagged. The backoff resets after a successful
    /// reconnect so the next outage starts from the initial delay.
    fn spawn_controller_task(
        inner: Arc<Self>,
        policy: ReconnectPolicy,
    ) -> tokio::task::JoinHandle<()> {
        tracing::debug!("Started task 'controller'");

        let check_interval = Duration::from_millis(50);

        tokio::spawn(async move {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(policy.delay_initial_ms),
                Duration::from_millis(policy.delay_max_ms),
                policy.backoff_factor,
                policy.jitter_ms,
                policy.immediate_first,
            );

            loop {
                tokio::time::sleep(check_interval).await;

                while inner.reconnect_pending.load(Ordering::SeqCst) {
                    if inner.stopped.load(Ordering::SeqCst) {
                        inner.reconnect_pending.store(false, Ordering::SeqCst);
                        break;
                    }

                    let delay = backoff.next_duration();
                    if !delay.is_zero() {
                        tracing::debug!("Next reconnect attempt in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }

                    match Self::connect(&inner).await {
                        Ok(()) => {
                            tracing::info!("Reconnected");
                            inner.reconnect_pending.store(false, Ordering::SeqCst);
                            backoff.reset();
                        }
                        Err(e) => tracing::warn!("Reconnect attempt failed: {e}"),
                    }
                }
            }
        })
    }
}

impl Debug for ClientInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(ClientInner))
            .field("url", &self.cfg.url)
            .field("state", &ConnectionState::from_atomic(&self.state))
            .field("destinations", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// The shared STOMP messaging client.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Dropping the
/// client aborts its background tasks.
pub struct StompClient {
    inner: Arc<ClientInner>,
    sweep_task: tokio::task::JoinHandle<()>,
    controller_task: Option<tokio::task::JoinHandle<()>>,
}

impl StompClient {
    /// Creates a client from `config` and spawns its maintenance tasks.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(config: StompConfig) -> Self {
        let dedup = Arc::new(DedupCache::new(
            Duration::from_millis(config.dedup_suppression_ms),
            Duration::from_millis(config.dedup_retention_ms),
        ));
        let sweep_interval = Duration::from_millis(config.dedup_sweep_interval_ms);
        let reconnect = config.reconnect;

        let inner = Arc::new(ClientInner {
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected.as_u8())),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            registry: SubscriptionRegistry::new(),
            dedup: dedup.clone(),
            session: Mutex::new(None),
            disconnect_receipt: Mutex::new(None),
            proto_subs: DashMap::new(),
            sub_seq: AtomicU64::new(1),
            pending_connect: tokio::sync::Mutex::new(None),
            cfg: config,
        });

        let sweep_task = DedupCache::spawn_sweep_task(dedup, sweep_interval);
        let controller_task =
            reconnect.map(|policy| ClientInner::spawn_controller_task(inner.clone(), policy));

        Self {
            inner,
            sweep_task,
            controller_task,
        }
    }

    /// Connects to the broker, reusing any attempt already in flight.
    ///
    /// Returns `Ok` immediately when already connected. On success every
    /// registered destination has been (re)subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`StompError::ClientClosed`] after [`Self::close`], and any
    /// error from the WebSocket upgrade or STOMP handshake, including
    /// timeout. All concurrent callers receive the same outcome.
    pub async fn connect(&self) -> Result<(), StompError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StompError::ClientClosed);
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        ClientInner::connect(&self.inner).await
    }

    /// Registers `handler` for `destination` and returns the subscription
    /// guard that removes it.
    ///
    /// Works in any connection state; while disconnected the registration is
    /// held for replay on the next connect. The first handler for a
    /// destination triggers the protocol-level SUBSCRIBE, further handlers
    /// share it.
    #[must_use = "dropping the subscription unsubscribes the handler"]
    pub fn subscribe(&self, destination: &str, handler: ChatHandler) -> Subscription {
        let destination = Ustr::from(destination);
        let slot = self.inner.sub_seq.fetch_add(1, Ordering::SeqCst);
        let first = self.inner.registry.insert(destination, slot, handler);

        if first && self.connection_state().is_connected() {
            ClientInner::protocol_subscribe(&self.inner, destination);
        }
        tracing::debug!(%destination, first, "Registered handler");

        Subscription {
            inner: self.inner.clone(),
            destination,
            slot,
            active: AtomicBool::new(true),
        }
    }

    /// Disconnects and resets the client to a clean slate.
    ///
    /// All handlers are dropped and no reconnection is attempted; this is a
    /// deliberate teardown, unlike an unsolicited close which preserves the
    /// registry for replay. The client can connect again afterwards.
    pub async fn disconnect(&self) {
        self.inner.reconnect_pending.store(false, Ordering::SeqCst);

        if self.connection_state().is_connected() {
            let ids: Vec<u64> = self.inner.proto_subs.iter().map(|e| *e.value()).collect();
            for id in ids {
                let _ = ClientInner::send_frame(&self.inner, &StompFrame::unsubscribe(id));
            }

            let (receipt_tx, receipt_rx) = tokio::sync::oneshot::channel();
            *self.inner.lock_disconnect_receipt() = Some(receipt_tx);
            let _ = ClientInner::send_frame(&self.inner, &StompFrame::disconnect());

            // Wait for the broker to acknowledge the DISCONNECT, bounded so
            // a dead peer cannot stall teardown. The receipt also confirms
            // the preceding UNSUBSCRIBE frames were flushed in order.
            if tokio::time::timeout(DISCONNECT_RECEIPT_TIMEOUT, receipt_rx)
                .await
                .is_err()
            {
                tracing::debug!("Timed out waiting for disconnect receipt");
            }
            self.inner.lock_disconnect_receipt().take();
        }

        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.proto_subs.clear();
        self.inner.registry.clear();
        self.inner
            .state
            .store(ConnectionState::Disconnected.as_u8(), Ordering::SeqCst);
        if let Some(session) = self.inner.lock_session().take() {
            session.abort();
        }
        tracing::debug!("Disconnected");
    }

    /// Disconnects and shuts down the maintenance tasks. The client is
    /// permanently out of service afterwards; `connect` returns
    /// [`StompError::ClientClosed`].
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.disconnect().await;
        if let Some(task) = &self.controller_task {
            task.abort();
        }
        self.sweep_task.abort();
        tracing::debug!("Closed");
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_atomic(&self.inner.state)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Returns the number of destinations with at least one handler.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Returns the number of handlers registered for `destination`.
    #[must_use]
    pub fn handler_count(&self, destination: &str) -> usize {
        self.inner.registry.handler_count(Ustr::from(destination))
    }
}

impl Debug for StompClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(StompClient))
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Drop for StompClient {
    fn drop(&mut self) {
        self.sweep_task.abort();
        if let Some(task) = &self.controller_task {
            task.abort();
        }
        if let Some(session) = self.inner.lock_session().take() {
            session.abort();
        }
    }
}

/// Guard for one registered handler.
///
/// Unsubscribing (or dropping the guard) removes the handler; the
/// protocol-level subscription is torn down only when the last handler for
/// the destination goes away.
pub struct Subscription {
    inner: Arc<ClientInner>,
    destination: Ustr,
    slot: u64,
    active: AtomicBool,
}

impl Subscription {
    #[must_use]
    pub fn destination(&self) -> &str {
        self.destination.as_str()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes the handler. Idempotent; repeated calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let inner = &self.inner;
        let destination = self.destination;
        // The protocol teardown runs under the registry entry lock so a
        // concurrent subscribe for this destination cannot observe the old
        // protocol handle and skip its own SUBSCRIBE.
        let outcome = inner.registry.remove_with(destination, self.slot, || {
            if let Some((_, id)) = inner.proto_subs.remove(&destination)
                && ConnectionState::from_atomic(&inner.state).is_connected()
            {
                let _ = ClientInner::send_frame(inner, &StompFrame::unsubscribe(id));
            }
        });

        match outcome {
            RemoveOutcome::RemovedLast => {
                tracing::debug!(%destination, "Last handler removed");
            }
            RemoveOutcome::Removed => {}
            // The registry was already cleared by a disconnect
            RemoveOutcome::NotFound => {}
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(Subscription))
            .field("destination", &self.destination)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
