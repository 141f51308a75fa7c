//! Push channel: one long-lived WebSocket per client instance, with automatic
//! reconnect and an observable connection status.
//!
//! The session token is presented once per handshake as a bearer credential
//! on the upgrade request and is re-read from the provider on every attempt.
//! It is never written to a log line or a status value.

use crate::{error::SyncError, session::SessionTokenProvider};
use carelink_core::{
    wire::{
        decode_envelope, encode_frame, PingPayload, WelcomePayload, WireEnvelope, WireMsg,
        DEFAULT_MAX_FRAME_BYTES,
    },
    Role,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    runtime::Handle,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFault {
    NoSession,
    /// The hub refused the credential (HTTP 401/403 on upgrade).
    AuthRejected { status: u16 },
    HandshakeTimeout,
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    /// Server-assigned id of the current connection.
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub role: Option<Role>,
    /// Users online at handshake time, from the welcome frame.
    pub online_users: Vec<String>,
    /// Increments once per successful handshake.
    pub connection_seq: u64,
    /// Failed attempts since the last successful handshake.
    pub attempt: u32,
    pub last_fault: Option<ChannelFault>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session_id: None,
            user_id: None,
            role: None,
            online_users: Vec::new(),
            connection_seq: 0,
            attempt: 0,
            last_fault: None,
        }
    }
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:4780/ws`.
    pub endpoint: Url,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Bounds the upgrade plus the welcome frame.
    pub connect_timeout: Duration,
    /// A connection that delivers no frame at all for this long is dropped
    /// and redialled. Must exceed the hub's ping interval; zero disables.
    pub read_timeout: Duration,
    pub event_buffer: usize,
    pub max_frame_bytes: usize,
}

impl ChannelConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(30),
            event_buffer: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Treats the hub URL as a directory so relative joins keep any path prefix,
/// e.g. `https://host/carelink` serves `https://host/carelink/api/...`.
pub(crate) fn hub_base(url: &Url) -> Url {
    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// Derives the push endpoint (`<base>/ws`) from the hub's HTTP base URL.
pub fn push_endpoint(base: &Url) -> Result<Url, SyncError> {
    let mut endpoint = hub_base(base);
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::Transport(format!(
                "unsupported hub url scheme: {other}"
            )))
        }
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|_| SyncError::Transport("cannot derive push endpoint".to_string()))?;
    endpoint
        .join("ws")
        .map_err(|err| SyncError::Transport(format!("cannot derive push endpoint: {err}")))
}

pub(crate) fn next_delay(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

pub struct PushChannel {
    id: u64,
    token: String,
    status: watch::Receiver<ChannelStatus>,
    events: broadcast::Sender<Arc<WireEnvelope>>,
    outbound: mpsc::Sender<WireEnvelope>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

static CHANNEL_IDS: AtomicU64 = AtomicU64::new(0);

impl PushChannel {
    fn spawn(
        handle: &Handle,
        config: ChannelConfig,
        provider: Arc<dyn SessionTokenProvider>,
        token: String,
    ) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::default());
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = Driver {
            config,
            provider,
            status: status_tx,
            events: events_tx.clone(),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        let task = handle.spawn(driver.run());
        Arc::new(Self {
            id: CHANNEL_IDS.fetch_add(1, Ordering::Relaxed) + 1,
            token,
            status: status_rx,
            events: events_tx,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            driver: Mutex::new(Some(task)),
        })
    }

    /// Process-unique id, distinct from the server-assigned session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_for_token(&self, token: &str) -> bool {
        self.token == token
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<WireEnvelope>> {
        self.events.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.status.borrow().session_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sends a diagnostic ping; the hub answers with `pong` carrying the nonce.
    pub async fn ping(&self, nonce: Option<String>) -> Result<(), SyncError> {
        if self.is_closed() || !self.is_connected() {
            return Err(SyncError::ChannelClosed);
        }
        let envelope = WireEnvelope::new("carelink-sync", WireMsg::Ping(PingPayload { nonce }));
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    /// Closes the connection and stops reconnecting. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("channel_disconnect_requested: channel {}", self.id);
    }

    /// Waits for the driver task to finish after [`disconnect`](Self::disconnect).
    pub async fn closed(&self) {
        let task = match self.driver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

enum HandshakeFailure {
    Auth(u16),
    Transport(String),
}

enum DisconnectReason {
    Shutdown,
    Closed,
    Transport(String),
}

struct Driver {
    config: ChannelConfig,
    provider: Arc<dyn SessionTokenProvider>,
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<Arc<WireEnvelope>>,
    outbound: mpsc::Receiver<WireEnvelope>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut delay = self.config.initial_delay;
        let mut failures: u32 = 0;
        let mut connection_seq: u64 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let Some(token) = self.provider.current_token() else {
                failures += 1;
                warn!("channel_no_session: attempt {failures}, waiting {:?}", self.config.max_delay);
                self.mark_failed(failures, ChannelFault::NoSession);
                if self.wait_or_shutdown(self.config.max_delay).await {
                    break;
                }
                continue;
            };

            self.status.send_modify(|status| {
                status.state = ConnectionState::Connecting;
                status.attempt = failures;
            });
            debug!("channel_connecting: attempt {}", failures + 1);

            let timeout = self.config.connect_timeout;
            let handshake = tokio::time::timeout(
                timeout,
                handshake(&self.config.endpoint, &token, self.config.max_frame_bytes),
            );
            let outcome = tokio::select! {
                outcome = handshake => outcome,
                _ = shutdown_signalled(&mut self.shutdown) => break,
            };

            let wait = match outcome {
                Ok(Ok((ws, welcome))) => {
                    connection_seq += 1;
                    failures = 0;
                    delay = self.config.initial_delay;
                    info!(
                        "channel_connected: session_id={} connection_seq={connection_seq}",
                        welcome.session_id
                    );
                    self.status.send_modify(|status| {
                        status.state = ConnectionState::Connected;
                        status.session_id = Some(welcome.session_id.clone());
                        status.user_id = Some(welcome.user_id.clone());
                        status.role = Some(welcome.role);
                        status.online_users = welcome.online_users.clone();
                        status.connection_seq = connection_seq;
                        status.attempt = 0;
                        status.last_fault = None;
                    });

                    let reason = self.pump(ws).await;
                    let fault = match &reason {
                        DisconnectReason::Shutdown => None,
                        DisconnectReason::Closed => {
                            Some(ChannelFault::Transport("closed by hub".to_string()))
                        }
                        DisconnectReason::Transport(err) => Some(ChannelFault::Transport(err.clone())),
                    };
                    match &fault {
                        Some(ChannelFault::Transport(detail)) => {
                            warn!("channel_disconnected: connection_seq={connection_seq} reason={detail}")
                        }
                        _ => info!("channel_disconnected: connection_seq={connection_seq} reason=shutdown"),
                    }
                    self.status.send_modify(|status| {
                        status.state = ConnectionState::Disconnected;
                        status.session_id = None;
                        status.online_users.clear();
                        status.last_fault = fault;
                    });
                    if matches!(reason, DisconnectReason::Shutdown) {
                        break;
                    }
                    let current = delay;
                    delay = next_delay(delay, self.config.max_delay);
                    current
                }
                Ok(Err(HandshakeFailure::Auth(status))) => {
                    failures += 1;
                    error!(
                        "channel_auth_rejected: http {status}, attempt {failures}, retry in {:?}",
                        self.config.max_delay
                    );
                    self.mark_failed(failures, ChannelFault::AuthRejected { status });
                    self.config.max_delay
                }
                Ok(Err(HandshakeFailure::Transport(err))) => {
                    failures += 1;
                    warn!("channel_connect_error: {err}");
                    self.mark_failed(failures, ChannelFault::Transport(err));
                    let current = delay;
                    delay = next_delay(delay, self.config.max_delay);
                    current
                }
                Err(_) => {
                    failures += 1;
                    warn!("channel_handshake_timeout: no welcome within {timeout:?}");
                    self.mark_failed(failures, ChannelFault::HandshakeTimeout);
                    let current = delay;
                    delay = next_delay(delay, self.config.max_delay);
                    current
                }
            };

            info!("channel_reconnect: attempt {} in {:?}", failures + 1, wait);
            if self.wait_or_shutdown(wait).await {
                break;
            }
        }

        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.session_id = None;
            status.online_users.clear();
        });
        info!("channel_closed: connections={connection_seq}");
    }

    fn mark_failed(&self, failures: u32, fault: ChannelFault) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.session_id = None;
            status.attempt = failures;
            status.last_fault = Some(fault);
        });
    }

    async fn wait_or_shutdown(&mut self, delay: Duration) -> bool {
        let signalled = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown_signalled(&mut self.shutdown) => true,
        };
        signalled || *self.shutdown.borrow()
    }

    async fn pump(&mut self, mut ws: WsStream) -> DisconnectReason {
        let read_timeout = self.config.read_timeout;
        let idle = tokio::time::sleep(read_timeout);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = &mut idle, if !read_timeout.is_zero() => {
                    return DisconnectReason::Transport(format!(
                        "no frames within {read_timeout:?}"
                    ));
                }
                _ = shutdown_signalled(&mut self.shutdown) => {
                    let _ = ws.close(None).await;
                    return DisconnectReason::Shutdown;
                }
                Some(envelope) = self.outbound.recv() => {
                    let text = match encode_frame(&envelope, self.config.max_frame_bytes) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!("channel_encode_error: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = ws.send(Message::Text(text)).await {
                        return DisconnectReason::Transport(err.to_string());
                    }
                }
                frame = ws.next() => {
                    if let Some(Ok(_)) = &frame {
                        idle.as_mut().reset(tokio::time::Instant::now() + read_timeout);
                    }
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match decode_envelope(&text, self.config.max_frame_bytes) {
                                Ok(envelope) => {
                                    debug!("channel_event: {}", envelope.msg.name());
                                    // No subscribers is fine; events are not buffered for later.
                                    let _ = self.events.send(Arc::new(envelope));
                                }
                                Err(err) => warn!("channel_frame_error: {err}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return DisconnectReason::Closed,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return DisconnectReason::Transport(err.to_string()),
                    }
                }
            }
        }
    }
}

/// Resolves once shutdown is requested or the owning channel is dropped.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn handshake(
    endpoint: &Url,
    token: &str,
    max_frame_bytes: usize,
) -> Result<(WsStream, WelcomePayload), HandshakeFailure> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|err| HandshakeFailure::Transport(err.to_string()))?;
    let credential = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
        HandshakeFailure::Transport("session token is not a valid header value".to_string())
    })?;
    request.headers_mut().insert(AUTHORIZATION, credential);

    let (mut ws, _) = connect_async(request).await.map_err(|err| match err {
        WsError::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            HandshakeFailure::Auth(response.status().as_u16())
        }
        WsError::Http(response) => {
            HandshakeFailure::Transport(format!("upgrade refused: http {}", response.status()))
        }
        other => HandshakeFailure::Transport(other.to_string()),
    })?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope = decode_envelope(&text, max_frame_bytes)
                    .map_err(|err| HandshakeFailure::Transport(err.to_string()))?;
                match envelope.msg {
                    WireMsg::Welcome(welcome) => return Ok((ws, welcome)),
                    other => debug!("channel_pre_welcome_frame: {}", other.name()),
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(HandshakeFailure::Transport(
                    "closed before welcome".to_string(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(HandshakeFailure::Transport(err.to_string())),
        }
    }
}

/// Owns at most one live [`PushChannel`], created lazily and keyed by the
/// session token.
pub struct ChannelManager {
    config: ChannelConfig,
    provider: Arc<dyn SessionTokenProvider>,
    current: Mutex<Option<Arc<PushChannel>>>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig, provider: Arc<dyn SessionTokenProvider>) -> Self {
        Self {
            config,
            provider,
            current: Mutex::new(None),
        }
    }

    /// Returns the live channel, creating it on first use. `None` when there is
    /// no session token or no async runtime to drive the connection.
    pub fn get_channel(&self) -> Option<Arc<PushChannel>> {
        let Some(token) = self.provider.current_token() else {
            warn!("channel_no_session: no session token, push channel not created");
            return None;
        };
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = current.as_ref() {
            if existing.is_for_token(&token) && !existing.is_closed() {
                return Some(existing.clone());
            }
            if !existing.is_closed() {
                info!("channel_replaced: session changed, closing channel {}", existing.id());
            }
            existing.disconnect();
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("channel_no_runtime: push channel requires a tokio runtime");
                *current = None;
                return None;
            }
        };
        let channel = PushChannel::spawn(&handle, self.config.clone(), self.provider.clone(), token);
        debug!("channel_created: channel {}", channel.id());
        *current = Some(channel.clone());
        Some(channel)
    }

    /// The live channel, if one exists, without creating it.
    pub fn current(&self) -> Option<Arc<PushChannel>> {
        let current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        current.clone()
    }

    /// Closes and forgets the channel. No-op when none exists.
    pub fn teardown(&self) {
        let taken = match self.current.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(channel) = taken {
            channel.disconnect();
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
