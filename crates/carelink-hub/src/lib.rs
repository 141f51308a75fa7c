//! Real-time hub: authenticated push channel, presence bookkeeping and the
//! authoritative appointment read/write API whose commits drive every
//! broadcast.

use axum::{extract::ws::Message, routing::get, Router};
use carelink_core::wire::{
    encode_frame, PresencePayload, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES, HUB_SENDER_ID,
};
use carelink_core::{Appointment, Principal, Role};
use std::{
    collections::{BTreeSet, HashMap},
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex as AsyncMutex, Notify, RwLock},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod auth;
pub mod error;
mod routes;
mod socket;
pub mod store;

pub use auth::{TokenEntry, TokenTable};
pub use error::{ApiError, ConfigError};
pub use store::AppointmentStore;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    /// Connections silent for longer than this are closed. Zero disables.
    pub stale_after: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debug: false,
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(30),
        }
    }
}

pub(crate) struct Client {
    pub(crate) conn_id: String,
    pub(crate) principal: Principal,
    pub(crate) sender: mpsc::Sender<Message>,
    pub(crate) last_seen: AsyncMutex<Instant>,
    /// Signalled when the hub gives up on the connection.
    pub(crate) evicted: Notify,
}

impl Client {
    pub(crate) fn new(conn_id: String, principal: Principal, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id,
            principal,
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
            evicted: Notify::new(),
        }
    }

    pub(crate) async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    pub(crate) async fn send_envelope(&self, envelope: &WireEnvelope) -> bool {
        let text = match encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", conn_id = %self.conn_id, error = %err);
                return false;
            }
        };
        self.sender.send(Message::Text(text)).await.is_ok()
    }
}

pub struct HubState {
    config: HubConfig,
    tokens: TokenTable,
    store: Arc<AppointmentStore>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    shutdown: watch::Receiver<bool>,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        tokens: TokenTable,
        store: Arc<AppointmentStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            tokens,
            store,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn store(&self) -> &AppointmentStore {
        &self.store
    }

    pub(crate) fn resolve_token(&self, token: &str) -> Option<Principal> {
        self.tokens.resolve(token).cloned()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn online_users(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        let users: BTreeSet<String> = clients
            .values()
            .map(|client| client.principal.user_id.clone())
            .collect();
        users.into_iter().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Registers the connection; returns true when it is the user's first live one.
    async fn register_client(&self, client: Arc<Client>) -> bool {
        let mut clients = self.clients.write().await;
        let first = !clients
            .values()
            .any(|existing| existing.principal.user_id == client.principal.user_id);
        clients.insert(client.conn_id.clone(), client.clone());
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            user_id = %client.principal.user_id,
            role = %client.principal.role,
            first_connection = first
        );
        first
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        let last = {
            let mut clients = self.clients.write().await;
            if clients.remove(&client.conn_id).is_none() {
                return;
            }
            !clients
                .values()
                .any(|existing| existing.principal.user_id == client.principal.user_id)
        };
        info!(
            event = "client_disconnected",
            conn_id = %client.conn_id,
            user_id = %client.principal.user_id,
            reason = reason,
            last_connection = last
        );
        if last {
            let envelope = WireEnvelope::new(
                HUB_SENDER_ID,
                WireMsg::UserOffline(PresencePayload {
                    user_id: client.principal.user_id.clone(),
                }),
            );
            self.broadcast_presence(&envelope, &client.principal.user_id)
                .await;
        }
    }

    /// Closes connections that have sent nothing, not even a pong, within
    /// `stale_after`. Half-open sockets end up here.
    fn start_stale_reaper(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.stale_after.is_zero() {
            return None;
        }
        let stale_after = self.config.stale_after;
        let interval = stale_after / 2;
        let hub = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for client in hub.snapshot_clients().await {
                    let last_seen = client.last_seen().await;
                    if Instant::now().duration_since(last_seen) > stale_after {
                        warn!(event = "stale_close", conn_id = %client.conn_id);
                        client.evicted.notify_one();
                        hub.remove_client(&client, "stale").await;
                    }
                }
            }
        }))
    }

    async fn broadcast_presence(&self, envelope: &WireEnvelope, subject: &str) {
        for client in self.snapshot_clients().await {
            if client.principal.user_id == subject {
                continue;
            }
            if !client.send_envelope(envelope).await {
                warn!(event = "send_error", conn_id = %client.conn_id);
            }
        }
    }

    /// Broadcasts a committed appointment change to every connection of its
    /// participants and to administrators, the actor's own tabs included.
    pub(crate) async fn publish(&self, appointment: &Appointment, msg: WireMsg) {
        let envelope = WireEnvelope::new(HUB_SENDER_ID, msg);
        let mut delivered = 0usize;
        for client in self.snapshot_clients().await {
            let principal = &client.principal;
            if principal.role != Role::Admin && !appointment.involves(&principal.user_id) {
                continue;
            }
            if client.send_envelope(&envelope).await {
                delivered += 1;
            } else {
                warn!(event = "send_error", conn_id = %client.conn_id);
            }
        }
        info!(
            event = "appointment_broadcast",
            kind = envelope.msg.name(),
            appointment_id = %appointment.id,
            delivered = delivered
        );
    }

    /// Sends an acknowledgment to the originating connection only, and only if
    /// that connection belongs to the actor.
    pub(crate) async fn acknowledge(
        &self,
        actor: &Principal,
        origin: Option<&str>,
        request_id: Option<String>,
        msg: WireMsg,
    ) {
        let Some(conn_id) = origin else {
            return;
        };
        let client = self.clients.read().await.get(conn_id).cloned();
        let Some(client) = client else {
            warn!(event = "ack_miss", conn_id = conn_id, kind = msg.name());
            return;
        };
        if client.principal.user_id != actor.user_id {
            warn!(event = "ack_origin_mismatch", conn_id = conn_id);
            return;
        }
        let envelope = WireEnvelope::new(HUB_SENDER_ID, msg).with_request_id(request_id);
        if !client.send_envelope(&envelope).await {
            warn!(event = "send_error", conn_id = %client.conn_id);
        }
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(socket::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .merge(routes::api_router())
        .with_state(hub)
}

/// Serves the hub on `listener` until `shutdown` flips to true. Open push
/// channels are closed as part of the shutdown.
pub async fn serve(listener: TcpListener, hub: Arc<HubState>) -> io::Result<()> {
    let mut shutdown = hub.shutdown.clone();
    let addr = listener.local_addr()?;
    info!(event = "hub_start", addr = %addr, tokens = hub.tokens.len());
    let reaper = hub.clone().start_stale_reaper();
    let app = router(hub);
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    served?;
    info!(event = "hub_stop", addr = %addr);
    Ok(())
}
