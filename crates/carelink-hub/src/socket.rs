use crate::{auth::bearer_token, Client, HubState};
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use carelink_core::wire::{
    decode_envelope, ErrorPayload, PresencePayload, WelcomePayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES, HUB_SENDER_ID,
};
use carelink_core::Principal;
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    // The credential is bound at handshake time; a socket never authenticates later.
    let principal = match bearer_token(&headers).and_then(|token| hub.resolve_token(token)) {
        Some(value) => value,
        None => {
            warn!(event = "handshake_rejected", remote = %addr);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, principal, addr).await;
    })
}

impl HubState {
    async fn handle_socket(self: Arc<Self>, socket: WebSocket, principal: Principal, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
                if closing {
                    return;
                }
            }
        });

        let client = Arc::new(Client::new(self.next_conn_id(), principal, tx.clone()));
        let first = self.register_client(client.clone()).await;

        let welcome = WireEnvelope::new(
            HUB_SENDER_ID,
            WireMsg::Welcome(WelcomePayload {
                session_id: client.conn_id.clone(),
                user_id: client.principal.user_id.clone(),
                role: client.principal.role,
                online_users: self.online_users().await,
            }),
        );
        if !client.send_envelope(&welcome).await {
            self.remove_client(&client, "welcome_failed").await;
            return;
        }
        info!(event = "handshake_ok", conn_id = %client.conn_id, remote = %remote);

        if first {
            let online = WireEnvelope::new(
                HUB_SENDER_ID,
                WireMsg::UserOnline(PresencePayload {
                    user_id: client.principal.user_id.clone(),
                }),
            );
            self.broadcast_presence(&online, &client.principal.user_id)
                .await;
        }

        let ping_task = self.clone().start_ping(client.clone());
        let mut shutdown = self.shutdown.clone();
        let mut reason = "disconnect";
        if *shutdown.borrow_and_update() {
            let _ = client.sender.send(Message::Close(None)).await;
            reason = "hub_shutdown";
        }

        while reason != "hub_shutdown" {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        reason = "hub_shutdown";
                        let _ = client.sender.send(Message::Close(None)).await;
                        break;
                    }
                }
                _ = client.evicted.notified() => {
                    reason = "stale";
                    let _ = client.sender.send(Message::Close(None)).await;
                    break;
                }
                next = ws_receiver.next() => {
                    let msg = match next {
                        Some(Ok(value)) => {
                            client.touch().await;
                            value
                        }
                        Some(Err(err)) => {
                            warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                            reason = "read_error";
                            break;
                        }
                        None => break,
                    };
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Binary(_) => {
                            warn!(event = "binary_ignored", conn_id = %client.conn_id);
                            continue;
                        }
                        Message::Close(_) => {
                            info!(event = "client_close", conn_id = %client.conn_id);
                            reason = "client_close";
                            break;
                        }
                        Message::Ping(_) | Message::Pong(_) => continue,
                    };
                    if self.config.debug {
                        debug!(event = "message_received", conn_id = %client.conn_id, raw = %text);
                    }
                    self.handle_message(&client, &text).await;
                }
            }
        }

        ping_task.abort();
        self.remove_client(&client, reason).await;
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }

    async fn handle_message(&self, client: &Client, text: &str) {
        let envelope = match decode_envelope(text, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                self.send_error(client, "invalid_message", &err.to_string(), None)
                    .await;
                return;
            }
        };
        match envelope.msg {
            WireMsg::Ping(payload) => {
                let pong = WireEnvelope::new(HUB_SENDER_ID, WireMsg::Pong(payload))
                    .with_request_id(envelope.request_id);
                let _ = client.send_envelope(&pong).await;
            }
            other => {
                // Mutations go through the REST API; the channel only notifies.
                warn!(event = "unexpected_message", conn_id = %client.conn_id, kind = other.name());
                self.send_error(
                    client,
                    "unexpected_message",
                    "clients may only send ping over the push channel",
                    envelope.request_id,
                )
                .await;
            }
        }
    }

    async fn send_error(
        &self,
        client: &Client,
        code: &str,
        message: &str,
        request_id: Option<String>,
    ) {
        let envelope = WireEnvelope::new(
            HUB_SENDER_ID,
            WireMsg::Error(ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
            }),
        )
        .with_request_id(request_id);
        let _ = client.send_envelope(&envelope).await;
    }

    fn start_ping(self: Arc<Self>, client: Arc<Client>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            if interval.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = %client.conn_id);
                    return;
                }
            }
        })
    }
}
