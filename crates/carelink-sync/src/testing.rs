//! In-process event source for unit tests.

use crate::{
    channel::{ChannelStatus, ConnectionState},
    registry::EventSource,
};
use carelink_core::wire::{DeletedPayload, WireEnvelope, WireMsg, HUB_SENDER_ID};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub(crate) struct LoopbackSource {
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<Arc<WireEnvelope>>,
}

impl LoopbackSource {
    pub(crate) fn new() -> Self {
        Self::with_capacity(64)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let (status, _) = watch::channel(ChannelStatus::default());
        let (events, _) = broadcast::channel(capacity);
        Self { status, events }
    }

    pub(crate) fn connect_with(&self, online_users: Vec<String>) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Connected;
            status.connection_seq += 1;
            status.session_id = Some(format!("conn-{}", status.connection_seq));
            status.online_users = online_users;
        });
    }

    pub(crate) fn connect(&self) {
        self.connect_with(Vec::new());
    }

    pub(crate) fn disconnect(&self) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.session_id = None;
            status.online_users.clear();
        });
    }

    pub(crate) fn emit(&self, msg: WireMsg) {
        let _ = self
            .events
            .send(Arc::new(WireEnvelope::new(HUB_SENDER_ID, msg)));
    }
}

impl EventSource for LoopbackSource {
    fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<WireEnvelope>> {
        self.events.subscribe()
    }
}

pub(crate) fn deleted_msg(appointment_id: &str) -> WireMsg {
    WireMsg::Deleted(DeletedPayload {
        appointment_id: appointment_id.to_string(),
    })
}
