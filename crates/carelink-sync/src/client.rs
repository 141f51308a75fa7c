use crate::{
    api::{AppointmentWriter, HttpAppointmentApi},
    channel::{push_endpoint, ChannelConfig, ChannelManager, ChannelStatus, PushChannel},
    error::SyncError,
    events::{AppointmentEvent, PresenceEvent},
    presence::{Conversation, ConversationPresence, PresenceTracker},
    reconcile::{AppointmentProjection, DispatcherConfig, ProjectionStore, ReconciliationDispatcher},
    registry::{EventSource, ListenerRegistry},
    session::SessionTokenProvider,
};
use carelink_core::{
    allowed_actions, is_action_allowed, Action, Appointment, AppointmentUpdate, NewAppointment,
    RescheduleProposal, Role, StatusChangeRequest,
};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base of the hub, e.g. `http://127.0.0.1:4780`.
    pub hub_url: Url,
    pub channel: ChannelConfig,
    pub dispatcher: DispatcherConfig,
}

impl ClientConfig {
    pub fn new(hub_url: Url, role: Role) -> Result<Self, SyncError> {
        let channel = ChannelConfig::new(push_endpoint(&hub_url)?);
        Ok(Self {
            hub_url,
            channel,
            dispatcher: DispatcherConfig::new(role),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One client instance: push channel, listener registries, reconciled
/// appointment projection, presence, and the write path.
pub struct CoordinationClient {
    channels: ChannelManager,
    api: Arc<HttpAppointmentApi>,
    appointment_events: ListenerRegistry<AppointmentEvent>,
    presence_events: ListenerRegistry<PresenceEvent>,
    dispatcher: ReconciliationDispatcher,
    presence: PresenceTracker,
    bound_channel: Mutex<Option<u64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinationClient {
    pub fn new(config: ClientConfig, tokens: Arc<dyn SessionTokenProvider>) -> Self {
        let api = Arc::new(HttpAppointmentApi::new(config.hub_url.clone(), tokens.clone()));
        let dispatcher = ReconciliationDispatcher::new(
            config.dispatcher,
            api.clone(),
            Arc::new(ProjectionStore::new()),
        );
        let appointment_events = ListenerRegistry::new();
        dispatcher.bind(&appointment_events);
        let presence = PresenceTracker::new();
        let presence_events = ListenerRegistry::new();
        presence.bind(&presence_events);
        Self {
            channels: ChannelManager::new(config.channel, tokens),
            api,
            appointment_events,
            presence_events,
            dispatcher,
            presence,
            bound_channel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Opens the push channel (or reuses the live one), binds the registries
    /// to it and performs the initial read. A failed initial read is recorded
    /// on the projection rather than returned.
    pub async fn start(&self) -> Result<Arc<PushChannel>, SyncError> {
        let channel = self.channels.get_channel().ok_or(SyncError::NoSession)?;
        {
            let mut bound = lock(&self.bound_channel);
            if *bound == Some(channel.id()) {
                return Ok(channel);
            }
            *bound = Some(channel.id());
        }
        self.api.set_origin(Some(channel.watch_status()));
        let source: Arc<dyn EventSource> = channel.clone();
        self.appointment_events.bind(source.clone());
        self.presence_events.bind(source);

        {
            let mut tasks = lock(&self.tasks);
            for task in tasks.drain(..) {
                task.abort();
            }
            tasks.push(spawn_reconnect_refetch(
                self.dispatcher.clone(),
                channel.watch_status(),
            ));
            if let Some(task) = self.presence.track_disconnects(channel.watch_status()) {
                tasks.push(task);
            }
        }
        info!("client_started: role {}", self.role());

        if let Err(err) = self.dispatcher.refresh_now().await {
            warn!("client_initial_refresh_failed: {err}");
        }
        Ok(channel)
    }

    /// Logout: closes the channel, stops listeners and forgets presence.
    pub fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.appointment_events.unbind();
        self.presence_events.unbind();
        self.api.set_origin(None);
        self.channels.teardown();
        self.presence.clear();
        *lock(&self.bound_channel) = None;
        debug!("client_shutdown");
    }

    pub fn role(&self) -> Role {
        self.dispatcher.role()
    }

    pub fn channel_status(&self) -> Option<ChannelStatus> {
        self.channels.current().map(|channel| channel.status())
    }

    pub fn watch_projection(&self) -> watch::Receiver<AppointmentProjection> {
        self.dispatcher.projection().subscribe()
    }

    pub fn projection(&self) -> AppointmentProjection {
        self.dispatcher.projection().snapshot()
    }

    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.dispatcher.refresh_now().await
    }

    pub fn dispatcher(&self) -> &ReconciliationDispatcher {
        &self.dispatcher
    }

    pub fn appointment_events(&self) -> &ListenerRegistry<AppointmentEvent> {
        &self.appointment_events
    }

    pub fn presence_events(&self) -> &ListenerRegistry<PresenceEvent> {
        &self.presence_events
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn conversation_presence(
        &self,
        viewer_id: impl Into<String>,
        conversation: Option<Conversation>,
    ) -> ConversationPresence {
        ConversationPresence::new(&self.presence, viewer_id, conversation)
    }

    pub async fn ping(&self, nonce: Option<String>) -> Result<(), SyncError> {
        let channel = self.channels.current().ok_or(SyncError::ChannelClosed)?;
        channel.ping(nonce).await
    }

    /// Advisory: the hub re-checks with its own clock.
    pub fn can(&self, appointment: &Appointment, action: Action) -> bool {
        is_action_allowed(appointment, self.role(), action, Utc::now())
    }

    pub fn allowed_actions(&self, appointment: &Appointment) -> Vec<Action> {
        allowed_actions(appointment, self.role(), Utc::now())
    }

    pub async fn create(&self, draft: NewAppointment) -> Result<Appointment, SyncError> {
        let created = self.api.create(&draft).await?;
        self.dispatcher.projection().upsert(created.clone());
        Ok(created)
    }

    pub async fn update(&self, id: &str, update: AppointmentUpdate) -> Result<Appointment, SyncError> {
        let updated = self.api.update(id, &update).await?;
        self.dispatcher.projection().upsert(updated.clone());
        Ok(updated)
    }

    pub async fn change_status(
        &self,
        id: &str,
        action: Action,
        note: Option<String>,
    ) -> Result<Appointment, SyncError> {
        let updated = self
            .api
            .change_status(id, &StatusChangeRequest { action, note })
            .await?;
        self.dispatcher.projection().upsert(updated.clone());
        Ok(updated)
    }

    pub async fn request_reschedule(
        &self,
        id: &str,
        proposal: RescheduleProposal,
    ) -> Result<Appointment, SyncError> {
        let updated = self.api.request_reschedule(id, &proposal).await?;
        self.dispatcher.projection().upsert(updated.clone());
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.api.delete(id).await?;
        self.dispatcher.projection().remove(id);
        Ok(())
    }
}

impl Drop for CoordinationClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Refetches after every successful (re)connect to cover events missed
/// while the channel was down.
fn spawn_reconnect_refetch(
    dispatcher: ReconciliationDispatcher,
    mut status: watch::Receiver<ChannelStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seq = 0;
        loop {
            let (connected, seq) = {
                let current = status.borrow_and_update();
                (current.is_connected(), current.connection_seq)
            };
            if connected && seq != last_seq {
                last_seq = seq;
                debug!("client_reconnect_refetch: connection_seq {seq}");
                dispatcher.notify();
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    })
}
