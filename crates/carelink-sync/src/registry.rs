//! Per-subsystem listener tables with idempotent attachment to a push channel.
//!
//! A registry owns at most one pump task per live connection. The pump turns
//! raw envelopes into typed events and invokes the callbacks registered for
//! each kind, in registration order, one event at a time. Callbacks never run
//! while the listener table lock is held.

use crate::channel::{ChannelStatus, PushChannel};
use carelink_core::wire::WireEnvelope;
use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub trait SubsystemEvent: Clone + Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    const SUBSYSTEM: &'static str;

    fn from_envelope(envelope: &WireEnvelope) -> Option<Self>;
    fn kind(&self) -> Self::Kind;

    /// Events delivered first on every fresh attachment.
    fn on_attach(_status: &ChannelStatus) -> Vec<Self> {
        Vec::new()
    }

    /// Events delivered in place of `skipped` envelopes the pump fell too far
    /// behind to receive.
    fn on_lagged(_skipped: u64) -> Vec<Self> {
        Vec::new()
    }
}

/// Anything that exposes a connection status and a stream of envelopes.
pub trait EventSource: Send + Sync + 'static {
    fn watch_status(&self) -> watch::Receiver<ChannelStatus>;
    fn subscribe(&self) -> broadcast::Receiver<Arc<WireEnvelope>>;
}

impl EventSource for PushChannel {
    fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        PushChannel::watch_status(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<WireEnvelope>> {
        PushChannel::subscribe(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Pumps started, one per live connection.
    pub attach_count: u64,
    /// Attachments torn down because their connection went away.
    pub reset_count: u64,
    pub listeners: usize,
    pub attached: bool,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listeners<E: SubsystemEvent> {
    next_id: u64,
    by_kind: HashMap<E::Kind, Vec<(ListenerId, Callback<E>)>>,
}

struct Attachment {
    connection_seq: u64,
    pump: JoinHandle<()>,
}

struct Inner<E: SubsystemEvent> {
    listeners: Mutex<Listeners<E>>,
    attachment: Mutex<Option<Attachment>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    attach_count: AtomicU64,
    reset_count: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<E: SubsystemEvent> Inner<E> {
    fn dispatch(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let listeners = lock(&self.listeners);
            match listeners.by_kind.get(&event.kind()) {
                Some(entries) => entries.iter().map(|(_, callback)| callback.clone()).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

pub struct ListenerRegistry<E: SubsystemEvent> {
    inner: Arc<Inner<E>>,
}

impl<E: SubsystemEvent> Clone for ListenerRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: SubsystemEvent> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SubsystemEvent> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Listeners {
                    next_id: 0,
                    by_kind: HashMap::new(),
                }),
                attachment: Mutex::new(None),
                supervisor: Mutex::new(None),
                attach_count: AtomicU64::new(0),
                reset_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Removes one callback; other subscribers of the same kind are untouched.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let Some(entries) = listeners.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.by_kind.remove(&kind);
        }
        removed
    }

    /// Starts the pump for the source's current connection. Only the first
    /// call per connection does anything; returns whether a pump was started.
    pub fn attach(&self, source: &dyn EventSource) -> bool {
        let status = source.watch_status().borrow().clone();
        if !status.is_connected() {
            return false;
        }
        let mut attachment = lock(&self.inner.attachment);
        if let Some(existing) = attachment.as_ref() {
            if existing.connection_seq == status.connection_seq && !existing.pump.is_finished() {
                return false;
            }
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("registry_no_runtime: subsystem {}", E::SUBSYSTEM);
                return false;
            }
        };
        if let Some(stale) = attachment.take() {
            stale.pump.abort();
            self.inner.reset_count.fetch_add(1, Ordering::SeqCst);
        }

        let receiver = source.subscribe();
        let initial = E::on_attach(&status);
        let pump = handle.spawn(pump(self.inner.clone(), receiver, initial));
        *attachment = Some(Attachment {
            connection_seq: status.connection_seq,
            pump,
        });
        self.inner.attach_count.fetch_add(1, Ordering::SeqCst);
        debug!(
            "registry_attached: subsystem {} connection_seq {}",
            E::SUBSYSTEM,
            status.connection_seq
        );
        true
    }

    /// Stops the pump and clears the attached flag. No-op when not attached.
    pub fn detach(&self) -> bool {
        let taken = lock(&self.inner.attachment).take();
        match taken {
            Some(attachment) => {
                attachment.pump.abort();
                self.inner.reset_count.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "registry_detached: subsystem {} connection_seq {}",
                    E::SUBSYSTEM,
                    attachment.connection_seq
                );
                true
            }
            None => false,
        }
    }

    /// Follows the source's status: attach on every connect, detach on every
    /// drop. Replaces any previous binding.
    pub fn bind(&self, source: Arc<dyn EventSource>) {
        let Ok(handle) = Handle::try_current() else {
            warn!("registry_no_runtime: subsystem {}", E::SUBSYSTEM);
            return;
        };
        let registry = self.clone();
        let mut status = source.watch_status();
        let task = handle.spawn(async move {
            loop {
                let connected = status.borrow_and_update().is_connected();
                if connected {
                    registry.attach(source.as_ref());
                } else {
                    registry.detach();
                }
                if status.changed().await.is_err() {
                    registry.detach();
                    return;
                }
            }
        });
        if let Some(previous) = lock(&self.inner.supervisor).replace(task) {
            previous.abort();
        }
    }

    /// Stops following the source and detaches.
    pub fn unbind(&self) {
        if let Some(task) = lock(&self.inner.supervisor).take() {
            task.abort();
        }
        self.detach();
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.inner.attachment)
            .as_ref()
            .is_some_and(|attachment| !attachment.pump.is_finished())
    }

    pub fn stats(&self) -> RegistryStats {
        let listeners = lock(&self.inner.listeners)
            .by_kind
            .values()
            .map(Vec::len)
            .sum();
        RegistryStats {
            attach_count: self.inner.attach_count.load(Ordering::SeqCst),
            reset_count: self.inner.reset_count.load(Ordering::SeqCst),
            listeners,
            attached: self.is_attached(),
        }
    }
}

async fn pump<E: SubsystemEvent>(
    inner: Arc<Inner<E>>,
    mut receiver: broadcast::Receiver<Arc<WireEnvelope>>,
    initial: Vec<E>,
) {
    for event in &initial {
        inner.dispatch(event);
    }
    loop {
        match receiver.recv().await {
            Ok(envelope) => {
                if let Some(event) = E::from_envelope(&envelope) {
                    inner.dispatch(&event);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("registry_lagged: subsystem {} skipped {skipped}", E::SUBSYSTEM);
                for event in &E::on_lagged(skipped) {
                    inner.dispatch(event);
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
