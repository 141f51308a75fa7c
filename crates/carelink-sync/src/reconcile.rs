//! Event-to-state reconciliation: every inbound appointment event, whatever
//! its payload, schedules a debounced refetch of the authoritative list, and
//! the cached projection is replaced wholesale with the result.

use crate::{
    api::AppointmentReader,
    error::SyncError,
    events::{AppointmentEvent, AppointmentEventKind},
    registry::{ListenerId, ListenerRegistry},
};
use carelink_core::{Appointment, Role};
use chrono::{DateTime, Utc};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppointmentProjection {
    pub appointments: Vec<Appointment>,
    /// Bumped on every change to this value.
    pub revision: u64,
    /// Message of the most recent failed refetch, cleared by the next success.
    pub last_error: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl AppointmentProjection {
    pub fn get(&self, id: &str) -> Option<&Appointment> {
        self.appointments
            .iter()
            .find(|appointment| appointment.id == id)
    }
}

/// Read-only cached view. Writers are crate-private: the dispatcher's
/// refetch handler and the write façade.
pub struct ProjectionStore {
    tx: watch::Sender<AppointmentProjection>,
    applied_ticket: Mutex<u64>,
}

impl Default for ProjectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AppointmentProjection::default());
        Self {
            tx,
            applied_ticket: Mutex::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AppointmentProjection> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> AppointmentProjection {
        self.tx.borrow().clone()
    }

    /// Applies a refetch outcome unless a newer ticket already landed.
    pub(crate) fn apply_read(&self, ticket: u64, outcome: Result<Vec<Appointment>, String>) -> bool {
        let mut applied = match self.applied_ticket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ticket <= *applied {
            debug!("reconcile_stale_result: ticket {ticket} <= {}", *applied);
            return false;
        }
        *applied = ticket;
        self.tx.send_modify(|projection| {
            match outcome {
                Ok(appointments) => {
                    projection.appointments = appointments;
                    projection.last_error = None;
                    projection.refreshed_at = Some(Utc::now());
                }
                Err(message) => projection.last_error = Some(message),
            }
            projection.revision += 1;
        });
        true
    }

    /// Reflects a successful write before the broadcast round-trip lands.
    pub(crate) fn upsert(&self, appointment: Appointment) {
        self.tx.send_modify(|projection| {
            match projection
                .appointments
                .iter_mut()
                .find(|existing| existing.id == appointment.id)
            {
                Some(existing) => *existing = appointment,
                None => projection.appointments.push(appointment),
            }
            projection.revision += 1;
        });
    }

    pub(crate) fn remove(&self, id: &str) {
        self.tx.send_if_modified(|projection| {
            let before = projection.appointments.len();
            projection.appointments.retain(|appointment| appointment.id != id);
            let changed = projection.appointments.len() != before;
            if changed {
                projection.revision += 1;
            }
            changed
        });
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub role: Role,
    pub debounce: Duration,
}

impl DispatcherConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            debounce: Duration::from_millis(100),
        }
    }
}

struct DispatcherInner {
    config: DispatcherConfig,
    reader: Arc<dyn AppointmentReader>,
    projection: Arc<ProjectionStore>,
    pending: AtomicBool,
    next_ticket: AtomicU64,
    refetch_count: AtomicU64,
}

impl DispatcherInner {
    async fn refetch(&self) -> Result<(), SyncError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        self.refetch_count.fetch_add(1, Ordering::SeqCst);
        match self.reader.list_appointments(self.config.role).await {
            Ok(appointments) => {
                debug!(
                    "reconcile_refetched: ticket {ticket} appointments {}",
                    appointments.len()
                );
                self.projection.apply_read(ticket, Ok(appointments));
                Ok(())
            }
            Err(err) => {
                warn!("reconcile_refetch_failed: ticket {ticket}: {err}");
                self.projection.apply_read(ticket, Err(err.to_string()));
                Err(err)
            }
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ReconciliationDispatcher {
    pub fn new(
        config: DispatcherConfig,
        reader: Arc<dyn AppointmentReader>,
        projection: Arc<ProjectionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                reader,
                projection,
                pending: AtomicBool::new(false),
                next_ticket: AtomicU64::new(0),
                refetch_count: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules a debounced refetch. Calls inside the window coalesce;
    /// calls while a refetch is in flight schedule another one.
    pub fn notify(&self) {
        if self.inner.pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("reconcile_no_runtime: refetch skipped");
            self.inner.pending.store(false, Ordering::SeqCst);
            return;
        };
        let inner = self.inner.clone();
        handle.spawn(async move {
            tokio::time::sleep(inner.config.debounce).await;
            inner.pending.store(false, Ordering::SeqCst);
            // Errors are recorded on the projection; nothing to retry here.
            let _ = inner.refetch().await;
        });
    }

    /// Immediate read, for initial mount and manual refresh.
    pub async fn refresh_now(&self) -> Result<(), SyncError> {
        self.inner.refetch().await
    }

    /// Subscribes [`notify`](Self::notify) to every appointment event kind.
    pub fn bind(&self, registry: &ListenerRegistry<AppointmentEvent>) -> Vec<ListenerId> {
        AppointmentEventKind::ALL
            .into_iter()
            .map(|kind| {
                let dispatcher = self.clone();
                registry.on(kind, move |_| dispatcher.notify())
            })
            .collect()
    }

    pub fn projection(&self) -> &Arc<ProjectionStore> {
        &self.inner.projection
    }

    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    pub fn refetch_count(&self) -> u64 {
        self.inner.refetch_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deleted_msg, LoopbackSource};
    use async_trait::async_trait;
    use carelink_core::AppointmentStatus;
    use std::collections::VecDeque;

    fn appointment(id: &str, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: id.to_string(),
            patient_ref: "pat-1".to_string(),
            doctor_ref: "doc-1".to_string(),
            date: None,
            time: None,
            status,
            reason: String::new(),
            notes: String::new(),
            reschedule_requested: false,
            reschedule: None,
            patient_confirmed: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Scripted reader: each call pops the next (delay, result) pair.
    struct ScriptedReader {
        script: Mutex<VecDeque<(Duration, Result<Vec<Appointment>, String>)>>,
        calls: AtomicU64,
    }

    impl ScriptedReader {
        fn new(script: Vec<(Duration, Result<Vec<Appointment>, String>)>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl AppointmentReader for ScriptedReader {
        async fn list_appointments(&self, _role: Role) -> Result<Vec<Appointment>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let (delay, result) = next.unwrap_or((Duration::ZERO, Ok(Vec::new())));
            tokio::time::sleep(delay).await;
            result.map_err(|message| SyncError::Api {
                status: 500,
                message,
            })
        }
    }

    fn dispatcher(reader: Arc<ScriptedReader>) -> ReconciliationDispatcher {
        ReconciliationDispatcher::new(
            DispatcherConfig::new(Role::Patient),
            reader,
            Arc::new(ProjectionStore::new()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_events_coalesces_into_one_refetch() {
        let reader = ScriptedReader::new(vec![(
            Duration::ZERO,
            Ok(vec![appointment("a-1", AppointmentStatus::Accepted)]),
        )]);
        let dispatcher = dispatcher(reader.clone());
        for _ in 0..10 {
            dispatcher.notify();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        let projection = dispatcher.projection().snapshot();
        assert_eq!(projection.revision, 1);
        assert_eq!(
            projection.get("a-1").map(|a| a.status),
            Some(AppointmentStatus::Accepted)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_response_never_overwrites_a_newer_one() {
        let reader = ScriptedReader::new(vec![
            (
                Duration::from_millis(300),
                Ok(vec![appointment("a-1", AppointmentStatus::Pending)]),
            ),
            (
                Duration::ZERO,
                Ok(vec![appointment("a-1", AppointmentStatus::Accepted)]),
            ),
        ]);
        let dispatcher = dispatcher(reader.clone());
        let slow = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.refresh_now().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.refresh_now().await.expect("fast refetch");
        slow.await.expect("join").expect("slow refetch");

        let projection = dispatcher.projection().snapshot();
        assert_eq!(
            projection.get("a-1").map(|a| a.status),
            Some(AppointmentStatus::Accepted)
        );
        assert_eq!(projection.revision, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_refetch_keeps_the_list_and_records_the_error() {
        let reader = ScriptedReader::new(vec![
            (
                Duration::ZERO,
                Ok(vec![appointment("a-1", AppointmentStatus::Scheduled)]),
            ),
            (Duration::ZERO, Err("hub unavailable".to_string())),
        ]);
        let dispatcher = dispatcher(reader);
        dispatcher.refresh_now().await.expect("first read");
        assert!(dispatcher.refresh_now().await.is_err());

        let projection = dispatcher.projection().snapshot();
        assert_eq!(projection.appointments.len(), 1);
        assert!(projection
            .last_error
            .as_deref()
            .is_some_and(|message| message.contains("hub unavailable")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn event_during_refetch_schedules_another() {
        let reader = ScriptedReader::new(vec![
            (Duration::from_millis(200), Ok(Vec::new())),
            (Duration::ZERO, Ok(Vec::new())),
        ]);
        let dispatcher = dispatcher(reader.clone());
        dispatcher.notify();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // First refetch is now in flight.
        dispatcher.notify();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(reader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_attach_still_means_one_refetch_per_event() {
        let reader = ScriptedReader::new(Vec::new());
        let dispatcher = dispatcher(reader.clone());
        let registry = ListenerRegistry::<AppointmentEvent>::new();
        dispatcher.bind(&registry);

        let source = LoopbackSource::new();
        source.connect();
        for _ in 0..5 {
            registry.attach(&source);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.emit(deleted_msg("a-1"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.refetch_count(), 1);
    }

    #[test]
    fn optimistic_writes_bump_the_revision() {
        let store = ProjectionStore::new();
        store.upsert(appointment("a-1", AppointmentStatus::Pending));
        store.upsert(appointment("a-1", AppointmentStatus::Accepted));
        store.remove("missing");
        let projection = store.snapshot();
        assert_eq!(projection.revision, 2);
        assert_eq!(projection.appointments.len(), 1);
        store.remove("a-1");
        assert!(store.snapshot().appointments.is_empty());
    }
}
