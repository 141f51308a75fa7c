//! Authoritative appointment state held by the hub.
//!
//! Every write re-validates the lifecycle rules against the hub clock; the
//! client-side predicate is advisory only.

use crate::error::{ApiError, ConfigError};
use carelink_core::{
    apply_transition, is_action_allowed, new_appointment_id, Appointment, AppointmentStatus,
    NewAppointment, Principal, Role, Transition,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Byte caps on free-text fields. Together they keep a serialized appointment
/// well under the push frame limit, so every commit can be broadcast.
pub const MAX_TEXT_BYTES: usize = 4 * 1024;
pub const MAX_NOTES_BYTES: usize = 32 * 1024;

/// Result of a committed transition.
#[derive(Debug, Clone)]
pub struct Committed {
    pub before: Appointment,
    pub after: Appointment,
}

impl Committed {
    pub fn status_changed(&self) -> bool {
        self.before.status != self.after.status
    }
}

#[derive(Debug, Default)]
pub struct AppointmentStore {
    appointments: RwLock<HashMap<String, Appointment>>,
}

impl AppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_appointments(appointments: impl IntoIterator<Item = Appointment>) -> Self {
        let map = appointments
            .into_iter()
            .map(|appointment| (appointment.id.clone(), appointment))
            .collect();
        Self {
            appointments: RwLock::new(map),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let appointments: Vec<Appointment> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::with_appointments(appointments))
    }

    /// Appointments the principal may see, soonest first; undetermined dates last.
    pub async fn list_for(&self, principal: &Principal) -> Vec<Appointment> {
        let appointments = self.appointments.read().await;
        let mut visible: Vec<Appointment> = appointments
            .values()
            .filter(|appointment| can_view(principal, appointment))
            .cloned()
            .collect();
        visible.sort_by(|a, b| {
            let key_a = (a.scheduled_at().is_none(), a.scheduled_at(), a.created_at);
            let key_b = (b.scheduled_at().is_none(), b.scheduled_at(), b.created_at);
            key_a.cmp(&key_b).then_with(|| a.id.cmp(&b.id))
        });
        visible
    }

    pub async fn get(&self, principal: &Principal, id: &str) -> Result<Appointment, ApiError> {
        let appointments = self.appointments.read().await;
        appointments
            .get(id)
            .filter(|appointment| can_view(principal, appointment))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    pub async fn create(
        &self,
        principal: &Principal,
        draft: NewAppointment,
        now: DateTime<Utc>,
    ) -> Result<Appointment, ApiError> {
        if principal.role != Role::Patient {
            return Err(ApiError::Forbidden(
                "only patients can request appointments".to_string(),
            ));
        }
        if draft.doctor_ref.trim().is_empty() {
            return Err(ApiError::BadRequest("doctor_ref is required".to_string()));
        }
        check_len("doctor_ref", &draft.doctor_ref, MAX_TEXT_BYTES)?;
        check_len("reason", &draft.reason, MAX_TEXT_BYTES)?;
        let appointment = Appointment {
            id: new_appointment_id(),
            patient_ref: principal.user_id.clone(),
            doctor_ref: draft.doctor_ref.trim().to_string(),
            date: draft.date,
            time: draft.time,
            status: AppointmentStatus::Pending,
            reason: draft.reason,
            notes: String::new(),
            reschedule_requested: false,
            reschedule: None,
            patient_confirmed: false,
            created_at: now,
            updated_at: None,
        };
        self.appointments
            .write()
            .await
            .insert(appointment.id.clone(), appointment.clone());
        Ok(appointment)
    }

    pub async fn transition(
        &self,
        principal: &Principal,
        id: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Committed, ApiError> {
        self.transition_with_note(principal, id, transition, None, now)
            .await
    }

    /// Like [`transition`](Self::transition), appending `note` to the notes
    /// in the same commit.
    pub async fn transition_with_note(
        &self,
        principal: &Principal,
        id: &str,
        transition: Transition,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Committed, ApiError> {
        let mut appointments = self.appointments.write().await;
        let current = appointments
            .get(id)
            .filter(|appointment| can_view(principal, appointment))
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;

        let action = transition.action();
        let mut next = apply_transition(current, transition, now)?;
        if !is_action_allowed(current, principal.role, action, now) {
            let reason = if action.is_time_gated() && principal.role != Role::Admin {
                format!(
                    "{action} is not allowed for {} while {} or within 24 hours of the visit",
                    principal.role, current.status
                )
            } else {
                format!(
                    "{action} is not allowed for {} while {}",
                    principal.role, current.status
                )
            };
            return Err(ApiError::Forbidden(reason));
        }
        if let Some(note) = note.map(str::trim).filter(|note| !note.is_empty()) {
            if !next.notes.is_empty() {
                next.notes.push('\n');
            }
            next.notes.push_str(note);
        }
        check_fits(&next)?;

        let committed = Committed {
            before: current.clone(),
            after: next.clone(),
        };
        appointments.insert(id.to_string(), next);
        Ok(committed)
    }

    pub async fn delete(&self, principal: &Principal, id: &str) -> Result<Appointment, ApiError> {
        let mut appointments = self.appointments.write().await;
        let current = appointments
            .get(id)
            .filter(|appointment| can_view(principal, appointment))
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        if !can_delete(principal, current) {
            return Err(ApiError::Forbidden(format!(
                "{} cannot delete an appointment that is {}",
                principal.role, current.status
            )));
        }
        appointments
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.appointments.read().await.len()
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), ApiError> {
    if value.len() > max {
        return Err(ApiError::BadRequest(format!(
            "{field} is {} bytes, limit is {max}",
            value.len()
        )));
    }
    Ok(())
}

fn check_fits(appointment: &Appointment) -> Result<(), ApiError> {
    check_len("notes", &appointment.notes, MAX_NOTES_BYTES)?;
    if let Some(request) = &appointment.reschedule {
        if let Some(reason) = &request.reason {
            check_len("reschedule reason", reason, MAX_TEXT_BYTES)?;
        }
    }
    Ok(())
}

fn can_view(principal: &Principal, appointment: &Appointment) -> bool {
    match principal.role {
        Role::Admin => true,
        Role::Patient => appointment.patient_ref == principal.user_id,
        Role::Doctor => appointment.doctor_ref == principal.user_id,
        Role::Pharmacist => false,
    }
}

fn can_delete(principal: &Principal, appointment: &Appointment) -> bool {
    match principal.role {
        Role::Admin => true,
        Role::Patient => matches!(
            appointment.status,
            AppointmentStatus::Pending | AppointmentStatus::Rejected | AppointmentStatus::Cancelled
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_core::{AppointmentUpdate, LifecycleError, RescheduleProposal};
    use chrono::{Duration, NaiveTime};

    fn patient() -> Principal {
        Principal {
            user_id: "pat-1".to_string(),
            role: Role::Patient,
            display_name: None,
        }
    }

    fn doctor() -> Principal {
        Principal {
            user_id: "doc-1".to_string(),
            role: Role::Doctor,
            display_name: None,
        }
    }

    fn draft(starts_at: Option<DateTime<Utc>>) -> NewAppointment {
        NewAppointment {
            doctor_ref: "doc-1".to_string(),
            date: starts_at.map(|at| at.date_naive()),
            time: starts_at.map(|at| at.time()),
            reason: "persistent cough".to_string(),
        }
    }

    #[tokio::test]
    async fn create_is_patient_only_and_starts_pending() {
        let store = AppointmentStore::new();
        let now = Utc::now();
        let created = store
            .create(&patient(), draft(None), now)
            .await
            .expect("create");
        assert_eq!(created.status, AppointmentStatus::Pending);
        assert_eq!(created.patient_ref, "pat-1");

        let err = store
            .create(&doctor(), draft(None), now)
            .await
            .expect_err("doctor cannot create");
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn visibility_follows_participation() {
        let store = AppointmentStore::new();
        let now = Utc::now();
        let created = store
            .create(&patient(), draft(None), now)
            .await
            .expect("create");
        let other_doctor = Principal {
            user_id: "doc-2".to_string(),
            ..doctor()
        };
        assert_eq!(store.list_for(&doctor()).await.len(), 1);
        assert!(store.list_for(&other_doctor).await.is_empty());
        assert!(matches!(
            store.get(&other_doctor, &created.id).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn hub_revalidates_the_modification_window() {
        let store = AppointmentStore::new();
        let now = Utc::now();
        let soon = store
            .create(&patient(), draft(Some(now + Duration::hours(3))), now)
            .await
            .expect("create");
        let err = store
            .transition(&patient(), &soon.id, Transition::Cancel, now)
            .await
            .expect_err("inside window");
        assert!(matches!(err, ApiError::Forbidden(_)));

        let later = store
            .create(&patient(), draft(Some(now + Duration::days(7))), now)
            .await
            .expect("create");
        let committed = store
            .transition(&patient(), &later.id, Transition::Cancel, now)
            .await
            .expect("cancel");
        assert!(committed.status_changed());
        assert_eq!(committed.after.status, AppointmentStatus::Cancelled);
    }

    #[tokio::test]
    async fn illegal_transition_is_a_conflict_not_a_permission_error() {
        let store = AppointmentStore::new();
        let now = Utc::now();
        let created = store
            .create(&patient(), draft(None), now)
            .await
            .expect("create");
        let err = store
            .transition(&doctor(), &created.id, Transition::Complete, now)
            .await
            .expect_err("pending cannot complete");
        assert!(matches!(
            err,
            ApiError::Lifecycle(LifecycleError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn reschedule_round_trip_through_the_store() {
        let store = AppointmentStore::new();
        let now = Utc::now();
        let starts_at = now + Duration::days(10);
        let created = store
            .create(&patient(), draft(Some(starts_at)), now)
            .await
            .expect("create");
        store
            .transition(&doctor(), &created.id, Transition::Accept, now)
            .await
            .expect("accept");
        store
            .transition(
                &doctor(),
                &created.id,
                Transition::Update(AppointmentUpdate {
                    notes: Some("fasting bloods".to_string()),
                    ..AppointmentUpdate::default()
                }),
                now,
            )
            .await
            .expect("annotate");

        let proposal = RescheduleProposal {
            date: (starts_at + Duration::days(2)).date_naive(),
            time: NaiveTime::from_hms_opt(8, 45, 0).expect("time"),
            reason: None,
        };
        let requested = store
            .transition(
                &patient(),
                &created.id,
                Transition::RequestReschedule(proposal.clone()),
                now,
            )
            .await
            .expect("request");
        assert!(!requested.status_changed());
        assert!(requested.after.reschedule_requested);

        let approved = store
            .transition(&doctor(), &created.id, Transition::ApproveReschedule, now)
            .await
            .expect("approve");
        assert_eq!(approved.after.status, AppointmentStatus::Scheduled);
        assert_eq!(approved.after.date, Some(proposal.date));
    }

    #[tokio::test]
    async fn oversized_text_is_refused_before_commit() {
        let store = AppointmentStore::new();
        let now = Utc::now();
        let mut huge = draft(None);
        huge.reason = "x".repeat(300 * 1024);
        let err = store
            .create(&patient(), huge, now)
            .await
            .expect_err("reason too large");
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(store.len().await, 0);

        let created = store
            .create(&patient(), draft(None), now)
            .await
            .expect("create");
        let long_note = "n".repeat(MAX_NOTES_BYTES + 1);
        let err = store
            .transition_with_note(
                &doctor(),
                &created.id,
                Transition::Accept,
                Some(&long_note),
                now,
            )
            .await
            .expect_err("note too large");
        assert!(matches!(err, ApiError::BadRequest(_)));
        let stored = store.get(&doctor(), &created.id).await.expect("get");
        assert_eq!(stored.status, AppointmentStatus::Pending);
        assert!(stored.notes.is_empty());

        store
            .transition_with_note(&doctor(), &created.id, Transition::Accept, Some("ok"), now)
            .await
            .expect("accept");
        let err = store
            .transition(
                &doctor(),
                &created.id,
                Transition::Update(AppointmentUpdate {
                    notes: Some(long_note.clone()),
                    ..AppointmentUpdate::default()
                }),
                now,
            )
            .await
            .expect_err("notes too large");
        assert!(matches!(err, ApiError::BadRequest(_)));
        let stored = store.get(&doctor(), &created.id).await.expect("get");
        assert_eq!(stored.notes, "ok");
    }

    #[tokio::test]
    async fn patients_delete_only_open_requests() {
        let store = AppointmentStore::new();
        let now = Utc::now();
        let created = store
            .create(&patient(), draft(None), now)
            .await
            .expect("create");
        store
            .transition(&doctor(), &created.id, Transition::Accept, now)
            .await
            .expect("accept");
        assert!(matches!(
            store.delete(&patient(), &created.id).await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            store.delete(&doctor(), &created.id).await,
            Err(ApiError::Forbidden(_))
        ));

        let admin = Principal {
            user_id: "adm-1".to_string(),
            role: Role::Admin,
            display_name: None,
        };
        store.delete(&admin, &created.id).await.expect("admin delete");
        assert_eq!(store.len().await, 0);
    }
}
