//! Appointment lifecycle: which statuses may follow which, and which role may
//! trigger what, when.
//!
//! The predicate here gates the client UI only. The hub evaluates the same
//! rules against its own clock before committing a write.

use crate::{
    Appointment, AppointmentStatus, AppointmentUpdate, RescheduleProposal, RescheduleRequest, Role,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum lead time for cancel and reschedule.
pub const MODIFICATION_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Cancel,
    Reschedule,
    Confirm,
    Accept,
    Reject,
    Update,
    Complete,
    ApproveReschedule,
    RejectReschedule,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Cancel,
        Action::Reschedule,
        Action::Confirm,
        Action::Accept,
        Action::Reject,
        Action::Update,
        Action::Complete,
        Action::ApproveReschedule,
        Action::RejectReschedule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Cancel => "cancel",
            Action::Reschedule => "reschedule",
            Action::Confirm => "confirm",
            Action::Accept => "accept",
            Action::Reject => "reject",
            Action::Update => "update",
            Action::Complete => "complete",
            Action::ApproveReschedule => "approve_reschedule",
            Action::RejectReschedule => "reject_reschedule",
        }
    }

    pub fn is_time_gated(&self) -> bool {
        matches!(self, Action::Cancel | Action::Reschedule)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
            .ok_or_else(|| format!("Unknown action: {}", input.trim()))
    }
}

/// A concrete state change, carrying whatever data the action needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Accept,
    Reject,
    Update(AppointmentUpdate),
    Complete,
    Cancel,
    Confirm,
    RequestReschedule(RescheduleProposal),
    ApproveReschedule,
    RejectReschedule,
}

impl Transition {
    pub fn action(&self) -> Action {
        match self {
            Transition::Accept => Action::Accept,
            Transition::Reject => Action::Reject,
            Transition::Update(_) => Action::Update,
            Transition::Complete => Action::Complete,
            Transition::Cancel => Action::Cancel,
            Transition::Confirm => Action::Confirm,
            Transition::RequestReschedule(_) => Action::Reschedule,
            Transition::ApproveReschedule => Action::ApproveReschedule,
            Transition::RejectReschedule => Action::RejectReschedule,
        }
    }

    /// Transitions that need no payload beyond the action itself.
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Accept => Some(Transition::Accept),
            Action::Reject => Some(Transition::Reject),
            Action::Complete => Some(Transition::Complete),
            Action::Cancel => Some(Transition::Cancel),
            Action::Confirm => Some(Transition::Confirm),
            Action::ApproveReschedule => Some(Transition::ApproveReschedule),
            Action::RejectReschedule => Some(Transition::RejectReschedule),
            Action::Update | Action::Reschedule => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot {action} an appointment that is {status}")]
    IllegalTransition {
        action: Action,
        status: AppointmentStatus,
    },
    #[error("appointment has a pending reschedule request")]
    ReschedulePending,
    #[error("appointment has no pending reschedule request")]
    NoReschedulePending,
    #[error("appointment already confirmed by the patient")]
    AlreadyConfirmed,
    #[error("update carries no changes")]
    EmptyUpdate,
}

impl AppointmentStatus {
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match self {
            Pending => matches!(next, Accepted | Rejected | Cancelled),
            Accepted => matches!(next, Scheduled | Completed | Cancelled),
            Scheduled => matches!(next, Rescheduled | Completed | Cancelled),
            Rescheduled => matches!(next, Rescheduled | Completed | Cancelled),
            Rejected | Completed | Cancelled => false,
        }
    }
}

/// True when the appointment starts at least [`MODIFICATION_WINDOW_HOURS`] after `now`.
/// An appointment without a concrete date and time never qualifies.
pub fn modification_window_open(appointment: &Appointment, now: DateTime<Utc>) -> bool {
    match appointment.scheduled_at() {
        Some(at) => at - now >= Duration::hours(MODIFICATION_WINDOW_HOURS),
        None => false,
    }
}

pub fn is_action_allowed(
    appointment: &Appointment,
    role: Role,
    action: Action,
    now: DateTime<Utc>,
) -> bool {
    let status = appointment.status;

    // An open reschedule request must be decided before anything else happens.
    if appointment.reschedule_requested {
        return role == Role::Doctor
            && matches!(action, Action::ApproveReschedule | Action::RejectReschedule);
    }

    let window = || modification_window_open(appointment, now);
    match (role, action) {
        (Role::Patient, Action::Cancel) => {
            (status == AppointmentStatus::Pending || status.is_confirmed()) && window()
        }
        (Role::Patient, Action::Reschedule) => status.is_confirmed() && window(),
        (Role::Patient, Action::Confirm) => {
            status == AppointmentStatus::Completed && !appointment.patient_confirmed
        }
        (Role::Doctor, Action::Accept | Action::Reject) => status == AppointmentStatus::Pending,
        (Role::Doctor, Action::Update | Action::Complete) => status.is_confirmed(),
        (Role::Doctor, Action::Cancel) => status.is_confirmed() && window(),
        _ => false,
    }
}

pub fn allowed_actions(appointment: &Appointment, role: Role, now: DateTime<Utc>) -> Vec<Action> {
    Action::ALL
        .into_iter()
        .filter(|action| is_action_allowed(appointment, role, *action, now))
        .collect()
}

/// Computes the appointment that results from `transition`. Role and time
/// gating are the caller's job; this only enforces status legality.
pub fn apply_transition(
    appointment: &Appointment,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Appointment, LifecycleError> {
    let action = transition.action();
    let status = appointment.status;
    let illegal = || LifecycleError::IllegalTransition { action, status };

    if appointment.reschedule_requested
        && !matches!(
            transition,
            Transition::ApproveReschedule | Transition::RejectReschedule
        )
    {
        return Err(LifecycleError::ReschedulePending);
    }

    let mut next = appointment.clone();
    match transition {
        Transition::Accept => {
            if status != AppointmentStatus::Pending {
                return Err(illegal());
            }
            next.status = AppointmentStatus::Accepted;
        }
        Transition::Reject => {
            if status != AppointmentStatus::Pending {
                return Err(illegal());
            }
            next.status = AppointmentStatus::Rejected;
        }
        Transition::Update(update) => {
            if !status.is_confirmed() {
                return Err(illegal());
            }
            if update.is_empty() {
                return Err(LifecycleError::EmptyUpdate);
            }
            let schedule_changed = (update.date.is_some() && update.date != next.date)
                || (update.time.is_some() && update.time != next.time);
            if let Some(date) = update.date {
                next.date = Some(date);
            }
            if let Some(time) = update.time {
                next.time = Some(time);
            }
            if let Some(notes) = update.notes {
                next.notes = notes;
            }
            if schedule_changed && next.scheduled_at().is_some() {
                next.status = match status {
                    AppointmentStatus::Accepted => AppointmentStatus::Scheduled,
                    _ => AppointmentStatus::Rescheduled,
                };
            }
        }
        Transition::Complete => {
            if !status.is_confirmed() {
                return Err(illegal());
            }
            next.status = AppointmentStatus::Completed;
        }
        Transition::Cancel => {
            if status != AppointmentStatus::Pending && !status.is_confirmed() {
                return Err(illegal());
            }
            next.status = AppointmentStatus::Cancelled;
        }
        Transition::Confirm => {
            if status != AppointmentStatus::Completed {
                return Err(illegal());
            }
            if appointment.patient_confirmed {
                return Err(LifecycleError::AlreadyConfirmed);
            }
            next.patient_confirmed = true;
        }
        Transition::RequestReschedule(proposal) => {
            if !status.is_confirmed() {
                return Err(illegal());
            }
            next.reschedule_requested = true;
            next.reschedule = Some(RescheduleRequest {
                date: proposal.date,
                time: proposal.time,
                reason: proposal.reason,
                previous_status: status,
                requested_at: now,
            });
        }
        Transition::ApproveReschedule => {
            let request = take_request(&mut next)?;
            next.date = Some(request.date);
            next.time = Some(request.time);
            next.status = match request.previous_status {
                AppointmentStatus::Accepted => AppointmentStatus::Scheduled,
                _ => AppointmentStatus::Rescheduled,
            };
        }
        Transition::RejectReschedule => {
            let request = take_request(&mut next)?;
            next.status = request.previous_status;
        }
    }

    if next.status != status && !status.can_transition_to(next.status) {
        return Err(illegal());
    }
    next.updated_at = Some(now);
    Ok(next)
}

fn take_request(appointment: &mut Appointment) -> Result<RescheduleRequest, LifecycleError> {
    if !appointment.reschedule_requested {
        return Err(LifecycleError::NoReschedulePending);
    }
    appointment.reschedule_requested = false;
    appointment
        .reschedule
        .take()
        .ok_or(LifecycleError::NoReschedulePending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn appointment_at(status: AppointmentStatus, starts_at: Option<DateTime<Utc>>) -> Appointment {
        Appointment {
            id: "appt-1".to_string(),
            patient_ref: "pat-1".to_string(),
            doctor_ref: "doc-1".to_string(),
            date: starts_at.map(|at| at.date_naive()),
            time: starts_at.map(|at| at.time()),
            status,
            reason: "follow-up".to_string(),
            notes: String::new(),
            reschedule_requested: false,
            reschedule: None,
            patient_confirmed: false,
            created_at: now() - Duration::days(3),
            updated_at: None,
        }
    }

    fn proposal() -> RescheduleProposal {
        RescheduleProposal {
            date: NaiveDate::from_ymd_opt(2026, 12, 1).expect("date"),
            time: NaiveTime::from_hms_opt(10, 0, 0).expect("time"),
            reason: Some("travel".to_string()),
        }
    }

    #[test]
    fn patient_cancel_respects_the_24_hour_window() {
        let far = appointment_at(AppointmentStatus::Pending, Some(now() + Duration::days(30)));
        assert!(is_action_allowed(&far, Role::Patient, Action::Cancel, now()));

        let soon = appointment_at(AppointmentStatus::Pending, Some(now() + Duration::hours(2)));
        assert!(!is_action_allowed(&soon, Role::Patient, Action::Cancel, now()));

        let edge = appointment_at(AppointmentStatus::Scheduled, Some(now() + Duration::hours(24)));
        assert!(is_action_allowed(&edge, Role::Patient, Action::Cancel, now()));
    }

    #[test]
    fn undetermined_date_never_passes_time_gated_actions() {
        let mut appointment = appointment_at(AppointmentStatus::Accepted, None);
        for offset_days in [-400, 0, 400] {
            let at = now() + Duration::days(offset_days);
            assert!(!is_action_allowed(&appointment, Role::Patient, Action::Cancel, at));
            assert!(!is_action_allowed(&appointment, Role::Patient, Action::Reschedule, at));
            assert!(!is_action_allowed(&appointment, Role::Doctor, Action::Cancel, at));
        }

        appointment.date = Some(NaiveDate::from_ymd_opt(2027, 1, 1).expect("date"));
        assert!(!is_action_allowed(&appointment, Role::Patient, Action::Cancel, now()));
    }

    #[test]
    fn role_gating_matches_status() {
        let pending = appointment_at(AppointmentStatus::Pending, Some(now() + Duration::days(5)));
        assert_eq!(
            allowed_actions(&pending, Role::Doctor, now()),
            vec![Action::Accept, Action::Reject]
        );
        assert_eq!(allowed_actions(&pending, Role::Patient, now()), vec![Action::Cancel]);
        assert!(allowed_actions(&pending, Role::Pharmacist, now()).is_empty());
        assert!(allowed_actions(&pending, Role::Admin, now()).is_empty());

        let scheduled =
            appointment_at(AppointmentStatus::Scheduled, Some(now() + Duration::days(5)));
        assert_eq!(
            allowed_actions(&scheduled, Role::Doctor, now()),
            vec![Action::Cancel, Action::Update, Action::Complete]
        );
        assert_eq!(
            allowed_actions(&scheduled, Role::Patient, now()),
            vec![Action::Cancel, Action::Reschedule]
        );

        let completed =
            appointment_at(AppointmentStatus::Completed, Some(now() - Duration::days(1)));
        assert_eq!(allowed_actions(&completed, Role::Patient, now()), vec![Action::Confirm]);
        assert!(allowed_actions(&completed, Role::Doctor, now()).is_empty());
    }

    #[test]
    fn pending_reschedule_request_only_allows_doctor_decision() {
        let scheduled =
            appointment_at(AppointmentStatus::Scheduled, Some(now() + Duration::days(5)));
        let requested =
            apply_transition(&scheduled, Transition::RequestReschedule(proposal()), now())
                .expect("request reschedule");
        assert!(requested.reschedule_requested);
        assert_eq!(requested.status, AppointmentStatus::Scheduled);

        assert_eq!(
            allowed_actions(&requested, Role::Doctor, now()),
            vec![Action::ApproveReschedule, Action::RejectReschedule]
        );
        assert!(allowed_actions(&requested, Role::Patient, now()).is_empty());
        assert_eq!(
            apply_transition(&requested, Transition::Complete, now()),
            Err(LifecycleError::ReschedulePending)
        );
        assert_eq!(
            apply_transition(&requested, Transition::Cancel, now()),
            Err(LifecycleError::ReschedulePending)
        );
    }

    #[test]
    fn reschedule_request_resolves_to_scheduled_rescheduled_or_origin() {
        for origin in AppointmentStatus::ALL {
            let base = appointment_at(origin, Some(now() + Duration::days(10)));
            let requested =
                apply_transition(&base, Transition::RequestReschedule(proposal()), now());
            if !origin.is_confirmed() {
                assert!(requested.is_err(), "request from {origin} must be refused");
                continue;
            }
            let requested = requested.expect("request accepted");

            let approved = apply_transition(&requested, Transition::ApproveReschedule, now())
                .expect("approve");
            assert!(!approved.reschedule_requested);
            assert!(approved.reschedule.is_none());
            assert!(matches!(
                approved.status,
                AppointmentStatus::Scheduled | AppointmentStatus::Rescheduled
            ));
            assert_eq!(approved.date, Some(proposal().date));
            assert_eq!(approved.time, Some(proposal().time));

            let rejected = apply_transition(&requested, Transition::RejectReschedule, now())
                .expect("reject");
            assert_eq!(rejected.status, origin);
            assert_eq!(rejected.date, base.date);
            assert!(!rejected.reschedule_requested);
        }
    }

    #[test]
    fn approval_from_accepted_becomes_scheduled() {
        let accepted = appointment_at(AppointmentStatus::Accepted, Some(now() + Duration::days(3)));
        let requested =
            apply_transition(&accepted, Transition::RequestReschedule(proposal()), now())
                .expect("request");
        let approved =
            apply_transition(&requested, Transition::ApproveReschedule, now()).expect("approve");
        assert_eq!(approved.status, AppointmentStatus::Scheduled);

        let rescheduled =
            appointment_at(AppointmentStatus::Rescheduled, Some(now() + Duration::days(3)));
        let requested =
            apply_transition(&rescheduled, Transition::RequestReschedule(proposal()), now())
                .expect("request");
        let approved =
            apply_transition(&requested, Transition::ApproveReschedule, now()).expect("approve");
        assert_eq!(approved.status, AppointmentStatus::Rescheduled);
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_transitions() {
        for terminal in [
            AppointmentStatus::Completed,
            AppointmentStatus::Cancelled,
            AppointmentStatus::Rejected,
        ] {
            assert!(terminal.is_terminal());
            for next in AppointmentStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
            let appointment = appointment_at(terminal, Some(now() + Duration::days(10)));
            for transition in [Transition::Accept, Transition::Cancel, Transition::Complete] {
                assert!(apply_transition(&appointment, transition, now()).is_err());
            }
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        for status in AppointmentStatus::ALL {
            assert!(!status.can_transition_to(AppointmentStatus::Pending));
        }
    }

    #[test]
    fn doctor_update_moves_schedule_forward() {
        let accepted = appointment_at(AppointmentStatus::Accepted, None);
        let update = AppointmentUpdate {
            date: NaiveDate::from_ymd_opt(2026, 11, 20),
            time: NaiveTime::from_hms_opt(14, 15, 0),
            notes: None,
        };
        let scheduled =
            apply_transition(&accepted, Transition::Update(update.clone()), now()).expect("update");
        assert_eq!(scheduled.status, AppointmentStatus::Scheduled);
        assert_eq!(scheduled.updated_at, Some(now()));

        let moved = AppointmentUpdate {
            date: NaiveDate::from_ymd_opt(2026, 11, 21),
            ..update
        };
        let rescheduled =
            apply_transition(&scheduled, Transition::Update(moved), now()).expect("move");
        assert_eq!(rescheduled.status, AppointmentStatus::Rescheduled);

        let notes_only = AppointmentUpdate {
            notes: Some("bring imaging".to_string()),
            ..AppointmentUpdate::default()
        };
        let annotated =
            apply_transition(&rescheduled, Transition::Update(notes_only), now()).expect("notes");
        assert_eq!(annotated.status, AppointmentStatus::Rescheduled);
        assert_eq!(annotated.notes, "bring imaging");

        assert_eq!(
            apply_transition(&annotated, Transition::Update(AppointmentUpdate::default()), now()),
            Err(LifecycleError::EmptyUpdate)
        );
    }

    #[test]
    fn confirm_happens_once() {
        let completed =
            appointment_at(AppointmentStatus::Completed, Some(now() - Duration::days(1)));
        let confirmed =
            apply_transition(&completed, Transition::Confirm, now()).expect("confirm");
        assert!(confirmed.patient_confirmed);
        assert_eq!(confirmed.status, AppointmentStatus::Completed);
        assert!(!is_action_allowed(&confirmed, Role::Patient, Action::Confirm, now()));
        assert_eq!(
            apply_transition(&confirmed, Transition::Confirm, now()),
            Err(LifecycleError::AlreadyConfirmed)
        );
    }

    #[test]
    fn action_parses_wire_and_cli_spellings() {
        assert_eq!("approve-reschedule".parse::<Action>(), Ok(Action::ApproveReschedule));
        assert_eq!(" Cancel".parse::<Action>(), Ok(Action::Cancel));
        assert!("delete".parse::<Action>().is_err());
        assert_eq!(Transition::from_action(Action::Reschedule), None);
    }
}
