//! Authoritative read/write API. Every committed mutation is broadcast to the
//! appointment's participants; acknowledgments go to the calling connection.

use crate::{auth::bearer_token, error::ApiError, store::Committed, HubState};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use carelink_core::wire::{
    AckPayload, AppointmentPayload, DeletedPayload, StatusChangedPayload, WireMsg,
    CONNECTION_HEADER, REQUEST_ID_HEADER,
};
use carelink_core::{
    Appointment, AppointmentUpdate, NewAppointment, Principal, RescheduleProposal, Role,
    StatusChangeRequest, Transition,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub(crate) fn api_router() -> Router<Arc<HubState>> {
    Router::new()
        .route(
            "/api/appointments",
            get(list_appointments).post(create_appointment),
        )
        .route(
            "/api/appointments/:id",
            axum::routing::patch(update_appointment).delete(delete_appointment),
        )
        .route("/api/appointments/:id/status", post(change_status))
        .route("/api/appointments/:id/reschedule", post(request_reschedule))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    role: Option<Role>,
}

/// Per-request context: who is calling and from which push connection.
struct Caller {
    principal: Principal,
    origin: Option<String>,
    request_id: Option<String>,
}

fn authenticate(hub: &HubState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let principal = bearer_token(headers)
        .and_then(|token| hub.resolve_token(token))
        .ok_or(ApiError::Unauthenticated)?;
    Ok(Caller {
        principal,
        origin: header_value(headers, CONNECTION_HEADER),
        request_id: header_value(headers, REQUEST_ID_HEADER),
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn ack(appointment_id: &str) -> AckPayload {
    AckPayload {
        appointment_id: appointment_id.to_string(),
        ok: true,
        message: None,
    }
}

impl HubState {
    async fn send_ack(&self, caller: Caller, msg: WireMsg) {
        self.acknowledge(
            &caller.principal,
            caller.origin.as_deref(),
            caller.request_id,
            msg,
        )
        .await;
    }

    async fn publish_status_change(&self, committed: &Committed, actor: &Principal) {
        if !committed.status_changed() {
            return;
        }
        let msg = WireMsg::StatusChanged(StatusChangedPayload {
            appointment_id: committed.after.id.clone(),
            previous_status: committed.before.status,
            status: committed.after.status,
            changed_by: Some(actor.user_id.clone()),
        });
        self.publish(&committed.after, msg).await;
    }
}

fn appointment_payload(appointment: &Appointment) -> AppointmentPayload {
    AppointmentPayload {
        appointment: appointment.clone(),
    }
}

async fn list_appointments(
    State(hub): State<Arc<HubState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Appointment>>, ApiError> {
    let caller = authenticate(&hub, &headers)?;
    if let Some(role) = query.role {
        if role != caller.principal.role {
            return Err(ApiError::Forbidden(format!(
                "credential is not valid for role {role}"
            )));
        }
    }
    Ok(Json(hub.store().list_for(&caller.principal).await))
}

async fn create_appointment(
    State(hub): State<Arc<HubState>>,
    headers: HeaderMap,
    Json(draft): Json<NewAppointment>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate(&hub, &headers)?;
    let created = hub
        .store()
        .create(&caller.principal, draft, Utc::now())
        .await?;
    info!(
        event = "appointment_created",
        appointment_id = %created.id,
        patient_ref = %created.patient_ref,
        doctor_ref = %created.doctor_ref
    );
    hub.publish(&created, WireMsg::AppointmentNew(appointment_payload(&created)))
        .await;
    hub.send_ack(caller, WireMsg::CreatedAck(ack(&created.id)))
        .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_appointment(
    State(hub): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(update): Json<AppointmentUpdate>,
) -> Result<Json<Appointment>, ApiError> {
    let caller = authenticate(&hub, &headers)?;
    let committed = hub
        .store()
        .transition(&caller.principal, &id, Transition::Update(update), Utc::now())
        .await?;
    info!(
        event = "appointment_updated",
        appointment_id = %id,
        status = %committed.after.status
    );
    hub.publish(
        &committed.after,
        WireMsg::Updated(appointment_payload(&committed.after)),
    )
    .await;
    hub.publish_status_change(&committed, &caller.principal)
        .await;
    let appointment = committed.after;
    hub.send_ack(caller, WireMsg::UpdatedAck(ack(&appointment.id)))
        .await;
    Ok(Json(appointment))
}

async fn change_status(
    State(hub): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<StatusChangeRequest>,
) -> Result<Json<Appointment>, ApiError> {
    let caller = authenticate(&hub, &headers)?;
    let transition = Transition::from_action(request.action).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "{} needs its own endpoint",
            request.action
        ))
    })?;
    let committed = hub
        .store()
        .transition_with_note(
            &caller.principal,
            &id,
            transition,
            request.note.as_deref(),
            Utc::now(),
        )
        .await?;
    info!(
        event = "appointment_status_action",
        appointment_id = %id,
        action = %request.action,
        from = %committed.before.status,
        to = %committed.after.status
    );
    hub.publish_status_change(&committed, &caller.principal)
        .await;
    hub.publish(
        &committed.after,
        WireMsg::Updated(appointment_payload(&committed.after)),
    )
    .await;
    let appointment = committed.after;
    hub.send_ack(caller, WireMsg::StatusUpdateAck(ack(&appointment.id)))
        .await;
    Ok(Json(appointment))
}

async fn request_reschedule(
    State(hub): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(proposal): Json<RescheduleProposal>,
) -> Result<Json<Appointment>, ApiError> {
    let caller = authenticate(&hub, &headers)?;
    let committed = hub
        .store()
        .transition(
            &caller.principal,
            &id,
            Transition::RequestReschedule(proposal),
            Utc::now(),
        )
        .await?;
    info!(event = "appointment_reschedule_requested", appointment_id = %id);
    hub.publish(
        &committed.after,
        WireMsg::RescheduleRequested(appointment_payload(&committed.after)),
    )
    .await;
    let appointment = committed.after;
    hub.send_ack(caller, WireMsg::RescheduleRequestAck(ack(&appointment.id)))
        .await;
    Ok(Json(appointment))
}

async fn delete_appointment(
    State(hub): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = authenticate(&hub, &headers)?;
    let removed = hub.store().delete(&caller.principal, &id).await?;
    info!(event = "appointment_deleted", appointment_id = %id, by = %caller.principal.user_id);
    hub.publish(
        &removed,
        WireMsg::Deleted(DeletedPayload {
            appointment_id: removed.id.clone(),
        }),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}
