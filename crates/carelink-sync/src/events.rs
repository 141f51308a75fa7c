use crate::{channel::ChannelStatus, registry::SubsystemEvent};
use carelink_core::{
    wire::{AckPayload, StatusChangedPayload, WireEnvelope, WireMsg},
    Appointment,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppointmentEventKind {
    New,
    StatusChanged,
    Updated,
    RescheduleRequested,
    Deleted,
    CreatedAck,
    UpdatedAck,
    StatusUpdateAck,
    RescheduleRequestAck,
    /// Raised locally when the listener fell behind and events were dropped.
    Resync,
}

impl AppointmentEventKind {
    pub const ALL: [AppointmentEventKind; 10] = [
        AppointmentEventKind::New,
        AppointmentEventKind::StatusChanged,
        AppointmentEventKind::Updated,
        AppointmentEventKind::RescheduleRequested,
        AppointmentEventKind::Deleted,
        AppointmentEventKind::CreatedAck,
        AppointmentEventKind::UpdatedAck,
        AppointmentEventKind::StatusUpdateAck,
        AppointmentEventKind::RescheduleRequestAck,
        AppointmentEventKind::Resync,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            AppointmentEventKind::New => "appointment:new",
            AppointmentEventKind::StatusChanged => "appointment:status_changed",
            AppointmentEventKind::Updated => "appointment:updated",
            AppointmentEventKind::RescheduleRequested => "appointment:reschedule_requested",
            AppointmentEventKind::Deleted => "appointment:deleted",
            AppointmentEventKind::CreatedAck => "appointment:created_ack",
            AppointmentEventKind::UpdatedAck => "appointment:updated_ack",
            AppointmentEventKind::StatusUpdateAck => "appointment:status_update_ack",
            AppointmentEventKind::RescheduleRequestAck => "appointment:reschedule_request_ack",
            AppointmentEventKind::Resync => "appointment:resync",
        }
    }

    /// Acknowledgments are addressed to the connection that issued the write.
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            AppointmentEventKind::CreatedAck
                | AppointmentEventKind::UpdatedAck
                | AppointmentEventKind::StatusUpdateAck
                | AppointmentEventKind::RescheduleRequestAck
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppointmentEvent {
    New(Appointment),
    StatusChanged(StatusChangedPayload),
    Updated(Appointment),
    RescheduleRequested(Appointment),
    Deleted {
        appointment_id: String,
    },
    Ack {
        kind: AppointmentEventKind,
        ack: AckPayload,
        request_id: Option<String>,
    },
    /// Some events were lost; only a full refetch brings the view back.
    Resync {
        skipped: u64,
    },
}

impl AppointmentEvent {
    pub fn appointment_id(&self) -> &str {
        match self {
            AppointmentEvent::New(appointment)
            | AppointmentEvent::Updated(appointment)
            | AppointmentEvent::RescheduleRequested(appointment) => &appointment.id,
            AppointmentEvent::StatusChanged(payload) => &payload.appointment_id,
            AppointmentEvent::Deleted { appointment_id } => appointment_id,
            AppointmentEvent::Ack { ack, .. } => &ack.appointment_id,
            AppointmentEvent::Resync { .. } => "",
        }
    }
}

impl SubsystemEvent for AppointmentEvent {
    type Kind = AppointmentEventKind;
    const SUBSYSTEM: &'static str = "appointments";

    fn from_envelope(envelope: &WireEnvelope) -> Option<Self> {
        let ack = |kind, payload: &AckPayload| AppointmentEvent::Ack {
            kind,
            ack: payload.clone(),
            request_id: envelope.request_id.clone(),
        };
        let event = match &envelope.msg {
            WireMsg::AppointmentNew(payload) => AppointmentEvent::New(payload.appointment.clone()),
            WireMsg::StatusChanged(payload) => AppointmentEvent::StatusChanged(payload.clone()),
            WireMsg::Updated(payload) => AppointmentEvent::Updated(payload.appointment.clone()),
            WireMsg::RescheduleRequested(payload) => {
                AppointmentEvent::RescheduleRequested(payload.appointment.clone())
            }
            WireMsg::Deleted(payload) => AppointmentEvent::Deleted {
                appointment_id: payload.appointment_id.clone(),
            },
            WireMsg::CreatedAck(payload) => ack(AppointmentEventKind::CreatedAck, payload),
            WireMsg::UpdatedAck(payload) => ack(AppointmentEventKind::UpdatedAck, payload),
            WireMsg::StatusUpdateAck(payload) => ack(AppointmentEventKind::StatusUpdateAck, payload),
            WireMsg::RescheduleRequestAck(payload) => {
                ack(AppointmentEventKind::RescheduleRequestAck, payload)
            }
            _ => return None,
        };
        Some(event)
    }

    fn kind(&self) -> AppointmentEventKind {
        match self {
            AppointmentEvent::New(_) => AppointmentEventKind::New,
            AppointmentEvent::StatusChanged(_) => AppointmentEventKind::StatusChanged,
            AppointmentEvent::Updated(_) => AppointmentEventKind::Updated,
            AppointmentEvent::RescheduleRequested(_) => AppointmentEventKind::RescheduleRequested,
            AppointmentEvent::Deleted { .. } => AppointmentEventKind::Deleted,
            AppointmentEvent::Ack { kind, .. } => *kind,
            AppointmentEvent::Resync { .. } => AppointmentEventKind::Resync,
        }
    }

    fn on_lagged(skipped: u64) -> Vec<Self> {
        vec![AppointmentEvent::Resync { skipped }]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceEventKind {
    Online,
    Offline,
    Snapshot,
}

impl PresenceEventKind {
    pub const ALL: [PresenceEventKind; 3] = [
        PresenceEventKind::Online,
        PresenceEventKind::Offline,
        PresenceEventKind::Snapshot,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Online(String),
    Offline(String),
    /// Everyone online when the connection was established.
    Snapshot(Vec<String>),
}

impl SubsystemEvent for PresenceEvent {
    type Kind = PresenceEventKind;
    const SUBSYSTEM: &'static str = "presence";

    fn from_envelope(envelope: &WireEnvelope) -> Option<Self> {
        match &envelope.msg {
            WireMsg::UserOnline(payload) => Some(PresenceEvent::Online(payload.user_id.clone())),
            WireMsg::UserOffline(payload) => Some(PresenceEvent::Offline(payload.user_id.clone())),
            _ => None,
        }
    }

    fn kind(&self) -> PresenceEventKind {
        match self {
            PresenceEvent::Online(_) => PresenceEventKind::Online,
            PresenceEvent::Offline(_) => PresenceEventKind::Offline,
            PresenceEvent::Snapshot(_) => PresenceEventKind::Snapshot,
        }
    }

    // The welcome frame is consumed by the handshake, so its snapshot is
    // replayed from the channel status when listeners attach.
    fn on_attach(status: &ChannelStatus) -> Vec<Self> {
        vec![PresenceEvent::Snapshot(status.online_users.clone())]
    }
}
