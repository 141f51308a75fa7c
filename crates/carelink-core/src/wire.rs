use crate::{Appointment, AppointmentStatus, Role};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const HUB_SENDER_ID: &str = "carelink-hub";

/// Header carrying the channel's server-assigned session id on REST writes,
/// so the hub can address the acknowledgment to that connection only.
pub const CONNECTION_HEADER: &str = "x-carelink-connection";
/// Optional correlation id echoed back as the ack's `request_id`.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(sender_id: impl Into<String>, msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Everything that travels over the push channel. The client only ever sends
/// `Ping`; every other variant originates at the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum WireMsg {
    #[serde(rename = "welcome")]
    Welcome(WelcomePayload),
    #[serde(rename = "appointment:new")]
    AppointmentNew(AppointmentPayload),
    #[serde(rename = "appointment:status_changed")]
    StatusChanged(StatusChangedPayload),
    #[serde(rename = "appointment:updated")]
    Updated(AppointmentPayload),
    #[serde(rename = "appointment:reschedule_requested")]
    RescheduleRequested(AppointmentPayload),
    #[serde(rename = "appointment:deleted")]
    Deleted(DeletedPayload),
    #[serde(rename = "appointment:created_ack")]
    CreatedAck(AckPayload),
    #[serde(rename = "appointment:updated_ack")]
    UpdatedAck(AckPayload),
    #[serde(rename = "appointment:status_update_ack")]
    StatusUpdateAck(AckPayload),
    #[serde(rename = "appointment:reschedule_request_ack")]
    RescheduleRequestAck(AckPayload),
    #[serde(rename = "presence:online")]
    UserOnline(PresencePayload),
    #[serde(rename = "presence:offline")]
    UserOffline(PresencePayload),
    #[serde(rename = "ping")]
    Ping(PingPayload),
    #[serde(rename = "pong")]
    Pong(PingPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl WireMsg {
    pub fn name(&self) -> &'static str {
        match self {
            WireMsg::Welcome(_) => "welcome",
            WireMsg::AppointmentNew(_) => "appointment:new",
            WireMsg::StatusChanged(_) => "appointment:status_changed",
            WireMsg::Updated(_) => "appointment:updated",
            WireMsg::RescheduleRequested(_) => "appointment:reschedule_requested",
            WireMsg::Deleted(_) => "appointment:deleted",
            WireMsg::CreatedAck(_) => "appointment:created_ack",
            WireMsg::UpdatedAck(_) => "appointment:updated_ack",
            WireMsg::StatusUpdateAck(_) => "appointment:status_update_ack",
            WireMsg::RescheduleRequestAck(_) => "appointment:reschedule_request_ack",
            WireMsg::UserOnline(_) => "presence:online",
            WireMsg::UserOffline(_) => "presence:offline",
            WireMsg::Ping(_) => "ping",
            WireMsg::Pong(_) => "pong",
            WireMsg::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub online_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppointmentPayload {
    pub appointment: Appointment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChangedPayload {
    pub appointment_id: String,
    pub previous_status: AppointmentStatus,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub changed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletedPayload {
    pub appointment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    pub appointment_id: String,
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresencePayload {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingPayload {
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unsupported protocol version {found}, max supported {supported}")]
    UnsupportedVersion { found: u16, supported: u16 },
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes an envelope and refuses versions newer than this build understands.
pub fn decode_envelope(text: &str, max_frame_bytes: usize) -> Result<WireEnvelope, FrameError> {
    let envelope: WireEnvelope = decode_frame(text, max_frame_bytes)?;
    if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion {
            found: envelope.version.0,
            supported: CURRENT_PROTOCOL_VERSION,
        });
    }
    Ok(envelope)
}
