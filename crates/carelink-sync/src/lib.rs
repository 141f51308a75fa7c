//! Client-side synchronization for shared appointment state.
//!
//! A [`CoordinationClient`] keeps one push channel open to the hub, routes
//! inbound events through per-subsystem [`ListenerRegistry`] tables, and
//! reconciles by refetching the authoritative list instead of patching the
//! cache from event payloads.

pub mod api;
pub mod channel;
pub mod client;
pub mod error;
pub mod events;
pub mod presence;
pub mod reconcile;
pub mod registry;
pub mod session;

#[cfg(test)]
mod testing;

pub use api::{AppointmentReader, AppointmentWriter, HttpAppointmentApi};
pub use channel::{
    push_endpoint, ChannelConfig, ChannelFault, ChannelManager, ChannelStatus, ConnectionState,
    PushChannel,
};
pub use client::{ClientConfig, CoordinationClient};
pub use error::SyncError;
pub use events::{AppointmentEvent, AppointmentEventKind, PresenceEvent, PresenceEventKind};
pub use presence::{Conversation, ConversationPresence, PresenceTracker};
pub use reconcile::{
    AppointmentProjection, DispatcherConfig, ProjectionStore, ReconciliationDispatcher,
};
pub use registry::{EventSource, ListenerId, ListenerRegistry, RegistryStats, SubsystemEvent};
pub use session::{SessionTokenProvider, SharedToken, StaticToken};
