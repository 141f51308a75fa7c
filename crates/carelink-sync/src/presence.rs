//! Advisory online/offline indicator for the other side of a conversation.

use crate::{
    channel::ChannelStatus,
    events::{PresenceEvent, PresenceEventKind},
    registry::{ListenerId, ListenerRegistry},
};
use std::{collections::BTreeSet, sync::Arc};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<String>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, participants: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            participants: participants.into_iter().map(Into::into).collect(),
        }
    }

    pub fn other_participant(&self, viewer_id: &str) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|participant| *participant != viewer_id)
    }
}

/// Set of users with at least one live channel, as last reported by the hub.
#[derive(Clone)]
pub struct PresenceTracker {
    online: Arc<watch::Sender<BTreeSet<String>>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (online, _) = watch::channel(BTreeSet::new());
        Self {
            online: Arc::new(online),
        }
    }

    pub fn apply(&self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Online(user_id) => {
                self.online
                    .send_if_modified(|online| online.insert(user_id.clone()));
            }
            PresenceEvent::Offline(user_id) => {
                self.online.send_if_modified(|online| online.remove(user_id));
            }
            PresenceEvent::Snapshot(users) => {
                let users: BTreeSet<String> = users.iter().cloned().collect();
                self.online.send_if_modified(|online| {
                    if *online == users {
                        return false;
                    }
                    *online = users;
                    true
                });
            }
        }
    }

    /// Forgets everyone; used when our own channel drops.
    pub fn clear(&self) {
        self.online.send_if_modified(|online| {
            let changed = !online.is_empty();
            online.clear();
            changed
        });
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.borrow().contains(user_id)
    }

    pub fn is_other_participant_online(&self, conversation: &Conversation, viewer_id: &str) -> bool {
        conversation
            .other_participant(viewer_id)
            .is_some_and(|other| self.is_online(other))
    }

    pub fn online_users(&self) -> Vec<String> {
        self.online.borrow().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<String>> {
        self.online.subscribe()
    }

    pub fn bind(&self, registry: &ListenerRegistry<PresenceEvent>) -> Vec<ListenerId> {
        PresenceEventKind::ALL
            .into_iter()
            .map(|kind| {
                let tracker = self.clone();
                registry.on(kind, move |event| tracker.apply(event))
            })
            .collect()
    }

    /// Clears the set whenever the channel leaves the connected state.
    pub fn track_disconnects(&self, mut status: watch::Receiver<ChannelStatus>) -> Option<JoinHandle<()>> {
        let handle = Handle::try_current().ok()?;
        let tracker = self.clone();
        Some(handle.spawn(async move {
            loop {
                if !status.borrow_and_update().is_connected() {
                    tracker.clear();
                }
                if status.changed().await.is_err() {
                    tracker.clear();
                    return;
                }
            }
        }))
    }
}

/// Presence for one conversation as seen by one viewer.
pub struct ConversationPresence {
    changes: watch::Receiver<BTreeSet<String>>,
    viewer_id: String,
    conversation: Option<Conversation>,
    online: bool,
}

impl ConversationPresence {
    pub fn new(tracker: &PresenceTracker, viewer_id: impl Into<String>, conversation: Option<Conversation>) -> Self {
        let mut presence = Self {
            changes: tracker.subscribe(),
            viewer_id: viewer_id.into(),
            conversation,
            online: false,
        };
        presence.recompute();
        presence
    }

    fn recompute(&mut self) {
        let online_users = self.changes.borrow_and_update();
        self.online = self
            .conversation
            .as_ref()
            .and_then(|conversation| conversation.other_participant(&self.viewer_id))
            .is_some_and(|other| online_users.contains(other));
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    /// Switches conversation; returns the recomputed flag.
    pub fn set_conversation(&mut self, conversation: Option<Conversation>) -> bool {
        self.conversation = conversation;
        self.recompute();
        debug!(
            "presence_conversation_changed: conversation {:?} online {}",
            self.conversation.as_ref().map(|c| c.id.as_str()),
            self.online
        );
        self.online
    }

    /// Waits for the next tracker change and returns the recomputed flag.
    /// `None` once the tracker is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.changes.changed().await.ok()?;
        self.recompute();
        Some(self.online)
    }
}
