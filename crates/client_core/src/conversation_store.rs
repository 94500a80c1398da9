use std::sync::Arc;

use shared::domain::{ConversationGroup, ConversationId, Message};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ClientError;

/// Immutable view of the collection. Groups untouched by a mutation keep
/// their `Arc`, so `Arc::ptr_eq` tells callers what changed.
pub type Snapshot = Arc<Vec<Arc<ConversationGroup>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Loaded,
    Upserted(ConversationId),
    Removed(ConversationId),
    ActiveChanged(Option<ConversationId>),
}

pub struct ConversationStore {
    groups: Snapshot,
    active: Option<ConversationId>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self::with_notifier(Vec::new(), changes)
    }

    /// Seeds the store from persisted groups. A repeated id replaces the
    /// earlier entry in place.
    pub fn with_notifier(
        groups: Vec<ConversationGroup>,
        changes: broadcast::Sender<StoreChange>,
    ) -> Self {
        let mut seeded: Vec<Arc<ConversationGroup>> = Vec::with_capacity(groups.len());
        for group in groups {
            match seeded.iter().position(|existing| existing.id == group.id) {
                Some(index) => seeded[index] = Arc::new(group),
                None => seeded.push(Arc::new(group)),
            }
        }
        let store = Self {
            groups: Arc::new(seeded),
            active: None,
            changes,
        };
        store.emit(StoreChange::Loaded);
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn list(&self) -> Snapshot {
        Arc::clone(&self.groups)
    }

    pub fn get(&self, id: &ConversationId) -> Option<Arc<ConversationGroup>> {
        self.groups.iter().find(|group| &group.id == id).cloned()
    }

    pub fn active_id(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn active(&self) -> Option<Arc<ConversationGroup>> {
        self.active.as_ref().and_then(|id| self.get(id))
    }

    pub fn upsert(&mut self, group: ConversationGroup) -> Snapshot {
        let id = group.id.clone();
        let mut next = self.groups.as_ref().clone();
        match next.iter().position(|existing| existing.id == id) {
            Some(index) => next[index] = Arc::new(group),
            None => next.push(Arc::new(group)),
        }
        self.groups = Arc::new(next);
        self.emit(StoreChange::Upserted(id));
        self.list()
    }

    pub fn remove(&mut self, id: &ConversationId) -> Snapshot {
        if !self.groups.iter().any(|group| &group.id == id) {
            return self.list();
        }
        let next = self
            .groups
            .iter()
            .filter(|group| &group.id != id)
            .cloned()
            .collect();
        self.groups = Arc::new(next);
        self.emit(StoreChange::Removed(id.clone()));

        if self.active.as_ref() == Some(id) {
            self.active = None;
            self.emit(StoreChange::ActiveChanged(None));
        }
        self.list()
    }

    pub fn set_active(&mut self, id: Option<ConversationId>) -> Result<Snapshot, ClientError> {
        let Some(id) = id else {
            if self.active.take().is_some() {
                self.emit(StoreChange::ActiveChanged(None));
            }
            return Ok(self.list());
        };

        let Some(group) = self.get(&id) else {
            return Err(ClientError::UnknownConversation(id));
        };

        if self.active.as_ref() != Some(&id) {
            self.active = Some(id.clone());
            self.emit(StoreChange::ActiveChanged(Some(id)));
        }
        if group.unread {
            self.upsert(ConversationGroup {
                unread: false,
                ..group.as_ref().clone()
            });
        }
        Ok(self.list())
    }

    /// Replaces a known group's messages wholesale. Unread is raised unless
    /// the group is the active one. Returns `None` for unknown ids.
    pub fn apply_snapshot(&mut self, id: &ConversationId, messages: Vec<Message>) -> Option<Snapshot> {
        let group = self.get(id)?;
        let unread = self.active.as_ref() != Some(id);
        Some(self.upsert(ConversationGroup {
            messages,
            unread,
            ..group.as_ref().clone()
        }))
    }

    fn emit(&self, change: StoreChange) {
        debug!(?change, "conversation store changed");
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
#[path = "tests/conversation_store_tests.rs"]
mod tests;
