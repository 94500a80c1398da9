use std::{collections::HashMap, str::FromStr, sync::Arc};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::{ConversationGroup, ConversationId, Message, MessageKind, User, UserId},
    error::ValidationError,
    protocol::{InboundEnvelope, InboundFrame, OutboundEnvelope, RegisterRequest, RelayReply},
};
use storage::LocalStoreAdapter;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    conversation_store::{ConversationStore, Snapshot, StoreChange},
    error::ClientError,
    transport::{TransportChannel, TransportError},
};

/// How an inbound snapshot is merged into local history.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundPolicy {
    #[default]
    Replace,
    /// Local sends the relay has not echoed yet are re-appended after the
    /// snapshot.
    KeepPendingLocal,
}

impl FromStr for InboundPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "keep_pending_local" | "keep-pending-local" => Ok(Self::KeepPendingLocal),
            other => Err(format!("unknown inbound policy '{other}'")),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SyncSettings {
    pub inbound_policy: InboundPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownConversation,
    BlankText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Message),
    /// Applied locally; the channel refused it and it will not be retried.
    LocalOnly(Message),
    Skipped(SkipReason),
}

impl SendOutcome {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Sent(message) | Self::LocalOnly(message) => Some(message),
            Self::Skipped(_) => None,
        }
    }
}

struct SyncState {
    user: User,
    store: ConversationStore,
    pending: HashMap<ConversationId, Vec<Message>>,
}

/// Mediates between the conversation store, the relay channel and local
/// persistence. Every handler runs under one lock, so mutations never
/// interleave even on a multi-threaded runtime.
pub struct SyncCore {
    user_id: UserId,
    transport: Arc<dyn TransportChannel>,
    persistence: LocalStoreAdapter,
    settings: SyncSettings,
    changes: broadcast::Sender<StoreChange>,
    state: Mutex<SyncState>,
}

impl SyncCore {
    /// Restores the user and group collection. A missing or unreadable user
    /// is replaced by a freshly generated one; missing groups start empty.
    pub async fn load(
        transport: Arc<dyn TransportChannel>,
        persistence: LocalStoreAdapter,
        settings: SyncSettings,
    ) -> Self {
        let user = match persistence.load_user().await {
            Ok(Some(user)) => user,
            Ok(None) => create_user(&persistence).await,
            Err(error) => {
                warn!(%error, "stored user unreadable; generating a new identity");
                create_user(&persistence).await
            }
        };

        let groups = match persistence.load_groups().await {
            Ok(groups) => groups.unwrap_or_default(),
            Err(error) => {
                warn!(%error, "stored conversation groups unreadable; starting empty");
                Vec::new()
            }
        };
        info!(user_id = %user.id, groups = groups.len(), "sync core loaded");

        let (changes, _) = broadcast::channel(256);
        let store = ConversationStore::with_notifier(groups, changes.clone());
        Self {
            user_id: user.id.clone(),
            transport,
            persistence,
            settings,
            changes,
            state: Mutex::new(SyncState {
                user,
                store,
                pending: HashMap::new(),
            }),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn registration(&self) -> RegisterRequest {
        RegisterRequest {
            user_id: self.user_id.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub async fn user(&self) -> User {
        self.state.lock().await.user.clone()
    }

    pub async fn groups(&self) -> Snapshot {
        self.state.lock().await.store.list()
    }

    pub async fn get(&self, id: &ConversationId) -> Option<Arc<ConversationGroup>> {
        self.state.lock().await.store.get(id)
    }

    pub async fn active(&self) -> Option<Arc<ConversationGroup>> {
        self.state.lock().await.store.active()
    }

    pub async fn save_profile(
        &self,
        name: &str,
        avatar_ref: Option<String>,
    ) -> Result<User, ClientError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::BlankProfileName.into());
        }

        let mut state = self.state.lock().await;
        state.user.name = name.to_string();
        state.user.avatar_ref = avatar_ref.filter(|avatar| !avatar.trim().is_empty());
        if let Err(error) = self.persistence.save_user(&state.user).await {
            warn!(%error, "failed to persist user profile");
        }
        Ok(state.user.clone())
    }

    pub async fn create_group(
        &self,
        name: &str,
        member_ids: Vec<UserId>,
    ) -> Result<ConversationId, ClientError> {
        let group = ConversationGroup::create(name, member_ids)?;
        let id = group.id.clone();

        let mut state = self.state.lock().await;
        let groups = state.store.upsert(group);
        self.persist_groups(&groups).await;
        info!(conversation_id = %id, "conversation created");
        Ok(id)
    }

    pub async fn edit_group(
        &self,
        id: &ConversationId,
        name: &str,
        member_ids: Vec<UserId>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        let Some(group) = state.store.get(id) else {
            return Err(ClientError::UnknownConversation(id.clone()));
        };
        let edited = group.edited(name, member_ids)?;
        let groups = state.store.upsert(edited);
        self.persist_groups(&groups).await;
        Ok(())
    }

    pub async fn delete_group(&self, id: &ConversationId) -> Snapshot {
        let mut state = self.state.lock().await;
        let before = state.store.list();
        let groups = state.store.remove(id);
        state.pending.remove(id);
        if !Arc::ptr_eq(&before, &groups) {
            self.persist_groups(&groups).await;
            info!(conversation_id = %id, "conversation deleted");
        }
        groups
    }

    pub async fn set_active(&self, id: Option<ConversationId>) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        let before = state.store.list();
        let groups = state.store.set_active(id)?;
        if !Arc::ptr_eq(&before, &groups) {
            self.persist_groups(&groups).await;
        }
        Ok(())
    }

    /// Appends the message locally, then forwards the whole updated group.
    /// The local append stands whether or not the relay takes the frame.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        kind: MessageKind,
    ) -> SendOutcome {
        if text.trim().is_empty() {
            return SendOutcome::Skipped(SkipReason::BlankText);
        }

        let mut state = self.state.lock().await;
        let Some(group) = state.store.get(conversation_id) else {
            debug!(conversation_id = %conversation_id, "send to unknown conversation ignored");
            return SendOutcome::Skipped(SkipReason::UnknownConversation);
        };

        let message = Message::from_user(&state.user, text, kind);
        let mut updated = group.as_ref().clone();
        updated.messages.push(message.clone());
        let envelope = OutboundEnvelope::from_group(&updated, &self.user_id);

        let groups = state.store.upsert(updated);
        self.persist_groups(&groups).await;

        let frame = match serde_json::to_value(&envelope) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(conversation_id = %conversation_id, %error, "failed to encode envelope");
                return SendOutcome::LocalOnly(message);
            }
        };
        match self.transport.send(frame).await {
            Ok(()) => {
                if self.settings.inbound_policy == InboundPolicy::KeepPendingLocal {
                    state
                        .pending
                        .entry(conversation_id.clone())
                        .or_default()
                        .push(message.clone());
                }
                SendOutcome::Sent(message)
            }
            Err(TransportError::NotOpen) => {
                warn!(conversation_id = %conversation_id, "relay channel not open; message kept locally");
                SendOutcome::LocalOnly(message)
            }
            Err(error) => {
                warn!(conversation_id = %conversation_id, %error, "relay send failed; message kept locally");
                SendOutcome::LocalOnly(message)
            }
        }
    }

    pub async fn on_frame(&self, frame: Value) {
        match InboundFrame::classify(frame) {
            Ok(InboundFrame::Envelope(envelope)) => {
                self.on_envelope(envelope).await;
            }
            Ok(InboundFrame::Reply(RelayReply::Ack { status, message })) => {
                info!(%status, %message, "relay acknowledged");
            }
            Ok(InboundFrame::Reply(RelayReply::Error { error })) => {
                warn!(%error, "relay rejected a frame");
            }
            Err(error) => {
                warn!(%error, "discarding malformed inbound frame");
            }
        }
    }

    /// Applies an authoritative snapshot. Returns `false` when the
    /// conversation is not tracked locally.
    pub async fn on_envelope(&self, envelope: InboundEnvelope) -> bool {
        let mut state = self.state.lock().await;
        let InboundEnvelope { id, messages, .. } = envelope;
        if state.store.get(&id).is_none() {
            debug!(conversation_id = %id, "snapshot for unknown conversation discarded");
            return false;
        }

        let messages = match self.settings.inbound_policy {
            InboundPolicy::Replace => messages,
            InboundPolicy::KeepPendingLocal => merge_pending(&mut state.pending, &id, messages),
        };
        let count = messages.len();
        let Some(groups) = state.store.apply_snapshot(&id, messages) else {
            return false;
        };
        self.persist_groups(&groups).await;
        debug!(conversation_id = %id, messages = count, "snapshot applied");
        true
    }

    pub async fn run<S>(&self, inbound: S)
    where
        S: Stream<Item = Value> + Send,
    {
        futures::pin_mut!(inbound);
        while let Some(frame) = inbound.next().await {
            self.on_frame(frame).await;
        }
        info!("inbound stream ended");
    }

    async fn persist_groups(&self, groups: &Snapshot) {
        if let Err(error) = self.persistence.save_groups(groups.as_slice()).await {
            warn!(%error, "failed to persist conversation groups");
        }
    }
}

async fn create_user(persistence: &LocalStoreAdapter) -> User {
    let user = User::generate();
    if let Err(error) = persistence.save_user(&user).await {
        warn!(%error, "failed to persist new user");
    }
    info!(user_id = %user.id, "generated local user");
    user
}

fn merge_pending(
    pending: &mut HashMap<ConversationId, Vec<Message>>,
    id: &ConversationId,
    mut messages: Vec<Message>,
) -> Vec<Message> {
    let Some(unechoed) = pending.get_mut(id) else {
        return messages;
    };
    unechoed.retain(|message| !messages.contains(message));
    messages.extend(unechoed.iter().cloned());
    if unechoed.is_empty() {
        pending.remove(id);
    }
    messages
}

#[cfg(test)]
#[path = "tests/sync_core_tests.rs"]
mod tests;
