use super::*;
use futures::stream;
use serde_json::json;
use shared::domain::MessageKind;
use std::sync::atomic::{AtomicBool, Ordering};
use storage::{KeyValueStore, MemoryKeyValueStore, GROUPS_KEY, USER_KEY};

struct RecordingTransport {
    open: AtomicBool,
    sent: Mutex<Vec<Value>>,
}

impl RecordingTransport {
    fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(open),
            sent: Mutex::new(Vec::new()),
        })
    }

    async fn sent(&self) -> Vec<Value> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl TransportChannel for RecordingTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Value) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.sent.lock().await.push(frame);
        Ok(())
    }
}

async fn load_core(
    transport: Arc<RecordingTransport>,
    kv: Arc<MemoryKeyValueStore>,
    inbound_policy: InboundPolicy,
) -> SyncCore {
    SyncCore::load(
        transport,
        LocalStoreAdapter::new(kv),
        SyncSettings { inbound_policy },
    )
    .await
}

async fn core_with_group(open: bool) -> (SyncCore, Arc<RecordingTransport>, ConversationId) {
    let transport = RecordingTransport::new(open);
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(transport.clone(), kv, InboundPolicy::Replace).await;
    let id = core
        .create_group("friends", vec![UserId::from("654321")])
        .await
        .expect("group");
    (core, transport, id)
}

fn remote_message(text: &str) -> Message {
    Message {
        text: text.to_string(),
        kind: MessageKind::User,
        timestamp: 1_700_000_000_000,
        sender_name: "Bia".to_string(),
        sender_avatar_ref: None,
    }
}

#[tokio::test]
async fn send_appends_locally_and_forwards_full_group() {
    let (core, transport, id) = core_with_group(true).await;
    core.save_profile("Ana", None).await.expect("profile");
    core.send_message(&id, "first", MessageKind::User).await;

    let outcome = core.send_message(&id, "hi", MessageKind::User).await;
    assert!(matches!(outcome, SendOutcome::Sent(_)));

    let group = core.get(&id).await.expect("group");
    let last = group.last_message().expect("message");
    assert_eq!(last.text, "hi");
    assert_eq!(last.kind, MessageKind::User);
    assert_eq!(last.sender_name, "Ana");

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 2);
    let envelope = &sent[1];
    assert_eq!(envelope["id"], json!(id.as_str()));
    assert_eq!(envelope["userIds"], json!(["654321"]));
    assert_eq!(envelope["messages"].as_array().map(Vec::len), Some(2));
    assert_eq!(envelope["messages"][1]["message"], json!("hi"));
    assert_eq!(envelope["unread"], json!({ core.user_id().as_str(): 1 }));
}

#[tokio::test]
async fn send_while_disconnected_keeps_optimistic_message() {
    let (core, transport, id) = core_with_group(false).await;

    let outcome = core.send_message(&id, "hi", MessageKind::User).await;
    assert!(matches!(outcome, SendOutcome::LocalOnly(_)));
    assert_eq!(outcome.message().map(|m| m.text.as_str()), Some("hi"));

    let group = core.get(&id).await.expect("group");
    assert_eq!(group.messages.len(), 1);
    assert_eq!(group.messages[0].text, "hi");
    assert!(transport.sent().await.is_empty());
}

#[tokio::test]
async fn blank_text_and_unknown_conversation_are_skipped() {
    let (core, transport, id) = core_with_group(true).await;

    assert_eq!(
        core.send_message(&id, "   \n", MessageKind::User).await,
        SendOutcome::Skipped(SkipReason::BlankText)
    );
    assert_eq!(
        core.send_message(&ConversationId::from("missing"), "hi", MessageKind::User)
            .await,
        SendOutcome::Skipped(SkipReason::UnknownConversation)
    );
    assert!(core.get(&id).await.expect("group").messages.is_empty());
    assert!(transport.sent().await.is_empty());
}

#[tokio::test]
async fn inbound_snapshot_replaces_history() {
    let (core, _transport, id) = core_with_group(false).await;
    core.send_message(&id, "one", MessageKind::User).await;
    core.send_message(&id, "two", MessageKind::User).await;

    let m1 = remote_message("from relay");
    let applied = core
        .on_envelope(InboundEnvelope::snapshot(id.clone(), vec![m1.clone()]))
        .await;

    assert!(applied);
    assert_eq!(core.get(&id).await.expect("group").messages, vec![m1]);
}

#[tokio::test]
async fn inbound_marks_unread_unless_active() {
    let (core, _transport, id) = core_with_group(true).await;

    core.on_envelope(InboundEnvelope::snapshot(id.clone(), vec![remote_message("a")]))
        .await;
    assert!(core.get(&id).await.expect("group").unread);

    core.set_active(Some(id.clone())).await.expect("activate");
    assert!(!core.get(&id).await.expect("group").unread);

    core.on_envelope(InboundEnvelope::snapshot(id.clone(), vec![remote_message("b")]))
        .await;
    assert!(!core.get(&id).await.expect("group").unread);
}

#[tokio::test]
async fn inbound_for_unknown_conversation_changes_nothing() {
    let (core, _transport, _id) = core_with_group(true).await;
    core.create_group("second", vec![UserId::from("222222")])
        .await
        .expect("second");
    let before = core.groups().await;

    let applied = core
        .on_envelope(InboundEnvelope::snapshot(
            "nonexistent",
            vec![remote_message("stray")],
        ))
        .await;

    let after = core.groups().await;
    assert!(!applied);
    assert!(Arc::ptr_eq(&before, &after));
    for (old, new) in before.iter().zip(after.iter()) {
        assert!(Arc::ptr_eq(old, new));
    }
}

#[tokio::test]
async fn malformed_frames_and_relay_replies_are_ignored() {
    let (core, _transport, id) = core_with_group(true).await;
    let before = core.groups().await;

    core.on_frame(json!({ "messages": [] })).await;
    core.on_frame(json!("not an object")).await;
    core.on_frame(json!({ "id": id.as_str(), "messages": "broken" }))
        .await;
    core.on_frame(json!({ "status": "success", "message": "User 1 connected." }))
        .await;
    core.on_frame(json!({ "error": "Invalid JSON structure" }))
        .await;

    assert!(Arc::ptr_eq(&before, &core.groups().await));
}

#[tokio::test]
async fn state_survives_reload_from_local_store() {
    let transport = RecordingTransport::new(false);
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(transport.clone(), kv.clone(), InboundPolicy::Replace).await;

    let first = core
        .create_group("friends", vec![UserId::from("654321")])
        .await
        .expect("first");
    let second = core
        .create_group("", vec![UserId::from("777777")])
        .await
        .expect("second");
    core.send_message(&first, "hello", MessageKind::User).await;
    core.on_envelope(InboundEnvelope::snapshot(
        second.clone(),
        vec![remote_message("hey")],
    ))
    .await;

    let reloaded = load_core(transport, kv, InboundPolicy::Replace).await;

    let expected: Vec<ConversationGroup> =
        core.groups().await.iter().map(|g| g.as_ref().clone()).collect();
    let actual: Vec<ConversationGroup> = reloaded
        .groups()
        .await
        .iter()
        .map(|g| g.as_ref().clone())
        .collect();
    assert_eq!(actual, expected);
    assert_eq!(reloaded.user_id(), core.user_id());
    assert!(reloaded.get(&second).await.expect("second").unread);
    assert!(reloaded.active().await.is_none());
}

#[tokio::test]
async fn first_load_generates_and_persists_user() {
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(RecordingTransport::new(false), kv.clone(), InboundPolicy::Replace).await;

    let stored = kv.get(USER_KEY).await.expect("get").expect("user stored");
    assert_eq!(stored["id"], json!(core.user_id().as_str()));
    assert_eq!(
        serde_json::to_value(core.registration()).expect("json"),
        json!({ "user_id": core.user_id().as_str() })
    );
    assert_eq!(kv.get(GROUPS_KEY).await.expect("get"), None);
    assert!(core.groups().await.is_empty());
}

#[tokio::test]
async fn unreadable_groups_start_empty() {
    let kv = Arc::new(MemoryKeyValueStore::new());
    kv.set(GROUPS_KEY, json!("garbage")).await.expect("seed");
    let core = load_core(RecordingTransport::new(false), kv, InboundPolicy::Replace).await;
    assert!(core.groups().await.is_empty());
}

#[tokio::test]
async fn deleting_active_conversation_clears_selection() {
    let (core, _transport, id) = core_with_group(true).await;
    core.set_active(Some(id.clone())).await.expect("activate");
    assert_eq!(core.active().await.map(|g| g.id.clone()), Some(id.clone()));

    let remaining = core.delete_group(&id).await;

    assert!(remaining.is_empty());
    assert!(core.active().await.is_none());
    assert!(core.get(&id).await.is_none());
}

#[tokio::test]
async fn delete_is_persisted() {
    let transport = RecordingTransport::new(false);
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(transport.clone(), kv.clone(), InboundPolicy::Replace).await;
    let id = core
        .create_group("gone", vec![UserId::from("1")])
        .await
        .expect("group");
    core.delete_group(&id).await;

    let reloaded = load_core(transport, kv, InboundPolicy::Replace).await;
    assert!(reloaded.groups().await.is_empty());
}

#[tokio::test]
async fn edit_keeps_messages_and_rejects_empty_membership() {
    let (core, _transport, id) = core_with_group(false).await;
    core.send_message(&id, "kept", MessageKind::User).await;

    core.edit_group(&id, "renamed", vec![UserId::from("654321"), UserId::from("999999")])
        .await
        .expect("edit");
    let group = core.get(&id).await.expect("group");
    assert_eq!(group.name, "renamed");
    assert_eq!(group.member_ids.len(), 2);
    assert_eq!(group.messages.len(), 1);

    let err = core
        .edit_group(&id, "nobody", Vec::new())
        .await
        .expect_err("no members");
    assert!(matches!(err, ClientError::Validation(ValidationError::NoMembers)));
    assert_eq!(core.get(&id).await.expect("group").name, "renamed");

    let err = core
        .edit_group(&ConversationId::from("missing"), "x", vec![UserId::from("1")])
        .await
        .expect_err("unknown");
    assert!(matches!(err, ClientError::UnknownConversation(_)));
}

#[tokio::test]
async fn profile_save_validates_and_persists() {
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(RecordingTransport::new(false), kv.clone(), InboundPolicy::Replace).await;

    let err = core.save_profile("  ", None).await.expect_err("blank");
    assert!(matches!(
        err,
        ClientError::Validation(ValidationError::BlankProfileName)
    ));

    let user = core
        .save_profile(" Ana ", Some("https://img/ana.png".to_string()))
        .await
        .expect("save");
    assert_eq!(user.name, "Ana");

    let stored = kv.get(USER_KEY).await.expect("get").expect("user");
    assert_eq!(stored["name"], json!("Ana"));
    assert_eq!(stored["image"], json!("https://img/ana.png"));
}

#[tokio::test]
async fn keep_pending_local_reappends_unechoed_sends() {
    let transport = RecordingTransport::new(true);
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(transport, kv, InboundPolicy::KeepPendingLocal).await;
    let id = core
        .create_group("friends", vec![UserId::from("654321")])
        .await
        .expect("group");

    let mine = core
        .send_message(&id, "mine", MessageKind::User)
        .await
        .message()
        .cloned()
        .expect("sent");
    let theirs = remote_message("theirs");

    core.on_envelope(InboundEnvelope::snapshot(id.clone(), vec![theirs.clone()]))
        .await;
    assert_eq!(
        core.get(&id).await.expect("group").messages,
        vec![theirs.clone(), mine.clone()]
    );

    core.on_envelope(InboundEnvelope::snapshot(
        id.clone(),
        vec![mine.clone(), theirs.clone()],
    ))
    .await;
    assert_eq!(
        core.get(&id).await.expect("group").messages,
        vec![mine.clone(), theirs.clone()]
    );

    // Echoed once, so no longer pending.
    core.on_envelope(InboundEnvelope::snapshot(id.clone(), vec![theirs.clone()]))
        .await;
    assert_eq!(core.get(&id).await.expect("group").messages, vec![theirs]);
}

#[tokio::test]
async fn keep_pending_local_does_not_hold_sends_the_relay_never_got() {
    let transport = RecordingTransport::new(false);
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(transport, kv, InboundPolicy::KeepPendingLocal).await;
    let id = core
        .create_group("friends", vec![UserId::from("654321")])
        .await
        .expect("group");

    let outcome = core.send_message(&id, "offline", MessageKind::User).await;
    assert!(matches!(outcome, SendOutcome::LocalOnly(_)));

    for round in 0..3 {
        let remote = remote_message(&format!("r{round}"));
        core.on_envelope(InboundEnvelope::snapshot(id.clone(), vec![remote.clone()]))
            .await;
        assert_eq!(core.get(&id).await.expect("group").messages, vec![remote]);
    }
}

#[tokio::test]
async fn run_applies_frames_in_arrival_order() {
    let (core, _transport, id) = core_with_group(true).await;
    let frames = vec![
        json!({ "id": id.as_str(), "messages": [remote_message("first")] }),
        json!({ "garbage": true }),
        json!({ "id": id.as_str(), "messages": [remote_message("first"), remote_message("second")] }),
    ];

    core.run(stream::iter(frames)).await;

    let texts: Vec<String> = core
        .get(&id)
        .await
        .expect("group")
        .messages
        .iter()
        .map(|m| m.text.clone())
        .collect();
    assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn subscribers_are_notified_of_sync_mutations() {
    let transport = RecordingTransport::new(false);
    let kv = Arc::new(MemoryKeyValueStore::new());
    let core = load_core(transport, kv, InboundPolicy::Replace).await;
    let mut changes = core.subscribe();

    let id = core
        .create_group("friends", vec![UserId::from("654321")])
        .await
        .expect("group");
    core.on_envelope(InboundEnvelope::snapshot(id.clone(), vec![remote_message("x")]))
        .await;

    assert_eq!(
        changes.recv().await.expect("created"),
        StoreChange::Upserted(id.clone())
    );
    assert_eq!(
        changes.recv().await.expect("snapshot"),
        StoreChange::Upserted(id)
    );
}

#[test]
fn inbound_policy_parses_config_values() {
    assert_eq!("replace".parse::<InboundPolicy>(), Ok(InboundPolicy::Replace));
    assert_eq!(
        "Keep-Pending-Local".parse::<InboundPolicy>(),
        Ok(InboundPolicy::KeepPendingLocal)
    );
    assert!("merge".parse::<InboundPolicy>().is_err());
}
