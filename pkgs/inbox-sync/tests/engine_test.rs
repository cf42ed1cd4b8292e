// Copyright 2024 Gigi Team.
//
// Tests for the reconciliation engine against an in-memory server

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use inbox_store::{DeliveryState, MessageId, ReadReceipt, SenderRole};
use inbox_sync::{
    decode_frame, ConnectionStatus, ConversationPayload, InboxApi, MessagePayload,
    SendMessageRequest, SharedStore, StoreUpdate, SyncConfig, SyncEngine, SyncError,
    TransportEvent,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn payload(id: i64, conversation: &str, role: SenderRole, text: &str, secs: i64) -> MessagePayload {
    MessagePayload {
        id,
        conversation_id: conversation.to_string(),
        content: Some(text.to_string()),
        sender_name: "Dana".to_string(),
        sender_role: role,
        created_at: at(secs),
        attachments: vec![],
        read_at: None,
        client_message_id: None,
    }
}

fn conversation(id: &str, messages: Vec<MessagePayload>) -> ConversationPayload {
    ConversationPayload {
        id: id.to_string(),
        title: format!("Project {}", id),
        participant_name: "Dana".to_string(),
        participant_contact: "dana@example.com".to_string(),
        messages,
    }
}

/// Server double; records read reports and can echo sends into the store
/// the way the push channel would.
#[derive(Default)]
struct MockApi {
    conversations: Mutex<HashMap<String, ConversationPayload>>,
    reads: Mutex<Vec<i64>>,
    sent: Mutex<Vec<SendMessageRequest>>,
    fail_sends: AtomicBool,
    reset_before_failing: AtomicBool,
    fail_reads: AtomicBool,
    next_id: AtomicI64,
    push_echo_into: Mutex<Option<SharedStore>>,
}

impl MockApi {
    fn with_conversations(conversations: Vec<ConversationPayload>) -> Self {
        let api = MockApi {
            next_id: AtomicI64::new(100),
            ..Default::default()
        };
        for c in conversations {
            api.conversations.lock().insert(c.id.clone(), c);
        }
        api
    }
}

#[async_trait]
impl InboxApi for MockApi {
    async fn fetch_conversations(&self) -> inbox_sync::Result<Vec<ConversationPayload>> {
        let mut all: Vec<_> = self.conversations.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> inbox_sync::Result<ConversationPayload> {
        self.conversations
            .lock()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| SyncError::Rejected {
                endpoint: format!("conversations/{}", conversation_id),
                status: 404,
            })
    }

    async fn send_message(&self, request: &SendMessageRequest) -> inbox_sync::Result<MessagePayload> {
        self.sent.lock().push(request.clone());
        if self.fail_sends.load(Ordering::SeqCst) {
            // Simulates a logout landing while the request is in flight
            if self.reset_before_failing.load(Ordering::SeqCst) {
                if let Some(store) = self.push_echo_into.lock().as_ref() {
                    store.lock().reset();
                }
            }
            return Err(SyncError::Rejected {
                endpoint: "messages".to_string(),
                status: 503,
            });
        }
        let mut echo = payload(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            &request.conversation_id,
            SenderRole::Internal,
            &request.body,
            1_000,
        );
        echo.attachments = request.attachment_keys.clone();

        // Push copy lands first and without the client token
        if let Some(store) = self.push_echo_into.lock().as_ref() {
            store.lock().append_message(echo.clone().into_message());
        }

        echo.client_message_id = Some(request.client_message_id.clone());
        Ok(echo)
    }

    async fn mark_read(&self, message_id: i64) -> inbox_sync::Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Rejected {
                endpoint: format!("messages/{}/read", message_id),
                status: 500,
            });
        }
        self.reads.lock().push(message_id);
        Ok(())
    }
}

fn engine_with(conversations: Vec<ConversationPayload>) -> (SyncEngine<MockApi>, Arc<MockApi>) {
    let api = Arc::new(MockApi::with_conversations(conversations));
    let config = SyncConfig::default();
    let store = Arc::new(Mutex::new(inbox_store::ConversationStore::with_config(
        config.store_config(),
    )));
    (SyncEngine::with_store(store, api.clone(), config), api)
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn server_ids(ids: &[i64]) -> Vec<MessageId> {
    ids.iter().map(|id| MessageId::Server(*id)).collect()
}

fn ids(engine: &SyncEngine<MockApi>, conversation: &str) -> Vec<MessageId> {
    engine
        .conversation(conversation)
        .unwrap()
        .messages
        .iter()
        .map(|m| m.id.clone())
        .collect()
}

#[tokio::test]
async fn test_cold_start_then_live_message_in_time_order() {
    let (engine, _api) = engine_with(vec![conversation(
        "x",
        vec![
            payload(1, "x", SenderRole::External, "first", 10),
            payload(2, "x", SenderRole::Internal, "second", 20),
            payload(3, "x", SenderRole::External, "third", 30),
        ],
    )]);

    assert_eq!(engine.cold_start().await.unwrap(), 3);
    let conversation = engine.conversation("x").unwrap();
    assert_eq!(conversation.title, "Project x");
    assert_eq!(conversation.unread_count, 2);

    let frame = json!({
        "event": "newMessage",
        "data": {
            "id": 4,
            "conversationId": "x",
            "content": "late arrival",
            "senderRole": "client",
            "createdAt": at(15).to_rfc3339()
        }
    })
    .to_string();
    engine.handle_event(decode_frame(&frame).unwrap().unwrap());

    assert_eq!(
        ids(&engine, "x"),
        server_ids(&[1, 4, 2, 3])
    );
    assert_eq!(engine.conversation("x").unwrap().unread_count, 3);
}

#[tokio::test]
async fn test_cold_start_twice_is_idempotent() {
    let (engine, _api) = engine_with(vec![conversation(
        "x",
        vec![payload(1, "x", SenderRole::External, "hi", 0)],
    )]);

    assert_eq!(engine.cold_start().await.unwrap(), 1);
    assert_eq!(engine.cold_start().await.unwrap(), 0);
    assert_eq!(ids(&engine, "x"), server_ids(&[1]));
}

#[tokio::test]
async fn test_send_confirmed_by_http_and_push_leaves_one_message() {
    let (engine, api) = engine_with(vec![conversation("x", vec![])]);
    engine.cold_start().await.unwrap();

    let id = engine.send_message("x", "On my way", vec![]).await.unwrap();
    assert_eq!(id, MessageId::Server(100));

    // Same server message through the push channel afterwards
    let mut push = payload(100, "x", SenderRole::Internal, "On my way", 1_000);
    push.client_message_id = Some(api.sent.lock()[0].client_message_id.clone());
    engine.handle_event(TransportEvent::Message(push.into_message()));

    let conversation = engine.conversation("x").unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].id, MessageId::Server(100));
    assert_eq!(conversation.messages[0].delivery, DeliveryState::Sent);
}

#[tokio::test]
async fn test_push_echo_before_http_response_converges() {
    let (engine, api) = engine_with(vec![conversation("x", vec![])]);
    *api.push_echo_into.lock() = Some(engine.store());

    let id = engine
        .send_message("x", "Invoice attached", vec!["inv.pdf".to_string()])
        .await
        .unwrap();

    assert_eq!(id, MessageId::Server(100));
    assert_eq!(ids(&engine, "x"), vec![MessageId::Server(100)]);
}

#[tokio::test]
async fn test_failed_send_is_flagged_and_retried_under_same_id() {
    let (engine, api) = engine_with(vec![conversation("x", vec![])]);
    api.fail_sends.store(true, Ordering::SeqCst);

    let err = engine.send_message("x", "hello", vec![]).await.unwrap_err();
    assert!(matches!(err, SyncError::Rejected { status: 503, .. }));

    let failed = engine.conversation("x").unwrap().messages[0].clone();
    assert!(failed.is_optimistic());
    assert!(failed.send_failed());
    let MessageId::Local(local_id) = failed.id.clone() else {
        panic!("expected a local id");
    };

    api.fail_sends.store(false, Ordering::SeqCst);
    let id = engine.retry_send("x", &local_id).await.unwrap();

    assert_eq!(ids(&engine, "x"), vec![id]);
    let sent = api.sent.lock();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].client_message_id, sent[1].client_message_id);
    assert_eq!(sent[1].client_message_id, local_id);
}

#[tokio::test]
async fn test_send_failure_after_reset_reports_request_error() {
    let (engine, api) = engine_with(vec![conversation("x", vec![])]);
    *api.push_echo_into.lock() = Some(engine.store());
    api.fail_sends.store(true, Ordering::SeqCst);
    api.reset_before_failing.store(true, Ordering::SeqCst);

    let err = engine.send_message("x", "hello", vec![]).await.unwrap_err();

    assert!(matches!(err, SyncError::Rejected { status: 503, .. }));
    assert!(engine.conversation("x").is_none());
}

#[tokio::test]
async fn test_retry_of_unknown_message_fails() {
    let (engine, _api) = engine_with(vec![conversation("x", vec![])]);
    engine.cold_start().await.unwrap();

    assert!(matches!(
        engine.retry_send("x", "missing").await,
        Err(SyncError::Store(_))
    ));
}

#[tokio::test]
async fn test_stale_history_is_discarded() {
    let (engine, _api) = engine_with(vec![
        conversation("a", vec![payload(1, "a", SenderRole::External, "a1", 0)]),
        conversation("b", vec![payload(2, "b", SenderRole::External, "b1", 0)]),
    ]);

    let first = engine.begin_fetch("a");
    let second = engine.begin_fetch("b");

    assert!(!engine.load_conversation(first).await.unwrap());
    assert!(engine.load_conversation(second).await.unwrap());
    assert!(engine.conversation("a").is_none());
    assert_eq!(ids(&engine, "b"), server_ids(&[2]));
    assert_eq!(engine.selected_conversation().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_select_marks_read_and_reports() {
    let (engine, api) = engine_with(vec![conversation(
        "x",
        vec![
            payload(1, "x", SenderRole::External, "one", 0),
            payload(2, "x", SenderRole::External, "two", 1),
            payload(3, "x", SenderRole::Internal, "reply", 2),
        ],
    )]);
    engine.cold_start().await.unwrap();

    assert!(engine.select_conversation("x").await.unwrap());
    assert_eq!(engine.conversation("x").unwrap().unread_count, 0);

    wait_for(|| api.reads.lock().len() == 2).await;
    let mut reads = api.reads.lock().clone();
    reads.sort();
    assert_eq!(reads, vec![1, 2]);
}

#[tokio::test]
async fn test_failed_read_report_keeps_local_state() {
    let (engine, api) = engine_with(vec![conversation(
        "x",
        vec![payload(1, "x", SenderRole::External, "one", 0)],
    )]);
    engine.cold_start().await.unwrap();
    api.fail_reads.store(true, Ordering::SeqCst);

    let reports = engine.mark_read("x");
    assert_eq!(reports.len(), 1);
    for report in reports {
        report.await.unwrap();
    }

    assert_eq!(engine.conversation("x").unwrap().unread_count, 0);
    assert!(engine.mark_read("x").is_empty());
}

#[tokio::test]
async fn test_receipts_apply_and_tolerate_unknown_messages() {
    let (engine, _api) = engine_with(vec![conversation(
        "x",
        vec![payload(1, "x", SenderRole::External, "one", 0)],
    )]);
    engine.cold_start().await.unwrap();

    engine.handle_event(TransportEvent::ReadReceipt(ReadReceipt::Single {
        message_id: 99,
        read_at: at(5),
    }));
    engine.handle_event(TransportEvent::ReadReceipt(ReadReceipt::Batch {
        conversation_id: "x".to_string(),
        message_ids: vec![1],
        read_at: at(6),
    }));
    assert_eq!(engine.conversation("x").unwrap().unread_count, 0);

    engine.handle_event(TransportEvent::Message(
        payload(99, "x", SenderRole::External, "late", 3).into_message(),
    ));
    assert_eq!(engine.conversation("x").unwrap().unread_count, 0);
}

#[tokio::test]
async fn test_run_applies_events_until_channel_closes() {
    let (engine, _api) = engine_with(vec![]);
    let mut updates = engine.subscribe();
    let connectivity = engine.connectivity();
    let (tx, rx) = mpsc::unbounded_channel();

    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(rx).await }
    });

    tx.send(TransportEvent::Status(ConnectionStatus::Connected))
        .unwrap();
    tx.send(TransportEvent::Message(
        payload(1, "y", SenderRole::External, "hello", 0).into_message(),
    ))
    .unwrap();
    tx.send(TransportEvent::Message(
        payload(1, "y", SenderRole::External, "hello", 0).into_message(),
    ))
    .unwrap();
    drop(tx);
    runner.await.unwrap();

    assert_eq!(
        updates.recv().await.unwrap(),
        StoreUpdate::Connectivity {
            status: ConnectionStatus::Connected
        }
    );
    assert_eq!(
        updates.recv().await.unwrap(),
        StoreUpdate::Conversation {
            conversation_id: "y".to_string()
        }
    );
    // duplicate produced no update
    assert_eq!(
        updates.recv().await.unwrap(),
        StoreUpdate::Connectivity {
            status: ConnectionStatus::Stopped
        }
    );
    assert_eq!(*connectivity.borrow(), ConnectionStatus::Stopped);
    assert_eq!(ids(&engine, "y"), server_ids(&[1]));
}

#[tokio::test]
async fn test_conversation_list_and_threads() {
    let (engine, _api) = engine_with(vec![
        conversation("quiet", vec![payload(1, "quiet", SenderRole::Internal, "done", 500)]),
        conversation(
            "busy",
            vec![
                payload(2, "busy", SenderRole::External, "Can we schedule a call?", 0),
                payload(3, "busy", SenderRole::External, "The invoice is wrong", 20_000),
            ],
        ),
    ]);
    engine.cold_start().await.unwrap();

    let order: Vec<String> = engine
        .conversation_list()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(order, vec!["busy".to_string(), "quiet".to_string()]);

    let threads = engine.threads("busy");
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].category, "billing");
    assert_eq!(threads[1].category, "scheduling");
}

#[tokio::test]
async fn test_reset_clears_state_and_selection() {
    let (engine, _api) = engine_with(vec![conversation(
        "x",
        vec![payload(1, "x", SenderRole::External, "hi", 0)],
    )]);
    engine.cold_start().await.unwrap();
    let ticket = engine.begin_fetch("x");

    engine.reset();

    assert!(engine.conversation_list().is_empty());
    assert!(engine.selected_conversation().is_none());
    assert!(!engine.load_conversation(ticket).await.unwrap());
}
