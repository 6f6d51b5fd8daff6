/// Send pipeline tests
mod common;

use bytes::Bytes;
use chatsync_core::api::OutgoingFile;
use chatsync_core::error::ChatError;
use chatsync_core::message_store::MessageStore;
use chatsync_core::messenger_types::DeliveryState;
use chatsync_core::push::ChatEvent;
use chatsync_core::send_pipeline::OptimisticSendPipeline;
use common::{numbered, wait_until, FakeServer, CONV};
use std::sync::Arc;

async fn setup(server: &Arc<FakeServer>) -> (MessageStore, Arc<OptimisticSendPipeline>) {
    let store = MessageStore::new(server.clone());
    store.load_initial(CONV).await.unwrap();
    let pipeline = OptimisticSendPipeline::new(store.clone(), server.clone(), CONV, "me");
    (store, Arc::new(pipeline))
}

fn photo() -> OutgoingFile {
    OutgoingFile {
        file_name: "photo.jpg".to_string(),
        content_type: Some("image/jpeg".to_string()),
        data: Bytes::from_static(b"\xff\xd8\xff"),
    }
}

#[tokio::test]
async fn test_optimistic_entry_confirmed_by_push_echo() {
    let server = FakeServer::with_messages(numbered(3));
    server.set_no_echo(true);
    let (store, pipeline) = setup(&server).await;

    let local = pipeline.send_text("hi there").await.unwrap();
    assert_eq!(local.delivery, DeliveryState::Pending);
    assert!(!local.is_sent());
    assert_eq!(store.len(), 4);
    assert_eq!(store.messages()[0].message_id, local.message_id);

    // the request carried the client id
    let sends = server.sends();
    assert_eq!(sends[0].message_id.as_deref(), Some(local.message_id.as_str()));
    assert_eq!(sends[0].text, "hi there");

    // server's created event for the same id
    let echo = server.get(&local.message_id).unwrap();
    store.apply_event(ChatEvent::Created(echo.clone()));

    assert_eq!(store.len(), 4);
    let confirmed = store.get(&local.message_id).unwrap();
    assert!(confirmed.is_sent());
    assert_eq!(confirmed.created_at, echo.created_at);

    // the echo again changes nothing
    let snapshot = store.messages();
    store.apply_event(ChatEvent::Created(echo));
    assert_eq!(store.messages(), snapshot);
}

#[tokio::test]
async fn test_response_body_confirms_immediately() {
    let server = FakeServer::with_messages(numbered(1));
    let (store, pipeline) = setup(&server).await;

    let sent = pipeline.send_text("  trimmed  ").await.unwrap();
    assert!(sent.is_sent());
    assert_eq!(sent.body, "trimmed");
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_empty_text_is_rejected() {
    let server = FakeServer::with_messages(numbered(1));
    let (store, pipeline) = setup(&server).await;

    let err = pipeline.send_text("   ").await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidInput(_)));
    assert_eq!(store.len(), 1);
    assert!(server.sends().is_empty());
}

#[tokio::test]
async fn test_failed_send_stays_visible_then_retry() {
    let server = FakeServer::with_messages(numbered(2));
    server.fail_sends(1);
    let (store, pipeline) = setup(&server).await;

    assert!(pipeline.send_text("flaky").await.is_err());
    let failed = store.messages()[0].clone();
    assert_eq!(failed.body, "flaky");
    assert_eq!(failed.delivery, DeliveryState::Failed);
    assert_eq!(store.len(), 3);

    let retried = pipeline.retry(&failed.message_id).await.unwrap();
    assert_eq!(retried.message_id, failed.message_id);
    assert!(retried.is_sent());
    assert_eq!(store.len(), 3);

    let sends = server.sends();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0].message_id, sends[1].message_id);

    // only failed entries can be retried
    let err = pipeline.retry(&failed.message_id).await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidState(_)));
}

#[tokio::test]
async fn test_discard_failed_entry() {
    let server = FakeServer::with_messages(numbered(2));
    server.fail_sends(1);
    let (store, pipeline) = setup(&server).await;

    assert!(pipeline.send_text("oops").await.is_err());
    let failed_id = store.messages()[0].message_id.clone();

    assert!(matches!(
        pipeline.discard("m1").unwrap_err(),
        ChatError::InvalidState(_)
    ));
    let removed = pipeline.discard(&failed_id).unwrap();
    assert_eq!(removed.body, "oops");
    assert_eq!(store.len(), 2);
    assert!(store.get(&failed_id).is_none());
}

#[tokio::test]
async fn test_attachment_send_blocks_without_optimistic_entry() {
    let server = FakeServer::with_messages(numbered(2));
    let (store, pipeline) = setup(&server).await;
    pipeline.set_draft_text("look");
    pipeline.add_attachment(photo());

    server.hold_sends();
    let submit = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.submit().await }
    });
    wait_until(|| pipeline.is_sending()).await;

    assert_eq!(store.len(), 2);
    let err = pipeline
        .send_with_attachments("again", vec![photo()])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidState(_)));

    let mut sending = pipeline.watch_sending();
    server.open_sends();
    submit.await.unwrap().unwrap();
    sending.wait_for(|s| !*s).await.unwrap();

    assert!(!pipeline.is_sending());
    assert!(pipeline.draft().is_empty());
    assert_eq!(store.len(), 3);
    let sends = server.sends();
    assert_eq!(sends[0].message_id, None);
    assert_eq!(sends[0].files.len(), 1);
    assert_eq!(sends[0].text, "look");
}

#[tokio::test]
async fn test_failed_attachment_send_keeps_draft() {
    let server = FakeServer::with_messages(numbered(1));
    server.fail_sends(1);
    let (store, pipeline) = setup(&server).await;
    pipeline.set_draft_text("caption");
    pipeline.add_attachment(photo());

    assert!(pipeline.submit().await.is_err());
    assert!(!pipeline.is_sending());
    let draft = pipeline.draft();
    assert_eq!(draft.text, "caption");
    assert_eq!(draft.files.len(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_text_submit_clears_draft_right_away() {
    let server = FakeServer::with_messages(numbered(1));
    server.fail_sends(1);
    let (store, pipeline) = setup(&server).await;
    pipeline.set_draft_text("quick");

    // the failed entry keeps the text, so the draft is not restored
    assert!(pipeline.submit().await.is_err());
    assert_eq!(pipeline.draft().text, "");
    assert_eq!(store.messages()[0].body, "quick");

    let err = pipeline.submit().await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidInput(_)));
}

#[tokio::test]
async fn test_edit_waits_for_server() {
    let server = FakeServer::with_messages(numbered(3));
    let (store, pipeline) = setup(&server).await;

    pipeline.edit("m2", "better words").await.unwrap();
    let m2 = store.get("m2").unwrap();
    assert_eq!(m2.body, "better words");
    assert!(m2.is_edited());

    let err = pipeline.edit("nope", "x").await.unwrap_err();
    assert!(matches!(err, ChatError::Api { status: 404, .. }));
}

#[tokio::test]
async fn test_delete_marks_message() {
    let server = FakeServer::with_messages(numbered(3));
    let (store, pipeline) = setup(&server).await;

    pipeline.delete("m3").await.unwrap();
    assert!(store.get("m3").unwrap().is_deleted());
    assert!(server.get("m3").unwrap().is_deleted());
    assert_eq!(store.len(), 3);
}
