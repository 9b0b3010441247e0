mod common;

use common::mock_gmail::{inbound_message, with_attachment};
use common::{Harness, CONTACT_EMAIL, CONTACT_ID, FRONTEND_URL, USER_ID, WORKSPACE_ID};
use crm_gmail_connector::models::RealtimeEvent;
use crm_gmail_connector::MailSyncError;
use shared::{AccountDirectory, MessageDirection, SyncCursor};

const BOB: &str = "Bob Customer <bob@customer.com>";

#[tokio::test]
async fn test_fresh_inbound_message_is_ingested_end_to_end() {
    let h = Harness::new().await;
    h.mock
        .add_message(inbound_message("m1", BOB, "Quote request", "Can you send a quote?", 1_700_000_000_000));
    h.mock.set_history_added(&["m1"], 120);
    let mut events = h.engine.realtime.subscribe(USER_ID);

    let report = h
        .engine
        .pipeline
        .run(USER_ID, Some(SyncCursor::new(100)))
        .await
        .unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.ingested, 1);
    assert_eq!(report.cursor_advanced_to, Some(SyncCursor::new(120)));
    assert_eq!(h.mock.history_starts(), vec!["100".to_string()]);

    let stored = h.messages.all().await;
    assert_eq!(stored.len(), 1);
    let message = &stored[0];
    assert_eq!(message.direction, MessageDirection::Received);
    assert_eq!(message.contact_id.as_deref(), Some(CONTACT_ID));
    assert_eq!(message.workspace_id, WORKSPACE_ID);
    assert_eq!(message.counterpart, CONTACT_EMAIL);
    assert_eq!(message.subject, "Quote request");
    assert_eq!(message.body, "Can you send a quote?");
    assert_eq!(message.message_id, "m1");
    assert_eq!(message.sent_at.unix_timestamp(), 1_700_000_000);

    let notifications = h.notifications.all().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "New Email: Quote request");
    assert_eq!(notifications[0].body, "New email received from bob@customer.com");
    assert_eq!(
        notifications[0].link.as_deref(),
        Some(format!("{}/customerinfo/{}", FRONTEND_URL, CONTACT_ID).as_str())
    );

    match events.try_recv().unwrap() {
        RealtimeEvent::NewEmail(payload) => {
            assert_eq!(payload.contact_id, CONTACT_ID);
            assert_eq!(payload.notification.id, notifications[0].id);
        }
        other => panic!("expected newEmail, got {:?}", other),
    }
    assert!(matches!(
        events.try_recv().unwrap(),
        RealtimeEvent::UpdateEmails(payload) if payload.contact_id == CONTACT_ID
    ));

    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(120)));
}

#[tokio::test]
async fn test_same_message_twice_is_stored_once() {
    let h = Harness::new().await;
    h.mock
        .add_message(inbound_message("m1", BOB, "Hello", "Hi there", 1_700_000_000_000));
    h.mock.set_history_added(&["m1"], 120);

    let first = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();
    let second = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(first.ingested, 1);
    assert_eq!(second.ingested, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(h.messages.len().await, 1);
    assert_eq!(h.notifications.all().await.len(), 1);
}

#[tokio::test]
async fn test_sender_without_contact_is_never_persisted() {
    let h = Harness::new().await;
    h.mock.add_message(inbound_message(
        "m-news",
        "Newsletter <news@marketing.example>",
        "Big sale",
        "Buy now",
        1_700_000_000_000,
    ));
    h.mock.set_history_added(&["m-news"], 130);
    let mut events = h.engine.realtime.subscribe(USER_ID);

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(report.not_correlated, 1);
    assert_eq!(h.messages.len().await, 0);
    assert!(h.notifications.all().await.is_empty());
    assert!(events.try_recv().is_err());
    // Skipped messages still count as processed.
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(130)));
}

#[tokio::test]
async fn test_cursor_never_regresses_across_runs() {
    let h = Harness::new().await;
    let mut observed = Vec::new();

    for position in [120, 110, 150, 150, 149] {
        h.mock.set_history_added(&[], position);
        h.engine
            .pipeline
            .run(USER_ID, Some(SyncCursor::new(100)))
            .await
            .unwrap();
        observed.push(h.stored_cursor().await.unwrap().value());
    }

    assert_eq!(observed, vec![120, 120, 150, 150, 150]);
    assert!(observed.windows(2).all(|pair| pair[1] >= pair[0]));
}

#[tokio::test]
async fn test_attachment_failure_does_not_affect_other_messages() {
    let h = Harness::new().await;
    let ids = ["m1", "m2", "m3", "m4", "m5"];

    for (i, id) in ids.iter().enumerate() {
        let n = i + 1;
        let mut message = inbound_message(
            id,
            BOB,
            &format!("Message {}", n),
            "See attached",
            1_700_000_000_000 + n as i64 * 1000,
        );
        message = with_attachment(message, &format!("file-{}.txt", n), &format!("att-{}", n));
        h.mock.add_attachment(&format!("att-{}", n), format!("content {}", n).as_bytes());
        if n == 3 {
            message = with_attachment(message, "extra-3.txt", "att-3b");
            h.mock.add_attachment("att-3b", b"extra");
        }
        h.mock.add_message(message);
    }
    h.mock.set_history_added(&ids, 200);
    h.storage.fail_uploads_named("file-3.txt");

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(report.candidates, 5);
    assert_eq!(report.ingested, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(200)));

    let stored = h.messages.all().await;
    assert_eq!(stored.len(), 5);
    for message in &stored {
        let names: Vec<&str> = message.attachments.iter().map(|a| a.filename.as_str()).collect();
        if message.message_id == "m3" {
            assert_eq!(names, vec!["extra-3.txt"]);
        } else {
            assert_eq!(names.len(), 1);
            assert!(names[0].starts_with("file-"));
        }
    }
    assert_eq!(h.storage.len(), 5);
}

#[tokio::test]
async fn test_expired_cursor_falls_back_to_recent_inbox_scan() {
    let h = Harness::with_cursor(Some(SyncCursor::new(50))).await;
    for n in 1..=12 {
        h.mock.add_message(inbound_message(
            &format!("m{}", n),
            BOB,
            &format!("Message {}", n),
            "Body",
            1_700_000_000_000 + n * 1000,
        ));
    }
    h.mock.state().history_expired = true;

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(60))).await.unwrap();

    assert!(report.used_fallback);
    assert_eq!(report.candidates, 10);
    assert_eq!(report.ingested, 10);
    assert_eq!(report.cursor_advanced_to, None);
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(50)));
    assert_eq!(
        h.mock.state().list_requests[0].get("maxResults").map(String::as_str),
        Some("10")
    );

    // The next push carries a fresh position; the rejected cursor is skipped.
    h.mock
        .add_message(inbound_message("m-new", BOB, "Later", "Body", 1_700_000_100_000));
    h.mock.set_history_added(&["m-new"], 200);

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(190))).await.unwrap();

    assert!(!report.used_fallback);
    assert_eq!(report.ingested, 1);
    assert_eq!(h.mock.history_starts().last().map(String::as_str), Some("190"));
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(200)));
}

#[tokio::test]
async fn test_message_deleted_before_fetch_is_skipped() {
    let h = Harness::new().await;
    h.mock
        .add_message(inbound_message("m1", BOB, "Kept", "Body", 1_700_000_000_000));
    h.mock.set_history_added(&["m1", "m-gone"], 140);

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(report.ingested, 1);
    assert_eq!(report.vanished, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(140)));
}

#[tokio::test]
async fn test_revoked_credential_flags_account_and_keeps_cursor() {
    let h = Harness::with_cursor(Some(SyncCursor::new(80))).await;
    h.mock.state().token_revoked = true;
    h.mock.set_history_added(&[], 120);

    let result = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await;

    assert!(matches!(result, Err(MailSyncError::ProviderAuth(_))));
    assert!(h.mock.history_starts().is_empty());
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(80)));
    let account = h.accounts.find_by_id(USER_ID).await.unwrap().unwrap();
    assert!(account.needs_reauth);
    assert!(h.accounts.list_linked().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_refresh_secret_aborts_only_that_user() {
    let h = Harness::new().await;
    h.accounts
        .add_account("user-unlinked", "carol@biz.com", None, None, &[WORKSPACE_ID])
        .await;
    h.mock
        .add_message(inbound_message("m1", BOB, "Hi", "Body", 1_700_000_000_000));
    h.mock.set_history_added(&["m1"], 120);

    let unlinked = h.engine.pipeline.run("user-unlinked", Some(SyncCursor::new(100))).await;
    assert!(matches!(unlinked, Err(MailSyncError::CredentialMissing(_))));
    assert_eq!(h.mock.state().token_requests, 0);

    let linked = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();
    assert_eq!(linked.ingested, 1);
}

#[tokio::test]
async fn test_first_sync_without_any_cursor_starts_at_mailbox_head() {
    let h = Harness::new().await;
    h.mock.state().profile_position = 300;
    h.mock.set_history_added(&[], 300);

    let report = h.engine.pipeline.run(USER_ID, None).await.unwrap();

    assert_eq!(report.candidates, 0);
    assert_eq!(h.mock.history_starts(), vec!["300".to_string()]);
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(300)));
}

#[tokio::test]
async fn test_scheduled_poll_runs_every_linked_mailbox() {
    let h = Harness::new().await;
    h.accounts
        .add_account("user-dave", "dave@biz.com", Some("refresh-dave"), None, &[WORKSPACE_ID])
        .await;
    h.accounts
        .add_account("user-erin", "erin@biz.com", None, None, &[WORKSPACE_ID])
        .await;
    h.mock.state().profile_position = 40;
    h.mock.set_history_added(&[], 45);

    let completed = h.engine.pipeline.run_all_linked().await.unwrap();

    assert_eq!(completed, 2);
    let dave = h.accounts.find_by_id("user-dave").await.unwrap().unwrap();
    assert_eq!(dave.cursor(), Some(SyncCursor::new(45)));
}

#[tokio::test]
async fn test_overlapping_runs_for_one_user_ingest_once() {
    let h = Harness::new().await;
    for n in 1..=4 {
        h.mock.add_message(inbound_message(
            &format!("m{}", n),
            BOB,
            "Concurrent",
            "Body",
            1_700_000_000_000 + n * 1000,
        ));
    }
    h.mock.set_history_added(&["m1", "m2", "m3", "m4"], 160);

    let pipeline = h.engine.pipeline.clone();
    let (a, b) = tokio::join!(
        pipeline.run(USER_ID, Some(SyncCursor::new(100))),
        pipeline.run(USER_ID, Some(SyncCursor::new(100)))
    );

    assert_eq!(a.unwrap().ingested + b.unwrap().ingested, 4);
    assert_eq!(h.messages.len().await, 4);
    assert_eq!(h.notifications.all().await.len(), 4);
}

fn add_inbound(h: &Harness, ids: &[&str]) {
    for (n, id) in ids.iter().enumerate() {
        h.mock.add_message(inbound_message(
            id,
            BOB,
            &format!("Message {}", id),
            "Body",
            1_700_000_000_000 + n as i64 * 1000,
        ));
    }
}

#[tokio::test]
async fn test_history_pages_are_followed_to_the_end() {
    let h = Harness::build(None, |config| config.sync.history_page_size = 2).await;
    let ids = ["m1", "m2", "m3", "m4", "m5"];
    add_inbound(&h, &ids);
    h.mock.set_history_added(&ids, 250);

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(report.candidates, 5);
    assert_eq!(report.ingested, 5);
    assert_eq!(report.cursor_advanced_to, Some(SyncCursor::new(250)));
    assert_eq!(
        h.mock.history_pages_requested(),
        vec![
            ("100".to_string(), None),
            ("100".to_string(), Some("2".to_string())),
            ("100".to_string(), Some("4".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_truncated_history_resumes_from_last_record_seen() {
    let h = Harness::build(None, |config| config.sync.history_page_size = 1).await;
    let ids: Vec<String> = (1..=12).map(|n| format!("m{}", n)).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    add_inbound(&h, &ids);
    // Records 489..=500, one per page.
    h.mock.set_history_added(&ids, 500);

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(488))).await.unwrap();

    assert_eq!(h.mock.history_pages_requested().len(), 10);
    assert_eq!(report.candidates, 10);
    assert_eq!(report.ingested, 10);
    assert_eq!(report.cursor_advanced_to, Some(SyncCursor::new(498)));
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(498)));

    h.mock.set_history_added(&["m11", "m12"], 500);
    let report = h.engine.pipeline.run(USER_ID, None).await.unwrap();

    assert_eq!(h.mock.history_starts().last().map(String::as_str), Some("498"));
    assert_eq!(report.ingested, 2);
    assert_eq!(h.messages.len().await, 12);
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(500)));
}

#[tokio::test]
async fn test_provider_outage_on_history_keeps_cursor() {
    let h = Harness::with_cursor(Some(SyncCursor::new(80))).await;
    add_inbound(&h, &["m1"]);
    h.mock.set_history_added(&["m1"], 120);
    h.mock.state().history_failure = Some(503);

    let result = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await;

    assert!(matches!(result, Err(MailSyncError::ProviderUnavailable(_))));
    assert_eq!(h.mock.history_starts(), vec!["80".to_string(), "80".to_string()]);
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(80)));
    assert_eq!(h.messages.len().await, 0);

    h.mock.state().history_failure = None;
    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(120)));
}

#[tokio::test]
async fn test_transient_message_failure_holds_cursor_until_retried() {
    let h = Harness::new().await;
    add_inbound(&h, &["m1", "m2", "m3"]);
    h.mock.set_history_added(&["m1", "m2", "m3"], 150);
    h.mock.state().failing_messages.insert("m2".to_string());

    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(report.ingested, 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.cursor_advanced_to, None);
    assert_eq!(h.stored_cursor().await, None);
    assert_eq!(h.messages.len().await, 2);

    h.mock.state().failing_messages.clear();
    let report = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(report.ingested, 1);
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.cursor_advanced_to, Some(SyncCursor::new(150)));
    let mut stored: Vec<String> = h.messages.all().await.into_iter().map(|m| m.message_id).collect();
    stored.sort();
    assert_eq!(stored, vec!["m1", "m2", "m3"]);
    assert_eq!(h.notifications.all().await.len(), 3);
}

#[tokio::test]
async fn test_notification_lost_to_outage_is_created_on_next_run() {
    let h = Harness::new().await;
    add_inbound(&h, &["m1"]);
    h.mock.set_history_added(&["m1"], 120);
    h.notifications.fail_next_creates(1);
    let mut events = h.engine.realtime.subscribe(USER_ID);

    let first = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(first.deferred, 1);
    assert_eq!(first.ingested, 0);
    assert_eq!(h.messages.len().await, 1);
    assert!(h.notifications.all().await.is_empty());
    assert_eq!(h.stored_cursor().await, None);
    assert!(events.try_recv().is_err());

    let second = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(second.ingested, 1);
    assert_eq!(h.messages.len().await, 1);
    let notifications = h.notifications.all().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "New Email: Message m1");
    assert_eq!(
        notifications[0].email_id.as_deref(),
        Some(h.messages.all().await[0].id.as_str())
    );
    assert!(matches!(events.try_recv().unwrap(), RealtimeEvent::NewEmail(_)));
    assert!(matches!(events.try_recv().unwrap(), RealtimeEvent::UpdateEmails(_)));
    assert_eq!(h.stored_cursor().await, Some(SyncCursor::new(120)));

    let third = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();
    assert_eq!(third.duplicates, 1);
    assert_eq!(h.notifications.all().await.len(), 1);
}

#[tokio::test]
async fn test_failed_insert_removes_uploaded_attachments() {
    let h = Harness::new().await;
    let message = with_attachment(
        inbound_message("m1", BOB, "Invoice", "Attached", 1_700_000_000_000),
        "invoice.txt",
        "att-1",
    );
    h.mock.add_message(message);
    h.mock.add_attachment("att-1", b"amount due");
    h.mock.set_history_added(&["m1"], 120);
    h.messages.fail_next_inserts(1);

    let first = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(first.deferred, 1);
    assert_eq!(h.messages.len().await, 0);
    assert!(h.storage.is_empty());
    assert_eq!(h.stored_cursor().await, None);

    let second = h.engine.pipeline.run(USER_ID, Some(SyncCursor::new(100))).await.unwrap();

    assert_eq!(second.ingested, 1);
    let stored = h.messages.all().await;
    assert_eq!(stored[0].attachments.len(), 1);
    assert_eq!(h.storage.len(), 1);
    assert!(h.storage.get(&stored[0].attachments[0].storage_id).is_some());
}
