//! Database tests

use super::*;
use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path, ChangeFeed::new(64)).await.unwrap();
    (db, temp_dir)
}

fn text(sender: &str, body: &str) -> NewMessage {
    NewMessage {
        sender_id: sender.to_string(),
        text: body.to_string(),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
}

#[tokio::test]
async fn test_club_membership_lifecycle() {
    let (db, _temp_dir) = create_test_db().await;

    let club = db.create_club("Morning Milers", "alice").await.unwrap();
    assert!(db.join_club(&club.id, "bob").await.unwrap());
    assert!(!db.join_club(&club.id, "bob").await.unwrap());

    let membership = db.membership("bob").await.unwrap();
    assert!(membership.club_ids.contains(&club.id));
    assert!(db.is_participant("bob", &ConversationKey::club(club.id.clone())).await.unwrap());

    assert!(db.leave_club(&club.id, "bob").await.unwrap());
    assert!(!db.leave_club(&club.id, "bob").await.unwrap());
    assert!(db.membership("bob").await.unwrap().club_ids.is_empty());
}

#[tokio::test]
async fn test_join_unknown_club_is_not_found() {
    let (db, _temp_dir) = create_test_db().await;
    assert!(matches!(
        db.join_club("missing", "bob").await,
        Err(crate::error::AppError::NotFound)
    ));
}

#[tokio::test]
async fn test_direct_conversation_is_shared_by_both_orders() {
    let (db, _temp_dir) = create_test_db().await;

    let first = db.create_direct_conversation("alice", "bob").await.unwrap();
    let second = db.create_direct_conversation("bob", "alice").await.unwrap();
    assert_eq!(first.id, second.id);

    assert!(db.create_direct_conversation("alice", "alice").await.is_err());
    assert!(db.membership("alice").await.unwrap().conversation_ids.contains(&first.id));
    assert!(db.membership("bob").await.unwrap().conversation_ids.contains(&first.id));
}

#[tokio::test]
async fn test_direct_message_sets_receiver() {
    let (db, _temp_dir) = create_test_db().await;
    db.upsert_profile("bob", "Bob").await.unwrap();
    let conversation = db.create_direct_conversation("alice", "bob").await.unwrap();

    let message = db
        .insert_message(&ConversationKey::dm(conversation.id.clone()), &text("bob", "hey"))
        .await
        .unwrap();

    assert_eq!(message.receiver_id.as_deref(), Some("alice"));
    assert_eq!(message.sender.as_ref().map(|s| s.display_name.as_str()), Some("Bob"));

    let outsider = db
        .insert_message(&ConversationKey::dm(conversation.id.clone()), &text("carol", "hi"))
        .await;
    assert!(matches!(outsider, Err(crate::error::AppError::Forbidden)));
}

#[tokio::test]
async fn test_insert_and_delete_publish_on_feed() {
    let (db, _temp_dir) = create_test_db().await;
    let club = db.create_club("Trail Crew", "alice").await.unwrap();
    let key = ConversationKey::club(club.id.clone());

    let mut subscription = db.feed().subscribe(TableFilter::conversations(
        ConversationKind::Club,
        [club.id.clone()].into_iter().collect(),
    ));

    let message = db.insert_message(&key, &text("alice", "long run sunday")).await.unwrap();
    let inserted = subscription.next().await.unwrap();
    assert_eq!(inserted.event, ChangeKind::Insert);

    let deleted = db.delete_message(&key, &message.id).await.unwrap();
    assert_eq!(deleted.map(|m| m.id), Some(message.id.clone()));
    let event = subscription.next().await.unwrap();
    assert_eq!(event.event, ChangeKind::Delete);
    assert!(event.new.is_none());

    assert!(db.delete_message(&key, &message.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_message_pages_are_newest_first_and_strictly_older() {
    let (db, _temp_dir) = create_test_db().await;
    let club = db.create_club("Track Tuesday", "alice").await.unwrap();
    let key = ConversationKey::club(club.id.clone());
    let base = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap();

    for i in 0..5 {
        db.insert_message_at(&key, &text("alice", &format!("lap {i}")), base + Duration::seconds(i))
            .await
            .unwrap();
    }

    let page = db.fetch_messages_page(&key, None, 3).await.unwrap();
    let texts: Vec<_> = page.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["lap 4", "lap 3", "lap 2"]);

    let older = db
        .fetch_messages_page(&key, Some(base + Duration::seconds(2)), 3)
        .await
        .unwrap();
    let texts: Vec<_> = older.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["lap 1", "lap 0"]);
}

#[tokio::test]
async fn test_read_cursor_upsert_never_duplicates_or_regresses() {
    let (db, _temp_dir) = create_test_db().await;
    let key = ConversationKey::dm("c1");
    let earlier = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap();
    let later = earlier + Duration::minutes(5);

    db.upsert_read_cursor("alice", &key, later).await.unwrap();
    db.upsert_read_cursor("alice", &key, earlier).await.unwrap();

    let cursor = db.get_read_cursor("alice", &key).await.unwrap().unwrap();
    assert_eq!(cursor.last_read_timestamp, later);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM direct_messages_read")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_unread_conversations_follow_cursor_and_sender() {
    let (db, _temp_dir) = create_test_db().await;
    let club = db.create_club("Hill Repeats", "alice").await.unwrap();
    db.join_club(&club.id, "bob").await.unwrap();
    let conversation = db.create_direct_conversation("alice", "bob").await.unwrap();
    let club_key = ConversationKey::club(club.id.clone());
    let dm_key = ConversationKey::dm(conversation.id.clone());
    let base = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap();

    // Own messages never count
    db.insert_message_at(&club_key, &text("alice", "mine"), base).await.unwrap();
    assert!(db.unread_conversations("alice").await.unwrap().is_empty());

    db.insert_message_at(&club_key, &text("bob", "theirs"), base + Duration::seconds(1))
        .await
        .unwrap();
    db.insert_message_at(&dm_key, &text("bob", "dm"), base + Duration::seconds(2))
        .await
        .unwrap();

    let unread = db.unread_conversations("alice").await.unwrap();
    assert!(unread.contains(&club_key));
    assert!(unread.contains(&dm_key));

    // A cursor equal to the newest message clears it (strictly greater is unread)
    db.upsert_read_cursor("alice", &club_key, base + Duration::seconds(1))
        .await
        .unwrap();
    let unread = db.unread_conversations("alice").await.unwrap();
    assert!(!unread.contains(&club_key));
    assert!(unread.contains(&dm_key));

    // Bob sent the DM, so it is not unread for him
    assert!(!db.unread_conversations("bob").await.unwrap().contains(&dm_key));
}
