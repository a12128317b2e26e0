//! E2E tests for clubs, direct conversations and membership-driven subscriptions

mod common;

use common::{TestServer, contains_id};
use serde_json::{Value, json};
use std::time::Duration;

#[tokio::test]
async fn test_join_unknown_club_is_not_found() {
    let server = TestServer::new().await;

    let response = server
        .post("alice", "/api/v1/clubs/does-not-exist/join")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_join_and_leave_report_changes() {
    let server = TestServer::new().await;
    let club = server.create_club("bob", "Harriers").await;

    let joined: Value = server
        .post("alice", &format!("/api/v1/clubs/{club}/join"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(joined["changed"], true);

    let again: Value = server
        .post("alice", &format!("/api/v1/clubs/{club}/join"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["changed"], false);

    let left: Value = server
        .post("alice", &format!("/api/v1/clubs/{club}/leave"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(left["member"], false);
    assert_eq!(left["changed"], true);
}

#[tokio::test]
async fn test_club_name_is_validated() {
    let server = TestServer::new().await;

    let response = server
        .post("alice", "/api/v1/clubs")
        .json(&json!({ "name": "  " }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_direct_conversation_is_shared_by_the_pair() {
    let server = TestServer::new().await;

    let first = server.direct_conversation("alice", "bob").await;
    let second = server.direct_conversation("bob", "alice").await;
    assert_eq!(first, second);

    let response = server
        .post("alice", "/api/v1/direct_conversations")
        .json(&json!({ "participant_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_joining_mid_session_starts_tracking_the_club() {
    let server = TestServer::new().await;
    let club = server.create_club("bob", "Late Joiners").await;

    // Session opens with no memberships
    assert_eq!(server.unread("alice").await["total_count"], 0);
    server.join_club("alice", &club).await;

    // The filter is rebuilt from the membership event; retry until it is live
    let mut tracked = false;
    for _ in 0..50 {
        server.send("bob", "club", &club, "welcome!").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if contains_id(&server.unread("alice").await["unread_club_ids"], &club) {
            tracked = true;
            break;
        }
    }
    assert!(tracked);
}

#[tokio::test]
async fn test_new_direct_conversation_mid_session_is_tracked() {
    let server = TestServer::new().await;
    assert_eq!(server.unread("alice").await["total_count"], 0);

    let conversation = server.direct_conversation("bob", "alice").await;

    let mut tracked = false;
    for _ in 0..50 {
        server.send("bob", "dm", &conversation, "race this weekend?").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if server.unread("alice").await["dm_count"] == 1 {
            tracked = true;
            break;
        }
    }
    assert!(tracked);
}
