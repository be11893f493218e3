//! End-to-end pipeline tests over a real SQLite database: transform, store,
//! link, metadata, and people stages driven through `process_fetched` with
//! synthetic upstream payloads.

use gitlab_mirror::db::{self, pool::DbPool};
use gitlab_mirror::models::{event, person, sync_cursor};
use gitlab_mirror::services::gitlab_client::FetchedEvents;
use gitlab_mirror::services::sync_engine::process_fetched;
use serde_json::{json, Value};
use std::collections::HashMap;
use tempfile::tempdir;

async fn setup() -> (DbPool, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let pool = db::initialize(&dir.path().join("test.db")).await.unwrap();
    (pool, dir)
}

async fn insert_user(pool: &DbPool, username: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO users (username) VALUES (?) RETURNING id")
        .bind(username)
        .fetch_one(pool)
        .await
        .unwrap()
}

fn names() -> HashMap<i64, String> {
    HashMap::from([(10, "Alpha".to_string())])
}

fn author(id: i64, username: &str) -> Value {
    json!({
        "id": id,
        "username": username,
        "name": format!("{} Example", username),
        "avatar_url": format!("https://a.example/{}.png", username)
    })
}

fn issue(id: i64, iid: i64, title: &str, author_val: Value, updated_at: &str) -> Value {
    json!({
        "id": id,
        "iid": iid,
        "project_id": 10,
        "title": title,
        "description": "details",
        "state": "opened",
        "web_url": format!("https://gitlab.example/group/alpha/-/issues/{}", iid),
        "labels": ["bug"],
        "created_at": "2026-02-01T08:00:00Z",
        "updated_at": updated_at,
        "author": author_val
    })
}

fn note(id: i64, noteable_id: i64, body: &str, author_val: Value) -> Value {
    json!({
        "id": id,
        "body": body,
        "author": author_val,
        "created_at": "2026-02-01T09:00:00Z",
        "updated_at": "2026-02-01T09:00:00Z",
        "system": false,
        "noteable_type": "Issue",
        "noteable_id": noteable_id,
        "project_id": 10,
        "parent_web_url": "https://gitlab.example/group/alpha/-/issues/1"
    })
}

#[tokio::test]
async fn full_pass_stores_links_and_extracts_people() {
    let (pool, _dir) = setup().await;
    let user_id = insert_user(&pool, "alice").await;

    let fetched = FetchedEvents {
        issues: vec![issue(500, 1, "Crash on startup", author(1, "alice"), "2026-02-01T08:30:00Z")],
        merge_requests: Vec::new(),
        notes: vec![
            note(900, 500, "Reproduced on main", author(2, "bob")),
            note(901, 500, "Fix incoming", author(1, "alice")),
        ],
    };

    let counts = process_fetched(&pool, user_id, &fetched, &names()).await.unwrap();
    assert_eq!(counts.events.stored, 3);
    assert_eq!(counts.events.skipped, 0);
    assert_eq!(counts.linked, 2);
    assert_eq!(counts.metadata_updated, 1);
    assert_eq!(counts.people.created, 2);

    let parent = event::get_event(&pool, user_id, "issue-500").await.unwrap().unwrap();
    assert_eq!(parent.comment_count, 2);
    let participants: Vec<String> = serde_json::from_str(&parent.participants).unwrap();
    assert_eq!(participants, vec!["alice", "bob"]);

    let comment = event::get_event(&pool, user_id, "note-900").await.unwrap().unwrap();
    assert_eq!(comment.parent_event_id, Some(parent.id));
    assert_eq!(
        comment.gitlab_url,
        "https://gitlab.example/group/alpha/-/issues/1#note_900"
    );

    assert_eq!(person::count_for_user(&pool, user_id).await.unwrap(), 2);
}

#[tokio::test]
async fn rerun_of_same_payload_is_idempotent() {
    let (pool, _dir) = setup().await;
    let user_id = insert_user(&pool, "alice").await;

    let fetched = FetchedEvents {
        issues: vec![issue(500, 1, "Crash on startup", author(1, "alice"), "2026-02-01T08:30:00Z")],
        merge_requests: Vec::new(),
        notes: vec![note(900, 500, "Reproduced on main", author(2, "bob"))],
    };

    let first = process_fetched(&pool, user_id, &fetched, &names()).await.unwrap();
    assert_eq!(first.events.stored, 2);

    let second = process_fetched(&pool, user_id, &fetched, &names()).await.unwrap();
    assert_eq!(second.events.stored, 0);
    assert_eq!(second.events.skipped, 2);
    assert_eq!(second.people.created, 0);
    assert_eq!(second.people.updated, 2);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn comment_before_parent_links_on_later_pass() {
    let (pool, _dir) = setup().await;
    let user_id = insert_user(&pool, "alice").await;

    // Pass 1: only the note arrives.
    let pass1 = FetchedEvents {
        issues: Vec::new(),
        merge_requests: Vec::new(),
        notes: vec![note(900, 500, "Early comment", author(2, "bob"))],
    };
    let counts = process_fetched(&pool, user_id, &pass1, &names()).await.unwrap();
    assert_eq!(counts.linked, 0);

    let orphan = event::get_event(&pool, user_id, "note-900").await.unwrap().unwrap();
    assert!(orphan.parent_event_id.is_none());

    // Pass 2: the parent issue arrives; the earlier comment must link.
    let pass2 = FetchedEvents {
        issues: vec![issue(500, 1, "Crash on startup", author(1, "alice"), "2026-02-01T08:30:00Z")],
        merge_requests: Vec::new(),
        notes: Vec::new(),
    };
    let counts = process_fetched(&pool, user_id, &pass2, &names()).await.unwrap();
    assert_eq!(counts.linked, 1);
    assert_eq!(counts.metadata_updated, 1);

    let parent = event::get_event(&pool, user_id, "issue-500").await.unwrap().unwrap();
    assert_eq!(parent.comment_count, 1);
}

#[tokio::test]
async fn users_are_isolated() {
    let (pool, _dir) = setup().await;
    let alice = insert_user(&pool, "alice").await;
    let bob = insert_user(&pool, "bob").await;

    let fetched = FetchedEvents {
        issues: vec![issue(500, 1, "Shared upstream issue", author(1, "alice"), "2026-02-01T08:30:00Z")],
        merge_requests: Vec::new(),
        notes: vec![note(900, 500, "Comment", author(2, "bob"))],
    };

    process_fetched(&pool, alice, &fetched, &names()).await.unwrap();
    sync_cursor::advance_cursor(&pool, alice, 5_000).await.unwrap();

    // The same upstream object mirrors independently per user.
    let counts = process_fetched(&pool, bob, &fetched, &names()).await.unwrap();
    assert_eq!(counts.events.stored, 2);

    let alice_parent = event::get_event(&pool, alice, "issue-500").await.unwrap().unwrap();
    let bob_comment = event::get_event(&pool, bob, "note-900").await.unwrap().unwrap();
    // Bob's comment links to Bob's copy of the parent, never Alice's.
    assert_ne!(bob_comment.parent_event_id, Some(alice_parent.id));
    assert!(bob_comment.parent_event_id.is_some());

    // One user's cursor never moves because of another user's sync.
    assert_eq!(sync_cursor::get_cursor(&pool, alice).await.unwrap(), Some(5_000));
    assert_eq!(sync_cursor::get_cursor(&pool, bob).await.unwrap(), None);

    assert_eq!(person::count_for_user(&pool, alice).await.unwrap(), 2);
    assert_eq!(person::count_for_user(&pool, bob).await.unwrap(), 2);
}
