//! Relationship linker.
//!
//! Runs after every storage pass: attaches comment events to their parent
//! issue/MR events and recomputes derived activity metadata. Linking is
//! eventually consistent — it scans the user's whole event set, so a comment
//! stored before its parent is picked up on a later pass, and vice versa.

use crate::db::pool::DbPool;
use crate::error::AppError;
use sqlx::FromRow;
use std::collections::BTreeSet;

/// Link every unlinked comment whose `external_parent_id` matches an
/// existing event for the same user. Returns the number of comments linked
/// in this pass. Comments whose parent never arrives stay unlinked.
pub async fn link_parent_events(pool: &DbPool, user_id: i64) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE events SET parent_event_id = (
            SELECT p.id FROM events p
            WHERE p.user_id = events.user_id
              AND p.external_event_id = events.external_parent_id
        )
        WHERE user_id = ?
          AND event_type = 'comment'
          AND parent_event_id IS NULL
          AND external_parent_id IS NOT NULL
          AND EXISTS (
              SELECT 1 FROM events p
              WHERE p.user_id = events.user_id
                AND p.external_event_id = events.external_parent_id
          )
        "#,
    )
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[derive(Debug, FromRow)]
struct ParentRow {
    id: i64,
    author: String,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct ChildRow {
    author: String,
    created_at: i64,
}

/// Recompute derived activity metadata for every parent event with at least
/// one linked comment. Full recomputation from current linked state, so
/// repeated calls never double-count. Returns the number of parents updated.
pub async fn update_activity_metadata(pool: &DbPool, user_id: i64) -> Result<u64, AppError> {
    let parents = sqlx::query_as::<_, ParentRow>(
        "SELECT id, author, updated_at FROM events
         WHERE user_id = ?
           AND event_type IN ('issue', 'merge_request')
           AND EXISTS (SELECT 1 FROM events c WHERE c.parent_event_id = events.id)",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut updated = 0u64;

    for parent in parents {
        let children = sqlx::query_as::<_, ChildRow>(
            "SELECT author, created_at FROM events WHERE parent_event_id = ?",
        )
        .bind(parent.id)
        .fetch_all(pool)
        .await?;

        let comment_count = children.len() as i64;
        let last_activity_at = children
            .iter()
            .map(|c| c.created_at)
            .max()
            .map_or(parent.updated_at, |max_child| max_child.max(parent.updated_at));

        let participants: BTreeSet<&str> = std::iter::once(parent.author.as_str())
            .chain(children.iter().map(|c| c.author.as_str()))
            .collect();
        let participants_json = serde_json::to_string(&participants)
            .unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "UPDATE events SET comment_count = ?, last_activity_at = ?, participants = ?
             WHERE id = ?",
        )
        .bind(comment_count)
        .bind(last_activity_at)
        .bind(&participants_json)
        .bind(parent.id)
        .execute(pool)
        .await?;

        updated += 1;
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::event::{self, EventType, NewEvent};
    use tempfile::tempdir;

    async fn setup() -> (DbPool, i64, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("test.db")).await.unwrap();
        let user_id: i64 =
            sqlx::query_scalar("INSERT INTO users (username) VALUES ('alice') RETURNING id")
                .fetch_one(&pool)
                .await
                .unwrap();
        (pool, user_id, dir)
    }

    fn parent(id: &str, author: &str, updated_at: i64) -> NewEvent {
        NewEvent {
            external_event_id: id.to_string(),
            event_type: EventType::Issue,
            iid: Some(1),
            title: "Parent".to_string(),
            body: None,
            author: author.to_string(),
            author_avatar: None,
            project: "Alpha".to_string(),
            project_id: 10,
            labels: Vec::new(),
            status: "opened".to_string(),
            gitlab_url: "https://gitlab.com/x".to_string(),
            created_at: 1000,
            updated_at,
            external_parent_id: None,
        }
    }

    fn comment(id: &str, parent_id: &str, author: &str, created_at: i64) -> NewEvent {
        NewEvent {
            external_event_id: id.to_string(),
            event_type: EventType::Comment,
            iid: None,
            title: "Comment".to_string(),
            body: Some("body".to_string()),
            author: author.to_string(),
            author_avatar: None,
            project: "Alpha".to_string(),
            project_id: 10,
            labels: Vec::new(),
            status: "active".to_string(),
            gitlab_url: "https://gitlab.com/x#note_1".to_string(),
            created_at,
            updated_at: created_at,
            external_parent_id: Some(parent_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_linking_converges_in_either_order() {
        let (pool, user_id, _dir) = setup().await;

        // Pass 1: comment arrives before its parent.
        event::store_events(&pool, user_id, &[comment("note-1", "issue-1", "bob", 1500)])
            .await
            .unwrap();
        let linked = link_parent_events(&pool, user_id).await.unwrap();
        assert_eq!(linked, 0); // parent not fetched yet; unlinked comment is valid

        // Pass 2: parent arrives; the earlier comment must be linked now.
        event::store_events(&pool, user_id, &[parent("issue-1", "alice", 1200)])
            .await
            .unwrap();
        let linked = link_parent_events(&pool, user_id).await.unwrap();
        assert_eq!(linked, 1);

        update_activity_metadata(&pool, user_id).await.unwrap();

        let stored_parent = event::get_event(&pool, user_id, "issue-1").await.unwrap().unwrap();
        let stored_comment = event::get_event(&pool, user_id, "note-1").await.unwrap().unwrap();
        assert_eq!(stored_comment.parent_event_id, Some(stored_parent.id));
        assert_eq!(stored_parent.comment_count, 1);
    }

    #[tokio::test]
    async fn test_orphan_comment_stays_unlinked() {
        let (pool, user_id, _dir) = setup().await;

        event::store_events(&pool, user_id, &[comment("note-1", "issue-99", "bob", 1500)])
            .await
            .unwrap();

        link_parent_events(&pool, user_id).await.unwrap();
        link_parent_events(&pool, user_id).await.unwrap();

        let stored = event::get_event(&pool, user_id, "note-1").await.unwrap().unwrap();
        assert!(stored.parent_event_id.is_none());
        assert_eq!(stored.external_parent_id.as_deref(), Some("issue-99"));
    }

    #[tokio::test]
    async fn test_metadata_recomputation_is_stable() {
        let (pool, user_id, _dir) = setup().await;

        event::store_events(&pool, user_id, &[parent("issue-1", "alice", 2000)])
            .await
            .unwrap();

        // Comments from authors {A, B, A}, arriving incrementally.
        for (i, (author, ts)) in [("a", 2100i64), ("b", 2200), ("a", 2300)].iter().enumerate() {
            event::store_events(
                &pool,
                user_id,
                &[comment(&format!("note-{}", i + 1), "issue-1", author, *ts)],
            )
            .await
            .unwrap();
            link_parent_events(&pool, user_id).await.unwrap();
            update_activity_metadata(&pool, user_id).await.unwrap();
        }

        let stored = event::get_event(&pool, user_id, "issue-1").await.unwrap().unwrap();
        assert_eq!(stored.comment_count, 3);
        assert_eq!(stored.last_activity_at, Some(2300));

        let participants: Vec<String> = serde_json::from_str(&stored.participants).unwrap();
        assert_eq!(participants, vec!["a", "alice", "b"]);

        // Running the recomputation again must not change anything.
        update_activity_metadata(&pool, user_id).await.unwrap();
        let again = event::get_event(&pool, user_id, "issue-1").await.unwrap().unwrap();
        assert_eq!(again.comment_count, 3);
        assert_eq!(again.participants, stored.participants);
    }

    #[tokio::test]
    async fn test_last_activity_uses_parent_when_newer() {
        let (pool, user_id, _dir) = setup().await;

        event::store_events(
            &pool,
            user_id,
            &[
                parent("issue-1", "alice", 5000),
                comment("note-1", "issue-1", "bob", 1500),
            ],
        )
        .await
        .unwrap();
        link_parent_events(&pool, user_id).await.unwrap();
        update_activity_metadata(&pool, user_id).await.unwrap();

        let stored = event::get_event(&pool, user_id, "issue-1").await.unwrap().unwrap();
        assert_eq!(stored.last_activity_at, Some(5000));
    }
}
