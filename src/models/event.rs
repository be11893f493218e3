//! Canonical activity events and the idempotent storage layer.
//!
//! An Event is the single canonical shape for one issue, merge request, or
//! comment. `(user_id, external_event_id)` is the idempotency key: repeated
//! syncs of the same upstream item never create duplicates, and unchanged
//! items are skipped without a write.

use crate::db::pool::DbPool;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of upstream item an event mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Issue,
    MergeRequest,
    Comment,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::MergeRequest => "merge_request",
            Self::Comment => "comment",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical event as produced by the transformer, before storage.
///
/// Derived activity fields (`last_activity_at`, `comment_count`,
/// `participants`) are owned by the linker and intentionally absent here.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Type-prefixed upstream id (`issue-…`, `mr-…`, `note-…`).
    pub external_event_id: String,

    pub event_type: EventType,

    /// Human-facing number; notes have none.
    pub iid: Option<i64>,

    pub title: String,

    pub body: Option<String>,

    pub author: String,

    pub author_avatar: Option<String>,

    /// Human-readable project name, resolved via the project lookup.
    pub project: String,

    pub project_id: i64,

    /// Sorted, deduplicated label set.
    pub labels: Vec<String>,

    pub status: String,

    pub gitlab_url: String,

    /// Creation timestamp from upstream (Unix seconds); immutable once stored.
    pub created_at: i64,

    pub updated_at: i64,

    /// Raw parent reference from upstream; present on comments before linking.
    pub external_parent_id: Option<String>,
}

/// A stored event, including linker-owned fields.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Event {
    pub id: i64,
    pub user_id: i64,
    pub external_event_id: String,
    pub event_type: String,
    pub iid: Option<i64>,
    pub title: String,
    pub body: Option<String>,
    pub author: String,
    pub author_avatar: Option<String>,
    pub project: String,
    pub project_id: i64,
    /// JSON-encoded label set.
    pub labels: String,
    pub status: String,
    pub gitlab_url: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub external_parent_id: Option<String>,
    pub parent_event_id: Option<i64>,
    pub last_activity_at: Option<i64>,
    pub comment_count: i64,
    /// JSON-encoded participant set.
    pub participants: String,
}

/// Outcome of a `store_events` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreOutcome {
    /// Events inserted or updated.
    pub stored: u64,

    /// Events that matched an existing row with identical mutable fields.
    pub skipped: u64,
}

/// The mutable subset of an existing row, used to decide skip vs. update.
#[derive(Debug, FromRow)]
struct MutableFields {
    title: String,
    body: Option<String>,
    author_avatar: Option<String>,
    labels: String,
    status: String,
    gitlab_url: String,
    updated_at: i64,
}

fn labels_json(labels: &[String]) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string())
}

/// Idempotently persist a batch of canonical events for a user.
///
/// Per event, keyed by `(user_id, external_event_id)`:
/// - absent: insert, counted as stored
/// - present with identical mutable fields: no write, counted as skipped
/// - present but differing: update mutable fields, counted as stored
///
/// The upstream creation timestamp is never overwritten. Nothing is deleted.
/// Safe to call repeatedly with overlapping event sets.
pub async fn store_events(
    pool: &DbPool,
    user_id: i64,
    events: &[NewEvent],
) -> Result<StoreOutcome, AppError> {
    let mut outcome = StoreOutcome::default();

    for event in events {
        let existing = sqlx::query_as::<_, MutableFields>(
            "SELECT title, body, author_avatar, labels, status, gitlab_url, updated_at
             FROM events WHERE user_id = ? AND external_event_id = ?",
        )
        .bind(user_id)
        .bind(&event.external_event_id)
        .fetch_optional(pool)
        .await?;

        let labels = labels_json(&event.labels);

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO events (
                        user_id, external_event_id, event_type, iid, title, body,
                        author, author_avatar, project, project_id, labels, status,
                        gitlab_url, created_at, updated_at, external_parent_id
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(user_id)
                .bind(&event.external_event_id)
                .bind(event.event_type.as_str())
                .bind(event.iid)
                .bind(&event.title)
                .bind(&event.body)
                .bind(&event.author)
                .bind(&event.author_avatar)
                .bind(&event.project)
                .bind(event.project_id)
                .bind(&labels)
                .bind(&event.status)
                .bind(&event.gitlab_url)
                .bind(event.created_at)
                .bind(event.updated_at)
                .bind(&event.external_parent_id)
                .execute(pool)
                .await?;

                outcome.stored += 1;
            }
            Some(current) => {
                let unchanged = current.title == event.title
                    && current.body == event.body
                    && current.author_avatar == event.author_avatar
                    && current.labels == labels
                    && current.status == event.status
                    && current.gitlab_url == event.gitlab_url
                    && current.updated_at == event.updated_at;

                if unchanged {
                    outcome.skipped += 1;
                    continue;
                }

                sqlx::query(
                    r#"
                    UPDATE events SET
                        title = ?, body = ?, author_avatar = ?, labels = ?,
                        status = ?, gitlab_url = ?, updated_at = ?
                    WHERE user_id = ? AND external_event_id = ?
                    "#,
                )
                .bind(&event.title)
                .bind(&event.body)
                .bind(&event.author_avatar)
                .bind(&labels)
                .bind(&event.status)
                .bind(&event.gitlab_url)
                .bind(event.updated_at)
                .bind(user_id)
                .bind(&event.external_event_id)
                .execute(pool)
                .await?;

                outcome.stored += 1;
            }
        }
    }

    Ok(outcome)
}

/// Look up a stored event by its idempotency key.
pub async fn get_event(
    pool: &DbPool,
    user_id: i64,
    external_event_id: &str,
) -> Result<Option<Event>, sqlx::Error> {
    sqlx::query_as::<_, Event>(
        "SELECT id, user_id, external_event_id, event_type, iid, title, body, author,
                author_avatar, project, project_id, labels, status, gitlab_url,
                created_at, updated_at, external_parent_id, parent_event_id,
                last_activity_at, comment_count, participants
         FROM events WHERE user_id = ? AND external_event_id = ?",
    )
    .bind(user_id)
    .bind(external_event_id)
    .fetch_optional(pool)
    .await
}
