//! Event transformer.
//!
//! Three pure functions, one per upstream shape, each mapping raw GitLab
//! payloads into the canonical Event shape. Project names are resolved
//! through the supplied lookup map, never re-fetched. Malformed items are
//! logged and skipped individually so one bad payload cannot fail a user's
//! whole sync. Output is deterministic for a given input.

use crate::models::event::{EventType, NewEvent};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Maximum length of the title derived from a note body.
const NOTE_TITLE_MAX_CHARS: usize = 80;

#[derive(Debug, Deserialize)]
struct RawAuthor {
    username: String,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIssueLike {
    id: i64,
    iid: i64,
    project_id: i64,
    title: String,
    description: Option<String>,
    state: String,
    web_url: String,
    #[serde(default)]
    labels: Vec<String>,
    created_at: String,
    updated_at: String,
    author: RawAuthor,
}

#[derive(Debug, Deserialize)]
struct RawNote {
    id: i64,
    body: String,
    author: RawAuthor,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    system: bool,
    noteable_type: String,
    noteable_id: i64,
    // Enriched by the API client; not part of the upstream note object.
    project_id: i64,
    #[serde(default)]
    parent_web_url: String,
}

/// Parse ISO 8601 timestamp to Unix timestamp.
fn parse_iso_timestamp(s: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

/// Normalize a label list into a sorted, deduplicated set.
fn normalize_labels(mut labels: Vec<String>) -> Vec<String> {
    labels.sort();
    labels.dedup();
    labels
}

/// Resolve a project name from the lookup map, falling back to the numeric id.
fn resolve_project_name(project_names: &HashMap<i64, String>, project_id: i64) -> String {
    project_names
        .get(&project_id)
        .cloned()
        .unwrap_or_else(|| format!("project-{}", project_id))
}

fn transform_issue_like(
    items: &[Value],
    project_names: &HashMap<i64, String>,
    event_type: EventType,
    id_prefix: &str,
) -> Vec<NewEvent> {
    let mut events = Vec::with_capacity(items.len());

    for item in items {
        let raw: RawIssueLike = match serde_json::from_value(item.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Skipping malformed {} payload: {}", event_type, e);
                continue;
            }
        };

        events.push(NewEvent {
            external_event_id: format!("{}-{}", id_prefix, raw.id),
            event_type,
            iid: Some(raw.iid),
            title: raw.title,
            body: raw.description,
            author: raw.author.username,
            author_avatar: raw.author.avatar_url,
            project: resolve_project_name(project_names, raw.project_id),
            project_id: raw.project_id,
            labels: normalize_labels(raw.labels),
            status: raw.state,
            gitlab_url: raw.web_url,
            created_at: parse_iso_timestamp(&raw.created_at),
            updated_at: parse_iso_timestamp(&raw.updated_at),
            external_parent_id: None,
        });
    }

    events
}

/// Map raw GitLab issues into canonical events.
pub fn transform_issues(
    items: &[Value],
    project_names: &HashMap<i64, String>,
) -> Vec<NewEvent> {
    transform_issue_like(items, project_names, EventType::Issue, "issue")
}

/// Map raw GitLab merge requests into canonical events.
pub fn transform_merge_requests(
    items: &[Value],
    project_names: &HashMap<i64, String>,
) -> Vec<NewEvent> {
    transform_issue_like(items, project_names, EventType::MergeRequest, "mr")
}

/// Derive a one-line title from a note body.
fn note_title(body: &str) -> String {
    let first_line = body.lines().next().unwrap_or("");
    first_line.chars().take(NOTE_TITLE_MAX_CHARS).collect()
}

/// Map raw GitLab notes into canonical comment events.
///
/// Sets `external_parent_id` from the note's parent reference so the linker
/// can attach the comment once the parent event exists. System notes
/// (state changes, label edits) are not user activity and are skipped.
pub fn transform_notes(items: &[Value], project_names: &HashMap<i64, String>) -> Vec<NewEvent> {
    let mut events = Vec::with_capacity(items.len());

    for item in items {
        let raw: RawNote = match serde_json::from_value(item.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Skipping malformed note payload: {}", e);
                continue;
            }
        };

        if raw.system {
            continue;
        }

        let external_parent_id = match raw.noteable_type.as_str() {
            "Issue" => format!("issue-{}", raw.noteable_id),
            "MergeRequest" => format!("mr-{}", raw.noteable_id),
            other => {
                log::warn!("Skipping note {} with unknown noteable_type {:?}", raw.id, other);
                continue;
            }
        };

        events.push(NewEvent {
            external_event_id: format!("note-{}", raw.id),
            event_type: EventType::Comment,
            iid: None,
            title: note_title(&raw.body),
            body: Some(raw.body),
            author: raw.author.username,
            author_avatar: raw.author.avatar_url,
            project: resolve_project_name(project_names, raw.project_id),
            project_id: raw.project_id,
            labels: Vec::new(),
            status: "active".to_string(),
            gitlab_url: format!("{}#note_{}", raw.parent_web_url, raw.id),
            created_at: parse_iso_timestamp(&raw.created_at),
            updated_at: parse_iso_timestamp(&raw.updated_at),
            external_parent_id: Some(external_parent_id),
        });
    }

    events
}
