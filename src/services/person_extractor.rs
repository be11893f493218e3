//! Person extractor.
//!
//! Derives unique author identities from raw upstream payloads and upserts
//! them in bounded batches. Extraction is pure: it dedupes by external
//! person id and merges fields last-non-null-wins when the same person
//! appears in several payloads.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::services::gitlab_client::FetchedEvents;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// People written per transaction. Keeps each transaction short so one
/// oversized extraction cannot hold a long-lived lock across the whole set.
const PERSON_BATCH_SIZE: usize = 50;

/// Upper bound on a single batch transaction.
const BATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// An author identity extracted from upstream payloads, before storage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractedPerson {
    pub external_person_id: i64,
    pub username: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Outcome of a batched person upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub created: u64,
    pub updated: u64,
    pub total: u64,
}

#[derive(Debug, Deserialize)]
struct RawPerson {
    id: i64,
    username: String,
    name: Option<String>,
    avatar_url: Option<String>,
}

fn merge_author(people: &mut BTreeMap<i64, ExtractedPerson>, author: &Value) {
    let raw: RawPerson = match serde_json::from_value(author.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("Skipping malformed author payload: {}", e);
            return;
        }
    };

    match people.get_mut(&raw.id) {
        None => {
            people.insert(
                raw.id,
                ExtractedPerson {
                    external_person_id: raw.id,
                    username: raw.username,
                    name: raw.name,
                    avatar_url: raw.avatar_url,
                },
            );
        }
        Some(existing) => {
            // Last-non-null-wins per field.
            existing.username = raw.username;
            if raw.name.is_some() {
                existing.name = raw.name;
            }
            if raw.avatar_url.is_some() {
                existing.avatar_url = raw.avatar_url;
            }
        }
    }
}

/// Extract the unique author identities mentioned across a fetch pass.
///
/// Pure: dedupes by external person id; output order is deterministic
/// (sorted by external id).
pub fn extract_people(fetched: &FetchedEvents) -> Vec<ExtractedPerson> {
    let mut people: BTreeMap<i64, ExtractedPerson> = BTreeMap::new();

    for item in fetched
        .issues
        .iter()
        .chain(fetched.merge_requests.iter())
        .chain(fetched.notes.iter())
    {
        if let Some(author) = item.get("author") {
            merge_author(&mut people, author);
        }
    }

    people.into_values().collect()
}

/// Upsert extracted people for a user in bounded batches.
///
/// Each batch runs in its own transaction with a deadline; a batch failure
/// leaves previously committed batches intact. The existence check and the
/// write happen inside the same transaction, so two concurrent syncs cannot
/// both insert the same person.
pub async fn upsert_people(
    pool: &DbPool,
    user_id: i64,
    people: &[ExtractedPerson],
) -> Result<UpsertOutcome, AppError> {
    let mut outcome = UpsertOutcome::default();

    for batch in people.chunks(PERSON_BATCH_SIZE) {
        let batch_outcome = tokio::time::timeout(BATCH_TIMEOUT, upsert_batch(pool, user_id, batch))
            .await
            .map_err(|_| {
                AppError::database_with_op("Person upsert batch timed out", "upsert_people")
            })??;

        outcome.created += batch_outcome.created;
        outcome.updated += batch_outcome.updated;
        outcome.total += batch_outcome.total;
    }

    Ok(outcome)
}

async fn upsert_batch(
    pool: &DbPool,
    user_id: i64,
    batch: &[ExtractedPerson],
) -> Result<UpsertOutcome, AppError> {
    let mut outcome = UpsertOutcome::default();
    let mut tx = pool.begin().await?;

    for person in batch {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM persons WHERE user_id = ? AND external_person_id = ?",
        )
        .bind(user_id)
        .bind(person.external_person_id)
        .fetch_optional(&mut *tx)
        .await?;

        // The pre-check only decides the created/updated count; correctness
        // under races comes from the upsert itself.
        sqlx::query(
            "INSERT INTO persons (user_id, external_person_id, username, name, avatar_url)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, external_person_id) DO UPDATE SET
               username = excluded.username,
               name = COALESCE(excluded.name, persons.name),
               avatar_url = COALESCE(excluded.avatar_url, persons.avatar_url)",
        )
        .bind(user_id)
        .bind(person.external_person_id)
        .bind(&person.username)
        .bind(&person.name)
        .bind(&person.avatar_url)
        .execute(&mut *tx)
        .await?;

        if exists.is_some() {
            outcome.updated += 1;
        } else {
            outcome.created += 1;
        }
        outcome.total += 1;
    }

    tx.commit().await?;
    Ok(outcome)
}
