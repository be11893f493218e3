//! Deduplicated author identities.

use crate::db::pool::DbPool;
use serde::Serialize;
use sqlx::FromRow;

/// A person mentioned in mirrored activity, unique per
/// `(user_id, external_person_id)`. Upserted from whichever payload last
/// mentioned them; never deleted by the pipeline.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Person {
    pub id: i64,
    pub user_id: i64,
    pub external_person_id: i64,
    pub username: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Look up a person by external id.
pub async fn get_person(
    pool: &DbPool,
    user_id: i64,
    external_person_id: i64,
) -> Result<Option<Person>, sqlx::Error> {
    sqlx::query_as::<_, Person>(
        "SELECT id, user_id, external_person_id, username, name, avatar_url
         FROM persons WHERE user_id = ? AND external_person_id = ?",
    )
    .bind(user_id)
    .bind(external_person_id)
    .fetch_optional(pool)
    .await
}

/// Count persons stored for a user.
pub async fn count_for_user(pool: &DbPool, user_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM persons WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await
}
