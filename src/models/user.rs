//! User accounts and their OAuth token state.

use crate::db::pool::DbPool;
use serde::Serialize;
use sqlx::FromRow;

/// A user whose GitLab activity is mirrored locally.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i64,

    pub username: String,

    /// Base URL of the user's GitLab instance.
    pub gitlab_base_url: String,

    /// Current OAuth access token, if any.
    pub access_token: Option<String>,

    /// OAuth refresh token used when the access token expires.
    pub refresh_token: Option<String>,

    /// Unix timestamp at which the access token expires.
    pub token_expires_at: Option<i64>,

    /// Set when the refresh exchange itself was rejected; the user must
    /// re-authenticate before the pipeline will touch their account again.
    pub needs_reauth: bool,
}

/// Look up a user by id.
pub async fn get_user(pool: &DbPool, user_id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, gitlab_base_url, access_token, refresh_token, token_expires_at, needs_reauth
         FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

/// List users that have at least one monitored project. These are the users
/// eligible for a scheduled sync run.
pub async fn list_users_with_projects(pool: &DbPool) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT u.id, u.username, u.gitlab_base_url, u.access_token, u.refresh_token, u.token_expires_at, u.needs_reauth
         FROM users u
         WHERE EXISTS (SELECT 1 FROM monitored_projects mp WHERE mp.user_id = u.id)
         ORDER BY u.id",
    )
    .fetch_all(pool)
    .await
}

/// Persist a freshly exchanged token set in a single write, so a crash
/// between refresh and persist cannot leave a half-updated row.
pub async fn store_tokens(
    pool: &DbPool,
    user_id: i64,
    access_token: &str,
    refresh_token: &str,
    expires_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE users SET access_token = ?, refresh_token = ?, token_expires_at = ?, needs_reauth = 0
         WHERE id = ?",
    )
    .bind(access_token)
    .bind(refresh_token)
    .bind(expires_at)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a user as requiring re-authentication.
pub async fn mark_needs_reauth(pool: &DbPool, user_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET needs_reauth = 1 WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::tempdir;

    async fn setup_test_db() -> (DbPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        (db::initialize(&db_path).await.unwrap(), dir)
    }

    async fn insert_user(pool: &DbPool, username: &str) -> i64 {
        sqlx::query_scalar("INSERT INTO users (username) VALUES (?) RETURNING id")
            .bind(username)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_tokens_clears_reauth_flag() {
        let (pool, _dir) = setup_test_db().await;
        let user_id = insert_user(&pool, "alice").await;

        mark_needs_reauth(&pool, user_id).await.unwrap();
        assert!(get_user(&pool, user_id).await.unwrap().unwrap().needs_reauth);

        store_tokens(&pool, user_id, "at", "rt", 9999999999).await.unwrap();

        let user = get_user(&pool, user_id).await.unwrap().unwrap();
        assert!(!user.needs_reauth);
        assert_eq!(user.access_token.as_deref(), Some("at"));
        assert_eq!(user.token_expires_at, Some(9999999999));
    }

    #[tokio::test]
    async fn test_list_users_with_projects_filters() {
        let (pool, _dir) = setup_test_db().await;
        let with = insert_user(&pool, "with-projects").await;
        let _without = insert_user(&pool, "without-projects").await;

        sqlx::query(
            "INSERT INTO monitored_projects (user_id, external_project_id, name, path) VALUES (?, 10, 'Proj', 'group/proj')",
        )
        .bind(with)
        .execute(&pool)
        .await
        .unwrap();

        let eligible = list_users_with_projects(&pool).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, with);
    }
}
