//! Per-user sync cursor (watermark).
//!
//! The cursor marks the boundary between already-synced and not-yet-synced
//! upstream activity. One row per user; absence means "never synced", which
//! makes the next fetch a full-history fetch.

use crate::db::pool::DbPool;

/// Get the last successful sync timestamp for a user, if any.
pub async fn get_cursor(pool: &DbPool, user_id: i64) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT last_sync_at FROM sync_cursors WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

/// Advance the cursor for a user. The cursor is only ever written on full
/// success of a sync pass, and never moves backwards even if a caller hands
/// in an older timestamp.
pub async fn advance_cursor(pool: &DbPool, user_id: i64, ts: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO sync_cursors (user_id, last_sync_at) VALUES (?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
           last_sync_at = MAX(sync_cursors.last_sync_at, excluded.last_sync_at)",
    )
    .bind(user_id)
    .bind(ts)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
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

    #[tokio::test]
    async fn test_absent_cursor_means_never_synced() {
        let (pool, user_id, _dir) = setup().await;
        assert_eq!(get_cursor(&pool, user_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursor_overwrites_single_row() {
        let (pool, user_id, _dir) = setup().await;

        advance_cursor(&pool, user_id, 1000).await.unwrap();
        advance_cursor(&pool, user_id, 2000).await.unwrap();

        assert_eq!(get_cursor(&pool, user_id).await.unwrap(), Some(2000));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_cursors WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_cursor_never_decreases() {
        let (pool, user_id, _dir) = setup().await;

        advance_cursor(&pool, user_id, 2000).await.unwrap();
        advance_cursor(&pool, user_id, 1500).await.unwrap();

        assert_eq!(get_cursor(&pool, user_id).await.unwrap(), Some(2000));
    }
}
