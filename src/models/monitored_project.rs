//! Monitored project metadata.
//!
//! Rows are created and removed by the project-selection layer; the sync
//! pipeline only reads them to scope upstream fetches.

use crate::db::pool::DbPool;
use serde::Serialize;
use sqlx::FromRow;
use std::collections::HashMap;

/// A project a user has selected for mirroring.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MonitoredProject {
    pub id: i64,

    pub user_id: i64,

    /// GitLab project id.
    pub external_project_id: i64,

    /// Short project name (e.g., "GitLab").
    pub name: String,

    /// Path with namespace (e.g., "gitlab-org/gitlab").
    pub path: String,
}

/// List the monitored projects for a user.
pub async fn list_for_user(
    pool: &DbPool,
    user_id: i64,
) -> Result<Vec<MonitoredProject>, sqlx::Error> {
    sqlx::query_as::<_, MonitoredProject>(
        "SELECT id, user_id, external_project_id, name, path
         FROM monitored_projects WHERE user_id = ? ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Build the project-id → name map the transformer uses to resolve
/// human-readable project names without re-fetching.
pub fn project_name_map(projects: &[MonitoredProject]) -> HashMap<i64, String> {
    projects
        .iter()
        .map(|p| (p.external_project_id, p.name.clone()))
        .collect()
}
