//! Background sync engine for mirroring GitLab activity.
//!
//! This module provides the core sync functionality:
//! - Scheduled background sync at a configurable interval
//! - Per-user pipeline: token → fetch → transform → store → link →
//!   metadata → people → cursor advance
//! - Per-user failure isolation and a run-level health verdict
//! - Sync logging for status display
//!
//! The cursor is advanced last and only on full success, so a failed user
//! is naturally re-attempted from the same watermark on the next run.

use crate::config::SyncConfig;
use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::event::StoreOutcome;
use crate::models::{monitored_project, sync_cursor, user};
use crate::services::gitlab_client::{EventSource, FetchRequest, FetchedEvents, GitLabSource};
use crate::services::person_extractor::{self, UpsertOutcome};
use crate::services::token_manager::{self, OAuthConfig};
use crate::services::{linker, transformer};
use chrono::Utc;
use serde::Serialize;
use sqlx::FromRow;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Maximum number of sync log entries to keep.
const MAX_LOG_ENTRIES: i64 = 50;

/// Get the current Unix timestamp.
fn now() -> i64 {
    Utc::now().timestamp()
}

/// Counts produced by one pass of the storage/link/people stages.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineCounts {
    pub events: StoreOutcome,
    pub linked: u64,
    pub metadata_updated: u64,
    pub people: UpsertOutcome,
}

/// Result of syncing a single user.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UserSyncReport {
    pub fetched: usize,
    pub counts: PipelineCounts,
    /// The watermark written for this user.
    pub synced_at: i64,
}

/// Aggregate result of one scheduled run.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    /// Users whose cursor was successfully advanced.
    pub processed: u64,

    /// Users skipped because they require re-authentication.
    pub skipped: u64,

    /// Users that failed for any other reason.
    pub failed: u64,

    /// Per-user error messages.
    pub errors: Vec<String>,

    /// Duration of the run in milliseconds.
    pub duration_ms: i64,
}

impl RunReport {
    /// Users actually attempted: processed + failed. Re-auth skips are the
    /// user's problem, not the pipeline's, and don't count against health.
    pub fn attempted(&self) -> u64 {
        self.processed + self.failed
    }

    /// Run-level verdict: healthy when there was nothing to do, or at least
    /// one user was processed and fewer than half the attempted users failed.
    /// Reported only; never acted upon automatically.
    pub fn is_healthy(&self) -> bool {
        let attempted = self.attempted();
        if attempted == 0 {
            return true;
        }
        self.processed >= 1 && (self.failed as f64) / (attempted as f64) < 0.5
    }

    /// Record one user's outcome into the run tally.
    fn record(&mut self, user_id: i64, result: &Result<UserSyncReport, AppError>) {
        match result {
            Ok(_) => self.processed += 1,
            Err(e) if e.is_authentication_expired() => {
                self.skipped += 1;
                log::info!("User {} skipped: requires re-authentication", user_id);
            }
            Err(e) => {
                self.failed += 1;
                self.errors.push(format!("User {}: {}", user_id, e));
                log::warn!("User {} sync failed: {}", user_id, e);
            }
        }
    }
}

/// The most recent successful sync, observable by UI layers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LastSync {
    pub user_id: i64,
    pub last_sync_at: i64,
}

/// Sync log entry matching the sync_log table.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub operation: String,
    pub status: String,
    pub user_id: Option<i64>,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: i64,
}

/// Commands that can be sent to the sync engine.
#[derive(Debug)]
pub enum SyncCommand {
    /// Trigger an immediate scheduled run.
    TriggerSync,

    /// Run the single-user manual refresh path.
    RefreshUser(i64),

    /// Update the sync configuration.
    UpdateConfig(SyncConfig),

    /// Stop the sync engine.
    Stop,
}

/// Lightweight handle for controlling the background sync engine.
///
/// Communicates with the background loop via an mpsc channel, avoiding
/// lock contention.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,

    /// Shared configuration (readable without locking the engine).
    config: Arc<RwLock<SyncConfig>>,

    /// Receiver side of the "last sync changed" signal.
    last_sync_rx: watch::Receiver<Option<LastSync>>,
}

impl SyncHandle {
    /// Trigger an immediate scheduled run.
    pub async fn trigger_sync(&self) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::TriggerSync)
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Trigger a manual refresh for one user.
    pub async fn refresh_user(&self, user_id: i64) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::RefreshUser(user_id))
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Update the sync configuration.
    pub async fn update_config(&self, config: SyncConfig) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::UpdateConfig(config))
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Stop the background loop.
    pub async fn stop(&self) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::Stop)
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Get the current configuration.
    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Subscribe to "last sync changed" notifications.
    pub fn last_sync(&self) -> watch::Receiver<Option<LastSync>> {
        self.last_sync_rx.clone()
    }
}

/// Background sync engine.
pub struct SyncEngine {
    pool: DbPool,

    config: Arc<RwLock<SyncConfig>>,

    oauth: OAuthConfig,

    /// Client for the token refresh exchange. Timeouts are applied per
    /// request so config updates take effect without a rebuild.
    http: reqwest::Client,

    /// Upstream fetch implementation.
    source: Arc<dyn EventSource>,

    /// Global ceiling on concurrent runs (scheduled + manual).
    limiter: Arc<Semaphore>,

    /// Users with a manual refresh currently in flight.
    refresh_inflight: Arc<Mutex<HashSet<i64>>>,

    last_sync_tx: watch::Sender<Option<LastSync>>,
}

impl SyncEngine {
    /// Create a new sync engine backed by the GitLab API.
    pub fn new(pool: DbPool, oauth: OAuthConfig, config: SyncConfig) -> Result<Self, AppError> {
        Self::with_source(pool, oauth, config, Arc::new(GitLabSource))
    }

    fn with_source(
        pool: DbPool,
        oauth: OAuthConfig,
        config: SyncConfig,
        source: Arc<dyn EventSource>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        let limiter = Arc::new(Semaphore::new(config.max_concurrent_runs));
        let (last_sync_tx, _) = watch::channel(None);

        Ok(Self {
            pool,
            config: Arc::new(RwLock::new(config)),
            oauth,
            http,
            source,
            limiter,
            refresh_inflight: Arc::new(Mutex::new(HashSet::new())),
            last_sync_tx,
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub(crate) fn refresh_inflight(&self) -> &Arc<Mutex<HashSet<i64>>> {
        &self.refresh_inflight
    }

    pub(crate) fn limiter(&self) -> &Arc<Semaphore> {
        &self.limiter
    }

    /// Apply a new concurrency ceiling. Growth takes effect immediately;
    /// shrinking takes effect as in-flight runs release their permits.
    fn resize_limiter(&self, old: usize, new: usize) {
        match new.cmp(&old) {
            Ordering::Greater => self.limiter.add_permits(new - old),
            Ordering::Less => {
                let limiter = self.limiter.clone();
                let surplus = (old - new) as u32;
                tokio::spawn(async move {
                    if let Ok(permits) = limiter.acquire_many(surplus).await {
                        permits.forget();
                    }
                });
            }
            Ordering::Equal => {}
        }
    }

    /// Start the background sync loop.
    ///
    /// Spawns a background task that owns the engine and runs sync at the
    /// configured interval. Returns a lightweight `SyncHandle` for sending
    /// commands (trigger, refresh, config update, stop) without holding a lock.
    pub fn start_background(
        pool: DbPool,
        oauth: OAuthConfig,
        config: SyncConfig,
    ) -> Result<SyncHandle, AppError> {
        Ok(Self::spawn_loop(Arc::new(Self::new(pool, oauth, config)?)))
    }

    /// Run the command loop for an engine.
    ///
    /// Runs and refreshes execute on their own tasks so the loop keeps
    /// draining commands while they are in flight; in particular, `Stop`
    /// cancels an in-progress run between user iterations instead of waiting
    /// for it. The semaphore bounds how many spawned runs make progress.
    fn spawn_loop(engine: Arc<Self>) -> SyncHandle {
        let (tx, mut rx) = mpsc::channel::<SyncCommand>(16);
        let config_shared = engine.config.clone();
        let last_sync_rx = engine.last_sync_tx.subscribe();

        tokio::spawn(async move {
            let cancel = CancellationToken::new();

            let interval_secs = engine.config.read().await.interval_secs;
            let mut interval = time::interval(Duration::from_secs(interval_secs));
            // The first tick fires immediately; that is the initial sync.

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::spawn_run(&engine, &cancel, "scheduled");
                    }
                    Some(cmd) = rx.recv() => {
                        match cmd {
                            SyncCommand::TriggerSync => {
                                Self::spawn_run(&engine, &cancel, "triggered");
                            }
                            SyncCommand::RefreshUser(user_id) => {
                                let engine = engine.clone();
                                let run_cancel = cancel.child_token();
                                tokio::spawn(async move {
                                    let refresh = crate::services::manual_refresh::ManualRefresh::new(engine);
                                    match refresh.refresh_user(user_id, run_cancel, |_| {}).await {
                                        Ok(report) => log::info!(
                                            "Manual refresh for user {} done: {} fetched",
                                            user_id, report.fetched
                                        ),
                                        Err(e) => log::warn!("Manual refresh for user {} failed: {}", user_id, e),
                                    }
                                });
                            }
                            SyncCommand::UpdateConfig(new_config) => {
                                log::info!("Config updated, interval={}s", new_config.interval_secs);
                                interval = time::interval(Duration::from_secs(new_config.interval_secs));
                                // Consume the immediate tick; the config change is not a sync trigger.
                                interval.tick().await;
                                let mut config = engine.config.write().await;
                                engine.resize_limiter(
                                    config.max_concurrent_runs,
                                    new_config.max_concurrent_runs,
                                );
                                *config = new_config;
                            }
                            SyncCommand::Stop => {
                                log::info!("Sync engine stopping");
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            }
            log::info!("Sync engine stopped");
        });

        SyncHandle {
            command_tx: tx,
            config: config_shared,
            last_sync_rx,
        }
    }

    /// Spawn one full run on its own task, cancellable via a child token.
    fn spawn_run(engine: &Arc<Self>, cancel: &CancellationToken, kind: &'static str) {
        let engine = engine.clone();
        let run_cancel = cancel.child_token();
        tokio::spawn(async move {
            log::info!("Running {} sync", kind);
            match engine.run_sync(&run_cancel).await {
                Ok(report) => log::info!(
                    "{} sync done: {} processed, {} skipped, {} failed, healthy={}",
                    kind,
                    report.processed,
                    report.skipped,
                    report.failed,
                    report.is_healthy()
                ),
                Err(e) => log::error!("{} sync aborted: {}", kind, e),
            }
        });
    }

    /// Run one scheduled sync pass over every eligible user.
    ///
    /// A failure in one user's pipeline never propagates to other users;
    /// only failure to enumerate users aborts the run. The run may be
    /// cancelled between user iterations; an in-progress user iteration is
    /// allowed to complete rather than partially commit.
    pub async fn run_sync(&self, cancel: &CancellationToken) -> Result<RunReport, AppError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| AppError::internal("Sync engine shut down"))?;

        let start = Instant::now();
        let mut report = RunReport::default();

        let users = user::list_users_with_projects(&self.pool).await?;
        log::info!("Syncing {} eligible user(s)", users.len());

        for u in users {
            if cancel.is_cancelled() {
                log::info!("Run cancelled; stopping before user {}", u.id);
                break;
            }

            let result = self.sync_user(u.id).await;
            report.record(u.id, &result);
        }

        report.duration_ms = start.elapsed().as_millis() as i64;

        self.log_sync_operation(
            "sync_complete",
            if report.failed == 0 { "success" } else { "error" },
            None,
            Some(format!(
                "{} processed, {} skipped, {} failed",
                report.processed, report.skipped, report.failed
            )),
            Some(report.duration_ms),
        )
        .await?;

        Ok(report)
    }

    /// Run the full pipeline for a single user.
    ///
    /// Steps execute strictly in sequence; the cursor is advanced last and
    /// only on full success, so the pipeline delivers events at-least-once
    /// across retries. Duplicate fetch work is absorbed by the idempotent
    /// storage layer.
    pub async fn sync_user(&self, user_id: i64) -> Result<UserSyncReport, AppError> {
        let start = Instant::now();

        let u = user::get_user(&self.pool, user_id)
            .await?
            .ok_or_else(|| AppError::not_found_with_id("user", user_id.to_string()))?;

        let projects = monitored_project::list_for_user(&self.pool, user_id).await?;
        if projects.is_empty() {
            return Ok(UserSyncReport::default());
        }

        // Watermark captured before the fetch: anything that changes while
        // we fetch falls after it and is picked up next pass.
        let synced_at = now();

        let timeout_secs = self.config.read().await.request_timeout_secs;

        let token = token_manager::get_access_token(
            &self.pool,
            &self.http,
            &self.oauth,
            &u,
            Duration::from_secs(timeout_secs),
        )
        .await?;

        let cursor = sync_cursor::get_cursor(&self.pool, user_id).await?;
        let project_ids: Vec<i64> = projects.iter().map(|p| p.external_project_id).collect();

        let fetched = self
            .source
            .fetch_events(FetchRequest {
                base_url: u.gitlab_base_url.clone(),
                token,
                timeout_secs,
                project_ids,
                updated_after: cursor,
            })
            .await?;
        log::debug!(
            "User {}: fetched {} issues, {} MRs, {} notes",
            user_id,
            fetched.issues.len(),
            fetched.merge_requests.len(),
            fetched.notes.len()
        );

        let name_map = monitored_project::project_name_map(&projects);
        let counts = process_fetched(&self.pool, user_id, &fetched, &name_map).await?;

        sync_cursor::advance_cursor(&self.pool, user_id, synced_at).await?;
        self.last_sync_tx
            .send_replace(Some(LastSync { user_id, last_sync_at: synced_at }));

        self.log_sync_operation(
            "sync_user",
            "success",
            Some(user_id),
            Some(format!(
                "{} fetched, {} stored, {} skipped, {} linked",
                fetched.total(),
                counts.events.stored,
                counts.events.skipped,
                counts.linked
            )),
            Some(start.elapsed().as_millis() as i64),
        )
        .await?;

        Ok(UserSyncReport {
            fetched: fetched.total(),
            counts,
            synced_at,
        })
    }

    /// Log a sync operation to the sync_log table.
    pub async fn log_sync_operation(
        &self,
        operation: &str,
        status: &str,
        user_id: Option<i64>,
        message: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO sync_log (operation, status, user_id, message, duration_ms, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(operation)
        .bind(status)
        .bind(user_id)
        .bind(&message)
        .bind(duration_ms)
        .bind(now())
        .execute(&self.pool)
        .await?;

        // Prune old log entries (keep only MAX_LOG_ENTRIES)
        sqlx::query(
            r#"
            DELETE FROM sync_log WHERE id NOT IN (
                SELECT id FROM sync_log ORDER BY timestamp DESC LIMIT ?
            )
            "#,
        )
        .bind(MAX_LOG_ENTRIES)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get recent sync log entries.
    pub async fn get_sync_log(&self, limit: i64) -> Result<Vec<SyncLogEntry>, AppError> {
        let entries = sqlx::query_as::<_, SyncLogEntry>(
            "SELECT id, operation, status, user_id, message, duration_ms, timestamp
             FROM sync_log ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

/// Run the post-fetch pipeline stages for one user: transform, store, link,
/// recompute metadata, upsert people. Every stage is idempotent, so the
/// whole pass is safe to re-execute after a partial failure.
pub async fn process_fetched(
    pool: &DbPool,
    user_id: i64,
    fetched: &FetchedEvents,
    project_names: &HashMap<i64, String>,
) -> Result<PipelineCounts, AppError> {
    let mut events = transformer::transform_issues(&fetched.issues, project_names);
    events.extend(transformer::transform_merge_requests(
        &fetched.merge_requests,
        project_names,
    ));
    events.extend(transformer::transform_notes(&fetched.notes, project_names));

    let stored = crate::models::event::store_events(pool, user_id, &events).await?;
    let linked = linker::link_parent_events(pool, user_id).await?;
    let metadata_updated = linker::update_activity_metadata(pool, user_id).await?;

    let people = person_extractor::extract_people(fetched);
    let people_outcome = person_extractor::upsert_people(pool, user_id, &people).await?;

    Ok(PipelineCounts {
        events: stored,
        linked,
        metadata_updated,
        people: people_outcome,
    })
}
