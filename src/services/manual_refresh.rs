//! Manual refresh controller.
//!
//! Runs the single-user sync pipeline on demand, with a per-user in-flight
//! guard and bounded exponential backoff when the upstream rate-limits us.
//! Backoff waits emit a per-second countdown so a UI can display progress,
//! and every pending wait is cancellable.

use crate::error::AppError;
use crate::services::sync_engine::{SyncEngine, UserSyncReport};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Retries after the initial attempt. Delays are 1s, 2s, 4s.
const MAX_RETRIES: u32 = 3;

fn backoff_delay(retry: u32) -> Duration {
    Duration::from_secs(1 << retry)
}

/// Progress notifications emitted during a manual refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RefreshProgress {
    /// An attempt is starting (1-based; 1 is the initial attempt).
    Attempting { attempt: u32 },

    /// Rate limited; waiting before the next attempt. Emitted once per
    /// second with the remaining wait.
    Waiting { attempt: u32, seconds_remaining: u64 },
}

/// Run `op`, retrying only on rate-limit errors with 1s/2s/4s backoff.
///
/// Any other error returns immediately. Cancellation during a wait stops
/// the pending retry and returns an error; it never interrupts `op` itself.
/// When all retries are exhausted the final rate-limit error is returned.
pub async fn retry_with_backoff<T, F, Fut, P>(
    op: F,
    cancel: &CancellationToken,
    progress: &P,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
    P: Fn(RefreshProgress),
{
    for retry in 0..=MAX_RETRIES {
        if cancel.is_cancelled() {
            return Err(AppError::internal("Manual refresh cancelled"));
        }

        progress(RefreshProgress::Attempting { attempt: retry + 1 });

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_rate_limited() && retry < MAX_RETRIES => e,
            Err(e) => return Err(e),
        };

        let delay = backoff_delay(retry);
        log::info!(
            "Rate limited ({}); retrying in {}s",
            err,
            delay.as_secs()
        );

        for remaining in (1..=delay.as_secs()).rev() {
            progress(RefreshProgress::Waiting {
                attempt: retry + 1,
                seconds_remaining: remaining,
            });
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Manual refresh cancelled during backoff");
                    return Err(AppError::internal("Manual refresh cancelled"));
                }
                _ = time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    // The loop always returns from within; retry == MAX_RETRIES hits the
    // `Err(e)` arm above.
    unreachable!("backoff loop exits via return")
}

/// Removes the user from the in-flight set on every exit path.
#[derive(Debug)]
struct InflightGuard {
    set: Arc<Mutex<HashSet<i64>>>,
    user_id: i64,
}

impl InflightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<i64>>>, user_id: i64) -> Result<Self, AppError> {
        let inserted = set
            .lock()
            .map_err(|_| AppError::internal("In-flight set poisoned"))?
            .insert(user_id);
        if !inserted {
            return Err(AppError::refresh_in_progress(user_id));
        }
        Ok(Self {
            set: set.clone(),
            user_id,
        })
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.user_id);
        }
    }
}

/// On-demand single-user refresh on top of the sync engine.
pub struct ManualRefresh {
    engine: Arc<SyncEngine>,
}

impl ManualRefresh {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Refresh one user now.
    ///
    /// Rejects with a refresh-in-progress error if this user already has a
    /// refresh running; distinct users may refresh concurrently, subject to
    /// the engine-wide concurrency ceiling shared with scheduled runs.
    pub async fn refresh_user<P>(
        &self,
        user_id: i64,
        cancel: CancellationToken,
        progress: P,
    ) -> Result<UserSyncReport, AppError>
    where
        P: Fn(RefreshProgress),
    {
        let _inflight = InflightGuard::acquire(self.engine.refresh_inflight(), user_id)?;

        let _permit = self
            .engine
            .limiter()
            .acquire()
            .await
            .map_err(|_| AppError::internal("Sync engine shut down"))?;

        let result = retry_with_backoff(
            || self.engine.sync_user(user_id),
            &cancel,
            &progress,
        )
        .await;

        match &result {
            Ok(report) => {
                self.engine
                    .log_sync_operation(
                        "manual_refresh",
                        "success",
                        Some(user_id),
                        Some(format!("{} fetched", report.fetched)),
                        None,
                    )
                    .await?;
            }
            Err(e) => {
                self.engine
                    .log_sync_operation(
                        "manual_refresh",
                        "error",
                        Some(user_id),
                        Some(e.to_string()),
                        None,
                    )
                    .await?;
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delays() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limit_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let started = time::Instant::now();

        let result = retry_with_backoff(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AppError::rate_limited(None))
                } else {
                    Ok(n)
                }
            },
            &cancel,
            &|_| {},
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two waits: 1s + 2s.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_rate_limit() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let started = time::Instant::now();

        let result: Result<(), AppError> = retry_with_backoff(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(AppError::rate_limited(None))
            },
            &cancel,
            &|_| {},
        )
        .await;

        assert!(result.unwrap_err().is_rate_limited());
        // Initial attempt plus three retries, waiting 1s + 2s + 4s between.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_do_not_retry() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), AppError> = retry_with_backoff(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(AppError::gitlab_api("upstream exploded"))
            },
            &cancel,
            &|_| {},
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_pending_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let attempts = attempts.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                retry_with_backoff(
                    || {
                        let attempts = attempts.clone();
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(AppError::rate_limited(None))
                        }
                    },
                    &cancel,
                    &|_| {},
                )
                .await
            })
        };

        // Let the first attempt fail and the 1s wait begin, then cancel.
        time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_progress_emitted_per_second() {
        let cancel = CancellationToken::new();
        let seen = Mutex::new(Vec::new());

        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::rate_limited(None))
                } else {
                    Ok(())
                }
            },
            &cancel,
            &|p| seen.lock().unwrap().push(p),
        )
        .await;

        assert!(result.is_ok());
        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                RefreshProgress::Attempting { attempt: 1 },
                RefreshProgress::Waiting { attempt: 1, seconds_remaining: 1 },
                RefreshProgress::Attempting { attempt: 2 },
            ]
        );
    }

    #[test]
    fn test_inflight_guard_releases_on_drop() {
        let set = Arc::new(Mutex::new(HashSet::new()));

        let guard = InflightGuard::acquire(&set, 7).unwrap();
        let second = InflightGuard::acquire(&set, 7);
        assert!(matches!(
            second.unwrap_err(),
            AppError::RefreshInProgress { user_id: 7 }
        ));

        // A different user is not blocked.
        let other = InflightGuard::acquire(&set, 8).unwrap();
        drop(other);

        drop(guard);
        assert!(InflightGuard::acquire(&set, 7).is_ok());
    }
}
