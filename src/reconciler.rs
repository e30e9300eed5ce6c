use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config;
use crate::context::AppContext;
use crate::providers::{NormalizedStatus, ProviderUpdate, TIMEOUT_FAILURE_CODE};
use crate::tasks::lifecycle::{ApplyOutcome, TaskLifecycle};
use crate::tasks::models::{InFlightFilter, Platform};

/// key: reconcile-job -> background provider status refresh
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReconcileJob {
    /// Poll the provider for each of a user's in-flight tasks on a platform.
    PollInFlight { user_id: Uuid, platform: Platform },
    /// Fail in-flight tasks older than the platform's timeout threshold.
    SweepTimeouts {
        user_id: Option<Uuid>,
        platform: Platform,
    },
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub poll_timeout: Duration,
    pub max_concurrency: usize,
    pub queue_depth: usize,
    pub batch_limit: i64,
}

impl ReconcilerSettings {
    pub fn from_env() -> Self {
        Self {
            poll_timeout: Duration::from_secs(*config::PROVIDER_POLL_TIMEOUT_SECS),
            max_concurrency: *config::RECONCILE_MAX_CONCURRENCY,
            queue_depth: *config::RECONCILE_QUEUE_DEPTH,
            batch_limit: *config::RECONCILE_BATCH_LIMIT,
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(10),
            max_concurrency: 10,
            queue_depth: 256,
            batch_limit: 50,
        }
    }
}

/// key: reconcile-handle -> non-blocking enqueue interface
///
/// Identical jobs already queued or running are coalesced.
#[derive(Clone)]
pub struct ReconcileHandle {
    sender: Sender<ReconcileJob>,
    pending: Arc<DashSet<ReconcileJob>>,
}

impl ReconcileHandle {
    /// A handle whose jobs are delivered to the returned receiver instead of a worker.
    pub fn detached(queue_depth: usize) -> (Self, Receiver<ReconcileJob>) {
        let (sender, receiver) = channel(queue_depth.max(1));
        (
            Self {
                sender,
                pending: Arc::new(DashSet::new()),
            },
            receiver,
        )
    }

    /// Offers a job without waiting. A full queue drops the job.
    pub fn dispatch(&self, job: ReconcileJob) -> Result<()> {
        if !self.pending.insert(job.clone()) {
            debug!(?job, "reconcile job already pending");
            return Ok(());
        }
        self.sender.try_send(job).map_err(|err| {
            let (job, reason) = match err {
                TrySendError::Full(job) => (job, "queue full"),
                TrySendError::Closed(job) => (job, "worker stopped"),
            };
            self.pending.remove(&job);
            anyhow!("reconcile job dropped ({reason}): {job:?}")
        })
    }

    fn finish(&self, job: &ReconcileJob) {
        self.pending.remove(job);
    }

    /// Releases the job's pending slot when dropped, including during a panic unwind.
    fn guard(&self, job: ReconcileJob) -> PendingGuard {
        PendingGuard {
            handle: self.clone(),
            job,
        }
    }
}

struct PendingGuard {
    handle: ReconcileHandle,
    job: ReconcileJob,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.handle.finish(&self.job);
    }
}

pub fn start_reconcile_worker(ctx: AppContext, settings: ReconcilerSettings) -> ReconcileHandle {
    let (handle, mut rx) = ReconcileHandle::detached(settings.queue_depth);
    let worker_handle = handle.clone();
    let limiter = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Ok(permit) = limiter.clone().acquire_owned().await else {
                break;
            };
            let ctx = ctx.clone();
            let settings = settings.clone();
            let handle = worker_handle.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _pending = handle.guard(job.clone());
                run_job(&ctx, &settings, &job).await;
            });
        }
    });

    handle
}

async fn run_job(ctx: &AppContext, settings: &ReconcilerSettings, job: &ReconcileJob) {
    match job {
        ReconcileJob::PollInFlight { user_id, platform } => {
            match poll_in_flight(ctx, *platform, *user_id, settings).await {
                Ok(report) => debug!(%user_id, %platform, ?report, "in-flight poll finished"),
                Err(err) => error!(?err, %user_id, %platform, "in-flight poll failed"),
            }
        }
        ReconcileJob::SweepTimeouts { user_id, platform } => {
            match sweep_timeouts(ctx, *platform, *user_id, Utc::now(), settings.batch_limit).await
            {
                Ok(swept) if swept > 0 => {
                    info!(?user_id, %platform, swept, "timed out stale tasks")
                }
                Ok(_) => {}
                Err(err) => error!(?err, ?user_id, %platform, "timeout sweep failed"),
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub inspected: usize,
    pub progressed: usize,
    pub finished: usize,
    pub provider_errors: usize,
    pub store_errors: usize,
}

/// Polls the provider once per in-flight task and feeds each answer through the lifecycle.
/// Each call is bounded by `poll_timeout`. Slow or failing calls, and answers the store could
/// not apply, are counted and skipped.
pub async fn poll_in_flight(
    ctx: &AppContext,
    platform: Platform,
    user_id: Uuid,
    settings: &ReconcilerSettings,
) -> Result<PollReport> {
    let mut report = PollReport::default();
    let Some(adapter) = ctx.providers.get(platform) else {
        return Ok(report);
    };
    if !adapter.capabilities().poll {
        return Ok(report);
    }

    let tasks = ctx
        .store
        .list_in_flight(&InFlightFilter {
            platform,
            user_id: Some(user_id),
            submitted_before: None,
            limit: settings.batch_limit,
        })
        .await?;
    report.inspected = tasks.len();
    let lifecycle = TaskLifecycle::new(ctx.clone());

    for task in tasks {
        let status =
            match time::timeout(settings.poll_timeout, adapter.poll_status(&task.external_task_id))
                .await
            {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    report.provider_errors += 1;
                    warn!(?err, task_id = %task.id, %platform, "provider poll failed");
                    continue;
                }
                Err(_) => {
                    report.provider_errors += 1;
                    warn!(task_id = %task.id, %platform, "provider poll timed out");
                    continue;
                }
            };
        let applied = lifecycle
            .apply(
                platform,
                ProviderUpdate {
                    external_task_id: task.external_task_id.clone(),
                    status,
                },
            )
            .await;
        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(err) => {
                report.store_errors += 1;
                error!(?err, task_id = %task.id, %platform, "failed to apply polled status");
                continue;
            }
        };
        match outcome {
            ApplyOutcome::Progressed => report.progressed += 1,
            ApplyOutcome::Succeeded { .. }
            | ApplyOutcome::Failed { .. }
            | ApplyOutcome::Rerouted { .. } => report.finished += 1,
            ApplyOutcome::Discarded | ApplyOutcome::UnknownTask => {}
        }
    }
    Ok(report)
}

/// Fails in-flight tasks whose current provider job was submitted before `now - threshold`
/// with a `TIMEOUT` code. Goes through the same conditional write as provider updates, so a
/// result that lands first wins.
pub async fn sweep_timeouts(
    ctx: &AppContext,
    platform: Platform,
    user_id: Option<Uuid>,
    now: DateTime<Utc>,
    batch_limit: i64,
) -> Result<usize> {
    let Some(threshold) = ctx
        .providers
        .get(platform)
        .and_then(|adapter| adapter.timeout_threshold())
    else {
        return Ok(0);
    };
    let stale = ctx
        .store
        .list_in_flight(&InFlightFilter {
            platform,
            user_id,
            submitted_before: Some(now - threshold),
            limit: batch_limit,
        })
        .await?;

    let lifecycle = TaskLifecycle::new(ctx.clone());
    let mut swept = 0;
    for task in stale {
        let outcome = lifecycle
            .apply(
                platform,
                ProviderUpdate {
                    external_task_id: task.external_task_id.clone(),
                    status: NormalizedStatus::failed(
                        format!("no result after {} minutes", threshold.num_minutes()),
                        Some(TIMEOUT_FAILURE_CODE),
                    ),
                },
            )
            .await;
        match outcome {
            Ok(ApplyOutcome::Failed { .. }) => swept += 1,
            Ok(_) => {}
            Err(err) => error!(?err, task_id = %task.id, %platform, "failed to time out task"),
        }
    }
    Ok(swept)
}

/// key: timeout-sweep -> periodic stale task scan across all users
pub fn spawn_timeout_sweep(ctx: AppContext, batch_limit: i64) {
    let interval = Duration::from_secs(*config::TIMEOUT_SWEEP_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_sweep_tick(&ctx, Utc::now(), batch_limit).await {
                warn!(?err, "timeout sweep tick failed");
            }
        }
    });
}

pub async fn process_sweep_tick(
    ctx: &AppContext,
    now: DateTime<Utc>,
    batch_limit: i64,
) -> Result<usize> {
    let mut total = 0;
    for platform in ctx.providers.platforms().collect::<Vec<_>>() {
        let swept = sweep_timeouts(ctx, platform, None, now, batch_limit).await?;
        if swept > 0 {
            info!(%platform, swept, "timed out stale tasks");
        }
        total += swept;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_jobs_are_coalesced_until_finished() {
        let (handle, mut rx) = ReconcileHandle::detached(4);
        let job = ReconcileJob::PollInFlight {
            user_id: Uuid::new_v4(),
            platform: Platform::Runway,
        };
        handle.dispatch(job.clone()).unwrap();
        handle.dispatch(job.clone()).unwrap();
        assert_eq!(rx.recv().await, Some(job.clone()));
        assert!(rx.try_recv().is_err());

        handle.finish(&job);
        handle.dispatch(job.clone()).unwrap();
        assert_eq!(rx.recv().await, Some(job));
    }

    #[tokio::test]
    async fn panicking_job_releases_its_pending_slot() {
        let (handle, mut rx) = ReconcileHandle::detached(4);
        let job = ReconcileJob::SweepTimeouts {
            user_id: None,
            platform: Platform::Kie,
        };
        handle.dispatch(job.clone()).unwrap();
        assert_eq!(rx.recv().await, Some(job.clone()));

        let guard = handle.guard(job.clone());
        let crashed = tokio::spawn(async move {
            let _pending = guard;
            panic!("job blew up");
        })
        .await;
        assert!(crashed.unwrap_err().is_panic());
        assert!(!handle.pending.contains(&job));

        handle.dispatch(job.clone()).unwrap();
        assert_eq!(rx.recv().await, Some(job));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (handle, _rx) = ReconcileHandle::detached(1);
        handle
            .dispatch(ReconcileJob::SweepTimeouts {
                user_id: None,
                platform: Platform::Luma,
            })
            .unwrap();
        let dropped = ReconcileJob::PollInFlight {
            user_id: Uuid::new_v4(),
            platform: Platform::Luma,
        };
        assert!(handle.dispatch(dropped.clone()).is_err());
        assert!(!handle.pending.contains(&dropped));
    }
}
