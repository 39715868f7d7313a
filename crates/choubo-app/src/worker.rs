//! Worker runtime polling the durable queues.
//!
//! Two pools share one process: a heavy pool (OCR parse jobs, low
//! concurrency, provider rate limit) and a light pool (validation and
//! suggestion). Claims are exclusive at the queue layer, so each pool simply
//! claims what it has capacity for, dispatches, and reports the outcome back
//! to the queue.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::{Semaphore, watch};
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::error::AppError;
use crate::jobs::{JobError, document_parse, invoice_validate, journal_suggest};
use crate::queue::{JobKind, QueueJob, QueueName};

/// Active jobs untouched for this long are presumed orphaned by a crashed
/// worker and requeued.
const STALE_ACTIVE_MS: i64 = 10 * 60 * 1_000;
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Run one claimed job to completion and settle it with the queue.
pub async fn execute_job(ctx: &AppContext, job: &QueueJob) {
    let outcome: Result<(), JobError> = match job.kind {
        JobKind::DocumentParse => document_parse::run(ctx, job).await,
        JobKind::InvoiceValidate => invoice_validate::run(ctx, job).await,
        JobKind::JournalSuggest => journal_suggest::run(ctx, job).await,
    };
    match outcome {
        Ok(()) => {
            if let Err(err) = ctx.queue.complete(&job.job_id) {
                error!(job_id = %job.job_id, error = %err, "failed to mark job completed");
            }
        }
        Err(job_err) => {
            warn!(job_id = %job.job_id, error = %job_err, "job attempt failed");
            if let Err(err) = ctx.queue.fail(&job.job_id, &job_err.to_string()) {
                error!(job_id = %job.job_id, error = %err, "failed to record job failure");
            }
        }
    }
}

/// Claim and run every currently due job of one queue, sequentially.
/// Drain helper for tests and the one-shot CLI path.
pub async fn run_due_jobs(ctx: &AppContext, queue: QueueName, limit: usize) -> Result<usize, AppError> {
    let claimed = ctx.queue.claim_due(queue, limit)?;
    let count = claimed.len();
    for job in &claimed {
        execute_job(ctx, job).await;
    }
    Ok(count)
}

async fn queue_loop(
    ctx: AppContext,
    queue: QueueName,
    concurrency: usize,
    rate_limiter: Option<Arc<DirectRateLimiter>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let poll_interval = Duration::from_millis(ctx.config.queue.poll_interval_ms);
    info!(queue = queue.as_ref(), concurrency, "queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match ctx.queue.claim_due(queue, concurrency) {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(queue = queue.as_ref(), error = %err, "failed to claim jobs");
                Vec::new()
            }
        };

        if claimed.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        for job in claimed {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Some(limiter) = &rate_limiter {
                limiter.until_ready().await;
            }
            let job_ctx = ctx.clone();
            tokio::spawn(async move {
                execute_job(&job_ctx, &job).await;
                drop(permit);
            });
        }
    }

    // Let in-flight jobs finish before reporting the pool stopped.
    let _ = semaphore.acquire_many(concurrency as u32).await;
    info!(queue = queue.as_ref(), "queue worker stopped");
}

async fn stale_sweep_loop(ctx: AppContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(STALE_SWEEP_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
        match ctx.queue.release_stale(STALE_ACTIVE_MS) {
            Ok(released) if !released.is_empty() => {
                warn!(count = released.len(), "requeued stale active jobs");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "stale job sweep failed"),
        }
    }
}

/// Run both worker pools until Ctrl-C.
pub async fn run(ctx: AppContext) -> Result<(), AppError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heavy_rate = NonZeroU32::new(ctx.config.queue.heavy_rate_per_sec.max(1))
        .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));

    let heavy = tokio::spawn(queue_loop(
        ctx.clone(),
        QueueName::Heavy,
        ctx.config.queue.heavy_concurrency.max(1),
        heavy_rate,
        shutdown_rx.clone(),
    ));
    let light = tokio::spawn(queue_loop(
        ctx.clone(),
        QueueName::Light,
        ctx.config.queue.light_concurrency.max(1),
        None,
        shutdown_rx.clone(),
    ));
    let sweeper = tokio::spawn(stale_sweep_loop(ctx.clone(), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::Internal(format!("failed to listen for shutdown: {err}")))?;
    info!("shutdown requested, draining workers");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(heavy, light, sweeper);
    Ok(())
}
