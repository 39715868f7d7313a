//! Durable LMDB-backed job queue feeding the pipeline workers.
//!
//! Two logical queues share one environment: `heavy` for OCR-bound parse
//! jobs (low concurrency, rate limited), `light` for validation and journal
//! suggestion. Claiming is a conditional `pending → active` transition inside
//! a write transaction, so concurrent workers never double-claim. A job that
//! exhausts its attempts parks as `failed` and stays inspectable.

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::now_ms;
use crate::paths::{AppPaths, PathError};

const QUEUE_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

pub const HEAVY_MAX_ATTEMPTS: u32 = 5;
pub const LIGHT_MAX_ATTEMPTS: u32 = 3;

/// Heavy jobs wait out provider hiccups: 5s, 30s, 3m, 15m, 1h.
const HEAVY_BACKOFF_MS: [i64; 5] = [5_000, 30_000, 180_000, 900_000, 3_600_000];
const LIGHT_BASE_DELAY_MS: i64 = 2_000;
const LIGHT_MAX_DELAY_MS: i64 = 60_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Heavy,
    Light,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DocumentParse,
    InvoiceValidate,
    JournalSuggest,
}

impl JobKind {
    pub fn queue(self) -> QueueName {
        match self {
            JobKind::DocumentParse => QueueName::Heavy,
            JobKind::InvoiceValidate | JobKind::JournalSuggest => QueueName::Light,
        }
    }

    pub fn max_attempts(self) -> u32 {
        match self.queue() {
            QueueName::Heavy => HEAVY_MAX_ATTEMPTS,
            QueueName::Light => LIGHT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// One unit of queued work. `attempt_count` counts failed attempts; a job
/// becomes `failed` (dead-lettered) once it reaches `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: String,
    pub kind: JobKind,
    pub tenant_id: String,
    pub document_id: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_retry_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl QueueJob {
    #[must_use]
    pub fn new(kind: JobKind, tenant_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        let document_id = document_id.into();
        debug_assert!(!document_id.is_empty());
        let now = now_ms();
        Self {
            // The uuid keeps ids unique even when the same kind+document is
            // enqueued twice within one millisecond.
            job_id: format!("{}:{document_id}:{now}:{}", kind.as_ref(), Uuid::new_v4()),
            kind,
            tenant_id,
            document_id,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: kind.max_attempts(),
            last_error: None,
            next_retry_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

/// Exponential backoff with ±10% jitter, clamped to `[base, max]`.
pub fn calculate_retry_backoff(attempt_count: u32, base_delay_ms: i64, max_delay_ms: i64) -> i64 {
    use rand::Rng;
    debug_assert!(base_delay_ms > 0);
    debug_assert!(max_delay_ms >= base_delay_ms);

    let exponent = attempt_count.min(20);
    let multiplier = 2_i64.saturating_pow(exponent);
    let capped_delay = base_delay_ms.saturating_mul(multiplier).min(max_delay_ms);

    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(0.9..=1.1);
    let final_delay = ((capped_delay as f64) * jitter_factor) as i64;

    final_delay.clamp(base_delay_ms, max_delay_ms)
}

fn jitter(delay_ms: i64) -> i64 {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(0.9..=1.1);
    ((delay_ms as f64) * jitter_factor) as i64
}

/// Delay before the next attempt of a job that just failed its
/// `attempt_count`-th attempt.
pub fn retry_delay_ms(queue: QueueName, attempt_count: u32) -> i64 {
    match queue {
        QueueName::Heavy => {
            let idx = (attempt_count.saturating_sub(1) as usize).min(HEAVY_BACKOFF_MS.len() - 1);
            jitter(HEAVY_BACKOFF_MS[idx])
        }
        QueueName::Light => calculate_retry_backoff(
            attempt_count.saturating_sub(1),
            LIGHT_BASE_DELAY_MS,
            LIGHT_MAX_DELAY_MS,
        ),
    }
}

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("queue job `{0}` not found")]
    NotFound(String),
}

#[derive(Debug)]
pub struct JobQueueStore {
    env: Env,
    jobs: Database<Str, Bytes>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobQueueStore {
    pub fn open(paths: &AppPaths) -> Result<Self, JobQueueError> {
        let path = paths.queue_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(QUEUE_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let jobs = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("jobs"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("jobs"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, jobs })
    }

    pub fn enqueue(
        &self,
        kind: JobKind,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<QueueJob, JobQueueError> {
        let job = QueueJob::new(kind, tenant_id, document_id);
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs
            .put(&mut wtxn, job.job_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        debug!(job_id = %job.job_id, kind = kind.as_ref(), "enqueued job");
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<QueueJob>, JobQueueError> {
        let rtxn = self.env.read_txn()?;
        match self.jobs.get(&rtxn, job_id)? {
            Some(raw) => {
                let (job, _) = decode_from_slice::<QueueJob, _>(raw, config::standard())?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Atomically claim up to `limit` due pending jobs of one queue, moving
    /// them to `active`. The single write transaction makes claims exclusive
    /// across workers.
    pub fn claim_due(&self, queue: QueueName, limit: usize) -> Result<Vec<QueueJob>, JobQueueError> {
        debug_assert!(limit > 0);
        let now = now_ms();
        let mut wtxn = self.env.write_txn()?;
        let mut claimed = Vec::new();
        {
            let mut due: Vec<QueueJob> = Vec::new();
            for entry in self.jobs.iter(&wtxn)? {
                let (_, raw) = entry?;
                let (job, _) = decode_from_slice::<QueueJob, _>(raw, config::standard())?;
                if job.kind.queue() != queue || job.status != JobStatus::Pending {
                    continue;
                }
                if job.next_retry_at_ms.is_some_and(|at| at > now) {
                    continue;
                }
                due.push(job);
                if due.len() >= limit {
                    break;
                }
            }
            for mut job in due {
                job.status = JobStatus::Active;
                job.updated_at_ms = now;
                let encoded = encode_to_vec(&job, config::standard())?;
                self.jobs
                    .put(&mut wtxn, job.job_id.clone().as_str(), encoded.as_slice())?;
                claimed.push(job);
            }
        }
        wtxn.commit()?;
        Ok(claimed)
    }

    pub fn complete(&self, job_id: &str) -> Result<QueueJob, JobQueueError> {
        self.update(job_id, |job| {
            job.status = JobStatus::Completed;
            job.last_error = None;
            job.next_retry_at_ms = None;
        })
    }

    /// Record a failed attempt: schedule a retry with backoff, or park the
    /// job as `failed` once its attempts are spent.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<QueueJob, JobQueueError> {
        let job = self.update(job_id, |job| {
            job.attempt_count += 1;
            job.last_error = Some(error.to_string());
            if job.attempt_count >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.next_retry_at_ms = None;
            } else {
                job.status = JobStatus::Pending;
                job.next_retry_at_ms =
                    Some(now_ms() + retry_delay_ms(job.kind.queue(), job.attempt_count));
            }
        })?;
        if job.status == JobStatus::Failed {
            warn!(
                job_id,
                attempts = job.attempt_count,
                error,
                "job exhausted retries, dead-lettered"
            );
        }
        Ok(job)
    }

    fn update<F>(&self, job_id: &str, mutate: F) -> Result<QueueJob, JobQueueError>
    where
        F: FnOnce(&mut QueueJob),
    {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobQueueError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<QueueJob, _>(raw, config::standard())?;
        mutate(&mut job);
        job.updated_at_ms = now_ms();
        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs.put(&mut wtxn, job_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(job)
    }

    /// Requeue active jobs whose last touch is older than `max_active_ms`.
    /// A stall burns an attempt like any other failure; crash recovery for
    /// workers that died mid-job.
    pub fn release_stale(&self, max_active_ms: i64) -> Result<Vec<QueueJob>, JobQueueError> {
        let now = now_ms();
        let cutoff = now - max_active_ms;
        let stale_ids: Vec<String> = {
            let rtxn = self.env.read_txn()?;
            let mut ids = Vec::new();
            for entry in self.jobs.iter(&rtxn)? {
                let (key, raw) = entry?;
                let (job, _) = decode_from_slice::<QueueJob, _>(raw, config::standard())?;
                if job.status == JobStatus::Active && job.updated_at_ms < cutoff {
                    ids.push(key.to_string());
                }
            }
            ids
        };
        let mut released = Vec::new();
        for job_id in stale_ids {
            released.push(self.fail(&job_id, "stalled: worker did not finish in time")?);
        }
        Ok(released)
    }

    pub fn counts(&self, queue: QueueName) -> Result<QueueCounts, JobQueueError> {
        let rtxn = self.env.read_txn()?;
        let mut counts = QueueCounts::default();
        for entry in self.jobs.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<QueueJob, _>(raw, config::standard())?;
            if job.kind.queue() != queue {
                continue;
            }
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    pub fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<QueueJob>, JobQueueError> {
        debug_assert!(limit > 0);
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.jobs.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<QueueJob, _>(raw, config::standard())?;
            if job.status != status {
                continue;
            }
            out.push(job);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}
