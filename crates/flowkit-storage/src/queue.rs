//! The `Queue` storage interface: a durable job queue with retries and
//! delayed/scheduled jobs (§4.1).
//!
//! This trait only owns persistence and claiming. Handler registration and
//! the polling loop that turns claimed jobs into running work live one layer
//! up, in `flowkit-engine`'s worker pool — the same split the reference
//! crate draws between its persistence trait and its `WorkerPool`.

use async_trait::async_trait;
use flowkit_core::flow::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' has no job named '{1}'")]
    UnknownJob(String, String),
    #[error("concurrency conflict claiming job {0}")]
    ConcurrencyConflict(String),
    #[error("backend I/O error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Retry,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub priority: i32,
    pub timeout_ms: Option<u64>,
    pub delay_ms: Option<u64>,
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self { attempts: 1, backoff: Backoff::default(), priority: 0, timeout_ms: None, delay_ms: None, job_id: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnqueueRequest {
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
}

impl EnqueueRequest {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self { name: name.into(), data, opts: JobOptions::default() }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }
}

/// `{delayMs?|cron?}` — mutually exclusive schedule kinds for `Queue::schedule`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ScheduleWhen {
    DelayMs(u64),
    Cron(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub name: String,
    pub data: Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub opts: JobOptions,
    pub created_at: i64,
    pub run_at: i64,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Vec<JobState>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Result of `fail_job`: whether the adapter re-enqueued with backoff or
/// gave up after exhausting `attempts`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    WillRetry { next_attempt: u32, delay_ms: u64 },
    ExhaustedRetries,
}

/// Job lifecycle notifications (§4.1: "Observability events: waiting,
/// active, completed, failed, delayed").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Idempotent when `opts.job_id` is set and a job with that key is
    /// already `waiting|active|retry` in the queue.
    async fn enqueue(&self, queue_name: &str, req: EnqueueRequest) -> Result<String, QueueError>;

    async fn schedule(&self, queue_name: &str, req: EnqueueRequest, when: ScheduleWhen) -> Result<String, QueueError>;

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<Job>, QueueError>;

    async fn get_jobs(&self, queue_name: &str, filter: JobFilter) -> Result<Vec<Job>, QueueError>;

    async fn get_job_counts(&self, queue_name: &str) -> Result<JobCounts, QueueError>;

    /// Claim up to `max` runnable jobs whose `name` is in `job_names`,
    /// atomically transitioning them to `Active`. Implementations must not
    /// let two callers claim the same job (`SELECT ... FOR UPDATE SKIP
    /// LOCKED` in the relational backend, a map lock in memory/file).
    async fn claim_jobs(&self, queue_name: &str, job_names: &[String], max: usize) -> Result<Vec<Job>, QueueError>;

    async fn complete_job(&self, queue_name: &str, job_id: &str) -> Result<(), QueueError>;

    /// On failure, re-enqueues with `backoff.delayMs * (exponential ?
    /// 2^attemptsMade : 1)` when attempts remain, else marks `Failed`.
    async fn fail_job(&self, queue_name: &str, job_id: &str, error: &str) -> Result<FailOutcome, QueueError>;

    /// Marks a queue as accepting claims. Enqueues before this call still
    /// succeed; nothing claims them until processing starts.
    async fn start_processing(&self, queue_name: &str) -> Result<(), QueueError>;

    async fn is_processing(&self, queue_name: &str) -> Result<bool, QueueError>;
}
