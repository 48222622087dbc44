//! File-backed Queue and Store: in-memory data structures identical to the
//! memory backend, write-through to a JSON snapshot on disk after every
//! mutation and reloaded at startup.
//!
//! `TopicBus` has no file backend — subscription semantics don't gain
//! anything from persistence, so a file-configured deployment uses
//! [`crate::backends::memory::InMemoryTopicBus`] for its bus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use flowkit_core::event::{Event, NewEvent, SortableIdGen};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::queue::{
    EnqueueRequest, FailOutcome, Job, JobCounts, JobFilter, JobState, Queue, QueueError, ScheduleWhen,
};
use crate::store::{deep_merge, increment_path, IndexReadQuery, IndexRecord, Store, StoreError, StreamReadOptions};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    streams: HashMap<String, Vec<Event>>,
    indices: HashMap<String, HashMap<String, IndexRecord>>,
    kv: HashMap<String, (Value, Option<i64>)>,
}

async fn load_snapshot(path: &Path) -> StoreSnapshot {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => StoreSnapshot::default(),
    }
}

async fn persist_snapshot(path: &Path, snapshot: &StoreSnapshot) {
    if let Ok(bytes) = serde_json::to_vec_pretty(snapshot) {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(path, bytes).await {
            warn!(?err, path = %path.display(), "failed to persist store snapshot");
        }
    }
}

/// File-backed `Store`. Every mutating call rewrites the whole snapshot file;
/// adequate for the single-process deployments this adapter targets.
pub struct FileStore {
    path: PathBuf,
    streams: RwLock<HashMap<String, Vec<Event>>>,
    stream_ids: dashmap::DashMap<String, SortableIdGen>,
    indices: RwLock<HashMap<String, HashMap<String, IndexRecord>>>,
    kv: RwLock<HashMap<String, (Value, Option<i64>)>>,
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = load_snapshot(&path).await;
        let stream_ids = dashmap::DashMap::new();
        for (subject, events) in &snapshot.streams {
            let gen = SortableIdGen::new();
            for _ in events {
                gen.next();
            }
            stream_ids.insert(subject.clone(), gen);
        }
        Self {
            path,
            streams: RwLock::new(snapshot.streams),
            stream_ids,
            indices: RwLock::new(snapshot.indices),
            kv: RwLock::new(snapshot.kv),
        }
    }

    async fn persist(&self) {
        let snapshot = StoreSnapshot {
            streams: self.streams.read().clone(),
            indices: self.indices.read().clone(),
            kv: self.kv.read().clone(),
        };
        persist_snapshot(&self.path, &snapshot).await;
    }

    fn next_id(&self, subject: &str) -> String {
        self.stream_ids.entry(subject.to_string()).or_default().next()
    }
}

#[async_trait]
impl Store for FileStore {
    async fn stream_append(&self, subject: &str, event: NewEvent) -> Result<Event, StoreError> {
        let id = self.next_id(subject);
        let record = Event::from_new(event, id, now_ms());
        self.streams.write().entry(subject.to_string()).or_default().push(record.clone());
        self.persist().await;
        Ok(record)
    }

    async fn stream_read(&self, subject: &str, opts: StreamReadOptions) -> Result<Vec<Event>, StoreError> {
        let streams = self.streams.read();
        let Some(events) = streams.get(subject) else { return Ok(vec![]) };
        let mut filtered: Vec<Event> = events
            .iter()
            .filter(|e| opts.from.as_ref().map(|from| &e.id >= from).unwrap_or(true))
            .filter(|e| opts.to.as_ref().map(|to| &e.id <= to).unwrap_or(true))
            .filter(|e| opts.after.as_ref().map(|after| &e.id > after).unwrap_or(true))
            .filter(|e| opts.types.as_ref().map(|types| types.contains(&e.event_type)).unwrap_or(true))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| (a.ts, &a.id).cmp(&(b.ts, &b.id)));
        if matches!(opts.order, crate::store::ReadOrder::Desc) {
            filtered.reverse();
        }
        filtered.truncate(opts.effective_limit());
        Ok(filtered)
    }

    async fn stream_delete(&self, subject: &str) -> Result<bool, StoreError> {
        let removed = self.streams.write().remove(subject).is_some();
        if removed {
            self.persist().await;
        }
        Ok(removed)
    }

    async fn index_add(&self, key: &str, id: &str, score: f64, metadata: Value) -> Result<IndexRecord, StoreError> {
        let record = {
            let mut indices = self.indices.write();
            let table = indices.entry(key.to_string()).or_default();
            let version = table.get(id).map(|r| r.version + 1).unwrap_or(1);
            let record = IndexRecord { id: id.to_string(), score, metadata, version };
            table.insert(id.to_string(), record.clone());
            record
        };
        self.persist().await;
        Ok(record)
    }

    async fn index_update(&self, key: &str, id: &str, metadata_patch: Value) -> Result<bool, StoreError> {
        {
            let mut indices = self.indices.write();
            let table = indices.entry(key.to_string()).or_default();
            let Some(record) = table.get_mut(id) else {
                return Err(StoreError::NotFound(key.to_string(), id.to_string()));
            };
            deep_merge(&mut record.metadata, &metadata_patch);
            record.version += 1;
        }
        self.persist().await;
        Ok(true)
    }

    async fn index_increment(&self, key: &str, id: &str, field_path: &str, by: f64) -> Result<f64, StoreError> {
        let value = {
            let mut indices = self.indices.write();
            let table = indices.entry(key.to_string()).or_default();
            let record = table.entry(id.to_string()).or_insert_with(|| IndexRecord {
                id: id.to_string(),
                score: 0.0,
                metadata: Value::Object(Default::default()),
                version: 0,
            });
            increment_path(&mut record.metadata, field_path, by);
            record.version += 1;
            field_path.split('.').try_fold(&record.metadata, |acc, part| acc.get(part)).and_then(Value::as_f64).unwrap_or(0.0)
        };
        self.persist().await;
        Ok(value)
    }

    async fn index_get(&self, key: &str, id: &str) -> Result<Option<IndexRecord>, StoreError> {
        Ok(self.indices.read().get(key).and_then(|t| t.get(id)).cloned())
    }

    async fn index_read(&self, key: &str, query: IndexReadQuery) -> Result<Vec<IndexRecord>, StoreError> {
        let indices = self.indices.read();
        let Some(table) = indices.get(key) else { return Ok(vec![]) };
        let mut records: Vec<IndexRecord> = table
            .values()
            .filter(|record| {
                query.filter.iter().all(|(field, expected)| {
                    let actual = record.metadata.get(field);
                    match expected {
                        Value::Array(options) => actual.map(|a| options.contains(a)).unwrap_or(false),
                        other => actual.map(|a| a == other).unwrap_or(false),
                    }
                })
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let limit = if query.limit == 0 { records.len() } else { query.limit };
        Ok(records.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn index_delete(&self, key: &str, id: &str) -> Result<bool, StoreError> {
        let removed = self.indices.write().get_mut(key).map(|t| t.remove(id).is_some()).unwrap_or(false);
        if removed {
            self.persist().await;
        }
        Ok(removed)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut kv = self.kv.write();
        if let Some((value, expires_at)) = kv.get(key) {
            if expires_at.map(|exp| exp <= now_ms()).unwrap_or(false) {
                kv.remove(key);
                drop(kv);
                self.persist().await;
                return Ok(None);
            }
            return Ok(Some(value.clone()));
        }
        Ok(None)
    }

    async fn kv_set(&self, key: &str, value: Value, ttl_sec: Option<u64>) -> Result<(), StoreError> {
        let expires_at = ttl_sec.filter(|t| *t > 0).map(|t| now_ms() + (t as i64) * 1000);
        self.kv.write().insert(key.to_string(), (value, expires_at));
        self.persist().await;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.kv.write().remove(key).is_some();
        if removed {
            self.persist().await;
        }
        Ok(removed)
    }

    async fn kv_clear(&self, pattern: &str) -> Result<u64, StoreError> {
        let count = {
            let mut kv = self.kv.write();
            let prefix = pattern.trim_end_matches('*');
            let matching: Vec<String> = if pattern.ends_with('*') {
                kv.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
            } else {
                kv.keys().filter(|k| k.as_str() == pattern).cloned().collect()
            };
            for key in &matching {
                kv.remove(key);
            }
            matching.len() as u64
        };
        if count > 0 {
            self.persist().await;
        }
        Ok(count)
    }

    async fn kv_increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let updated = {
            let mut kv = self.kv.write();
            let entry = kv.entry(key.to_string()).or_insert_with(|| (Value::from(0i64), None));
            let current = entry.0.as_i64().unwrap_or(0);
            let updated = current + by;
            entry.0 = Value::from(updated);
            updated
        };
        self.persist().await;
        Ok(updated)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    jobs: HashMap<String, HashMap<String, Job>>,
}

/// File-backed `Queue`, same write-through-snapshot approach as `FileStore`.
pub struct FileQueue {
    path: PathBuf,
    jobs: RwLock<HashMap<String, HashMap<String, Job>>>,
    processing: RwLock<HashMap<String, bool>>,
}

impl FileQueue {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot: QueueSnapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => QueueSnapshot::default(),
        };
        Self { path, jobs: RwLock::new(snapshot.jobs), processing: RwLock::new(HashMap::new()) }
    }

    async fn persist(&self) {
        let snapshot = QueueSnapshot { jobs: self.jobs.read().clone() };
        persist_snapshot_queue(&self.path, &snapshot).await;
    }

    fn insert_job(&self, queue_name: &str, req: EnqueueRequest, run_at: i64) -> Job {
        let id = req.opts.job_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let state = if req.opts.delay_ms.map(|d| d > 0).unwrap_or(false) { JobState::Delayed } else { JobState::Waiting };
        let job = Job {
            id: id.clone(),
            queue_name: queue_name.to_string(),
            name: req.name,
            data: req.data,
            state,
            attempts_made: 0,
            opts: req.opts,
            created_at: now_ms(),
            run_at,
            completed_at: None,
            last_error: None,
        };
        self.jobs.write().entry(queue_name.to_string()).or_default().insert(id.clone(), job.clone());
        job
    }
}

async fn persist_snapshot_queue(path: &Path, snapshot: &QueueSnapshot) {
    if let Ok(bytes) = serde_json::to_vec_pretty(snapshot) {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(path, bytes).await {
            warn!(?err, path = %path.display(), "failed to persist queue snapshot");
        }
    }
}

#[async_trait]
impl Queue for FileQueue {
    async fn enqueue(&self, queue_name: &str, req: EnqueueRequest) -> Result<String, QueueError> {
        if let Some(job_id) = &req.opts.job_id {
            let jobs = self.jobs.read();
            if let Some(existing) = jobs.get(queue_name).and_then(|t| t.get(job_id)) {
                if matches!(existing.state, JobState::Waiting | JobState::Active | JobState::Retry | JobState::Delayed) {
                    return Ok(existing.id.clone());
                }
            }
        }
        let run_at = now_ms() + req.opts.delay_ms.unwrap_or(0) as i64;
        let job = self.insert_job(queue_name, req, run_at);
        self.persist().await;
        Ok(job.id)
    }

    async fn schedule(&self, queue_name: &str, req: EnqueueRequest, when: ScheduleWhen) -> Result<String, QueueError> {
        let run_at = match when {
            ScheduleWhen::DelayMs(ms) => now_ms() + ms as i64,
            ScheduleWhen::Cron(_) => now_ms(),
        };
        let job = self.insert_job(queue_name, req, run_at);
        self.persist().await;
        Ok(job.id)
    }

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.read().get(queue_name).and_then(|t| t.get(job_id)).cloned())
    }

    async fn get_jobs(&self, queue_name: &str, filter: JobFilter) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read();
        let Some(table) = jobs.get(queue_name) else { return Ok(vec![]) };
        let mut matching: Vec<Job> = table
            .values()
            .cloned()
            .filter(|j| filter.states.is_empty() || filter.states.contains(&j.state))
            .collect();
        matching.sort_by_key(|j| j.created_at);
        let limit = if filter.limit == 0 { matching.len() } else { filter.limit };
        Ok(matching.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn get_job_counts(&self, queue_name: &str) -> Result<JobCounts, QueueError> {
        let jobs = self.jobs.read();
        let mut counts = JobCounts::default();
        if let Some(table) = jobs.get(queue_name) {
            for job in table.values() {
                match job.state {
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Delayed => counts.delayed += 1,
                    JobState::Retry => counts.retry += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
        }
        Ok(counts)
    }

    async fn claim_jobs(&self, queue_name: &str, job_names: &[String], max: usize) -> Result<Vec<Job>, QueueError> {
        if !self.is_processing(queue_name).await? {
            return Ok(vec![]);
        }
        let claimed = {
            let mut jobs = self.jobs.write();
            let Some(table) = jobs.get_mut(queue_name) else { return Ok(vec![]) };
            let now = now_ms();
            let mut claimable: Vec<&mut Job> = table
                .values_mut()
                .filter(|j| matches!(j.state, JobState::Waiting | JobState::Delayed | JobState::Retry))
                .filter(|j| j.run_at <= now)
                .filter(|j| job_names.is_empty() || job_names.contains(&j.name))
                .collect();
            claimable.sort_by(|a, b| b.opts.priority.cmp(&a.opts.priority).then(a.run_at.cmp(&b.run_at)));

            let mut claimed = Vec::new();
            for job in claimable.into_iter().take(max) {
                job.state = JobState::Active;
                job.attempts_made += 1;
                claimed.push(job.clone());
            }
            claimed
        };
        if !claimed.is_empty() {
            self.persist().await;
        }
        Ok(claimed)
    }

    async fn complete_job(&self, queue_name: &str, job_id: &str) -> Result<(), QueueError> {
        {
            let mut jobs = self.jobs.write();
            let job = jobs
                .get_mut(queue_name)
                .and_then(|t| t.get_mut(job_id))
                .ok_or_else(|| QueueError::UnknownJob(queue_name.to_string(), job_id.to_string()))?;
            job.state = JobState::Completed;
            job.completed_at = Some(now_ms());
        }
        self.persist().await;
        Ok(())
    }

    async fn fail_job(&self, queue_name: &str, job_id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let outcome = {
            let mut jobs = self.jobs.write();
            let job = jobs
                .get_mut(queue_name)
                .and_then(|t| t.get_mut(job_id))
                .ok_or_else(|| QueueError::UnknownJob(queue_name.to_string(), job_id.to_string()))?;
            job.last_error = Some(error.to_string());
            if job.attempts_made < job.opts.attempts {
                let delay_ms = job.opts.backoff.delay_for_attempt(job.attempts_made);
                job.state = JobState::Retry;
                job.run_at = now_ms() + delay_ms as i64;
                FailOutcome::WillRetry { next_attempt: job.attempts_made + 1, delay_ms }
            } else {
                job.state = JobState::Failed;
                job.completed_at = Some(now_ms());
                FailOutcome::ExhaustedRetries
            }
        };
        self.persist().await;
        Ok(outcome)
    }

    async fn start_processing(&self, queue_name: &str) -> Result<(), QueueError> {
        self.processing.write().insert(queue_name.to_string(), true);
        Ok(())
    }

    async fn is_processing(&self, queue_name: &str) -> Result<bool, QueueError> {
        Ok(self.processing.read().get(queue_name).copied().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueRequest;
    use flowkit_core::event::event_types;
    use uuid::Uuid;

    #[tokio::test]
    async fn store_survives_reopen_at_same_path() {
        let dir = std::env::temp_dir().join(format!("flowkit-store-test-{}", Uuid::new_v4()));
        let path = dir.join("store.json");
        {
            let store = FileStore::open(&path).await;
            store.stream_append("r1", NewEvent::new(event_types::FLOW_START, Uuid::new_v4(), "sample")).await.unwrap();
        }
        let reopened = FileStore::open(&path).await;
        let events = reopened.stream_read("r1", StreamReadOptions::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn queue_survives_reopen_at_same_path() {
        let dir = std::env::temp_dir().join(format!("flowkit-queue-test-{}", Uuid::new_v4()));
        let path = dir.join("queue.json");
        {
            let queue = FileQueue::open(&path).await;
            queue.enqueue("q", EnqueueRequest::new("job", serde_json::json!({}))).await.unwrap();
        }
        let reopened = FileQueue::open(&path).await;
        let counts = reopened.get_job_counts("q").await.unwrap();
        assert_eq!(counts.waiting, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
