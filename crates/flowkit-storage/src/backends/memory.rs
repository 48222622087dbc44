//! In-memory backend for all three storage interfaces.
//!
//! Grounded on this codebase's existing in-memory persistence layer: a
//! `parking_lot::RwLock`-guarded `HashMap` per collection, plain `Vec`
//! append for streams, and an atomic counter for monotonic ids.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use flowkit_core::event::{Event, NewEvent, SortableIdGen};
use parking_lot::RwLock;
use serde_json::Value;

use crate::queue::{
    EnqueueRequest, FailOutcome, Job, JobCounts, JobFilter, JobOptions, JobState, Queue, QueueError, ScheduleWhen,
};
use crate::store::{deep_merge, increment_path, IndexReadQuery, IndexRecord, Store, StoreError, StreamReadOptions};
use crate::topic_bus::{Subscription, TopicBus, TopicBusError, TopicEvent};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Default)]
struct KvEntry {
    value: Value,
    expires_at: Option<i64>,
}

/// In-memory implementation of the `Store` interface.
#[derive(Default)]
pub struct InMemoryStore {
    streams: RwLock<HashMap<String, Vec<Event>>>,
    stream_ids: DashMap<String, SortableIdGen>,
    indices: RwLock<HashMap<String, HashMap<String, IndexRecord>>>,
    kv: RwLock<HashMap<String, KvEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, subject: &str) -> String {
        self.stream_ids.entry(subject.to_string()).or_default().next()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn stream_append(&self, subject: &str, event: NewEvent) -> Result<Event, StoreError> {
        let id = self.next_id(subject);
        let record = Event::from_new(event, id, now_ms());
        self.streams.write().entry(subject.to_string()).or_default().push(record.clone());
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
        Ok(self.streams.write().remove(subject).is_some())
    }

    async fn index_add(&self, key: &str, id: &str, score: f64, metadata: Value) -> Result<IndexRecord, StoreError> {
        let mut indices = self.indices.write();
        let table = indices.entry(key.to_string()).or_default();
        let version = table.get(id).map(|r| r.version + 1).unwrap_or(1);
        let record = IndexRecord { id: id.to_string(), score, metadata, version };
        table.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn index_update(&self, key: &str, id: &str, metadata_patch: Value) -> Result<bool, StoreError> {
        let mut indices = self.indices.write();
        let table = indices.entry(key.to_string()).or_default();
        let Some(record) = table.get_mut(id) else {
            return Err(StoreError::NotFound(key.to_string(), id.to_string()));
        };
        deep_merge(&mut record.metadata, &metadata_patch);
        record.version += 1;
        Ok(true)
    }

    async fn index_increment(&self, key: &str, id: &str, field_path: &str, by: f64) -> Result<f64, StoreError> {
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
        let value = field_path.split('.').try_fold(&record.metadata, |acc, part| acc.get(part)).and_then(Value::as_f64).unwrap_or(0.0);
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
        Ok(self.indices.write().get_mut(key).map(|t| t.remove(id).is_some()).unwrap_or(false))
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut kv = self.kv.write();
        if let Some(entry) = kv.get(key) {
            if entry.expires_at.map(|exp| exp <= now_ms()).unwrap_or(false) {
                kv.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn kv_set(&self, key: &str, value: Value, ttl_sec: Option<u64>) -> Result<(), StoreError> {
        let expires_at = ttl_sec.filter(|t| *t > 0).map(|t| now_ms() + (t as i64) * 1000);
        self.kv.write().insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.kv.write().remove(key).is_some())
    }

    async fn kv_clear(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut kv = self.kv.write();
        let prefix = pattern.trim_end_matches('*');
        let matching: Vec<String> = if pattern.ends_with('*') {
            kv.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
        } else {
            kv.keys().filter(|k| k.as_str() == pattern).cloned().collect()
        };
        let count = matching.len() as u64;
        for key in matching {
            kv.remove(&key);
        }
        Ok(count)
    }

    async fn kv_increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut kv = self.kv.write();
        let entry = kv.entry(key.to_string()).or_insert_with(|| KvEntry { value: Value::from(0i64), expires_at: None });
        let current = entry.value.as_i64().unwrap_or(0);
        let updated = current + by;
        entry.value = Value::from(updated);
        Ok(updated)
    }
}

struct MemoryJob {
    job: Job,
}

/// In-memory implementation of the `Queue` interface.
#[derive(Default)]
pub struct InMemoryQueue {
    jobs: RwLock<HashMap<String, HashMap<String, MemoryJob>>>,
    processing: RwLock<HashMap<String, bool>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
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
        self.jobs
            .write()
            .entry(queue_name.to_string())
            .or_default()
            .insert(id.clone(), MemoryJob { job: job.clone() });
        job
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, queue_name: &str, req: EnqueueRequest) -> Result<String, QueueError> {
        if let Some(job_id) = &req.opts.job_id {
            let jobs = self.jobs.read();
            if let Some(existing) = jobs.get(queue_name).and_then(|t| t.get(job_id)) {
                if matches!(existing.job.state, JobState::Waiting | JobState::Active | JobState::Retry | JobState::Delayed) {
                    return Ok(existing.job.id.clone());
                }
            }
        }
        let run_at = now_ms() + req.opts.delay_ms.unwrap_or(0) as i64;
        Ok(self.insert_job(queue_name, req, run_at).id)
    }

    async fn schedule(&self, queue_name: &str, req: EnqueueRequest, when: ScheduleWhen) -> Result<String, QueueError> {
        let run_at = match when {
            ScheduleWhen::DelayMs(ms) => now_ms() + ms as i64,
            ScheduleWhen::Cron(_) => now_ms(),
        };
        Ok(self.insert_job(queue_name, req, run_at).id)
    }

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.read().get(queue_name).and_then(|t| t.get(job_id)).map(|j| j.job.clone()))
    }

    async fn get_jobs(&self, queue_name: &str, filter: JobFilter) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read();
        let Some(table) = jobs.get(queue_name) else { return Ok(vec![]) };
        let mut matching: Vec<Job> = table
            .values()
            .map(|j| j.job.clone())
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
            for entry in table.values() {
                match entry.job.state {
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
        let mut jobs = self.jobs.write();
        let Some(table) = jobs.get_mut(queue_name) else { return Ok(vec![]) };
        let now = now_ms();
        let mut claimable: Vec<&mut MemoryJob> = table
            .values_mut()
            .filter(|j| matches!(j.job.state, JobState::Waiting | JobState::Delayed | JobState::Retry))
            .filter(|j| j.job.run_at <= now)
            .filter(|j| job_names.is_empty() || job_names.contains(&j.job.name))
            .collect();
        claimable.sort_by(|a, b| b.job.opts.priority.cmp(&a.job.opts.priority).then(a.job.run_at.cmp(&b.job.run_at)));

        let mut claimed = Vec::new();
        for entry in claimable.into_iter().take(max) {
            entry.job.state = JobState::Active;
            entry.job.attempts_made += 1;
            claimed.push(entry.job.clone());
        }
        Ok(claimed)
    }

    async fn complete_job(&self, queue_name: &str, job_id: &str) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(queue_name)
            .and_then(|t| t.get_mut(job_id))
            .ok_or_else(|| QueueError::UnknownJob(queue_name.to_string(), job_id.to_string()))?;
        entry.job.state = JobState::Completed;
        entry.job.completed_at = Some(now_ms());
        Ok(())
    }

    async fn fail_job(&self, queue_name: &str, job_id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(queue_name)
            .and_then(|t| t.get_mut(job_id))
            .ok_or_else(|| QueueError::UnknownJob(queue_name.to_string(), job_id.to_string()))?;
        entry.job.last_error = Some(error.to_string());

        if entry.job.attempts_made < entry.job.opts.attempts {
            let delay_ms = entry.job.opts.backoff.delay_for_attempt(entry.job.attempts_made);
            entry.job.state = JobState::Retry;
            entry.job.run_at = now_ms() + delay_ms as i64;
            Ok(FailOutcome::WillRetry { next_attempt: entry.job.attempts_made + 1, delay_ms })
        } else {
            entry.job.state = JobState::Failed;
            entry.job.completed_at = Some(now_ms());
            Ok(FailOutcome::ExhaustedRetries)
        }
    }

    async fn start_processing(&self, queue_name: &str) -> Result<(), QueueError> {
        self.processing.write().insert(queue_name.to_string(), true);
        Ok(())
    }

    async fn is_processing(&self, queue_name: &str) -> Result<bool, QueueError> {
        Ok(self.processing.read().get(queue_name).copied().unwrap_or(false))
    }
}

/// In-memory `TopicBus`: one `broadcast` channel per topic, created lazily
/// on first subscribe and reused by subsequent publishes.
pub struct InMemoryTopicBus {
    channels: DashMap<String, tokio::sync::broadcast::Sender<TopicEvent>>,
    capacity: usize,
}

impl InMemoryTopicBus {
    pub fn new() -> Self {
        Self { channels: DashMap::new(), capacity: 1024 }
    }

    fn sender_for(&self, topic: &str) -> tokio::sync::broadcast::Sender<TopicEvent> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryTopicBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicBus for InMemoryTopicBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), TopicBusError> {
        if let Some(sender) = self.channels.get(topic) {
            // No receivers is not an error: the event is simply discarded.
            let _ = sender.send(TopicEvent { topic: topic.to_string(), payload });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TopicBusError> {
        let sender = self.sender_for(topic);
        Ok(Subscription::new(topic.to_string(), sender.subscribe()))
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        self.channels.get(topic).map(|s| s.receiver_count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueRequest;
    use flowkit_core::event::event_types;
    use uuid::Uuid;

    #[tokio::test]
    async fn stream_ids_are_monotonic_within_a_subject() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        let e1 = store.stream_append("r1", NewEvent::new(event_types::FLOW_START, run_id, "sample")).await.unwrap();
        let e2 = store.stream_append("r1", NewEvent::new(event_types::STEP_STARTED, run_id, "sample")).await.unwrap();
        assert!(e1.id < e2.id);
    }

    #[tokio::test]
    async fn index_add_then_get_includes_initial_version() {
        let store = InMemoryStore::new();
        store.index_add("flows", "sample", 0.0, serde_json::json!({"name": "sample"})).await.unwrap();
        let record = store.index_get("flows", "sample").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.metadata["name"], "sample");
    }

    #[tokio::test]
    async fn concurrent_increments_land_on_the_exact_total() {
        let store = InMemoryStore::new();
        store.index_add("flows", "sample", 0.0, serde_json::json!({})).await.unwrap();
        let mut handles = Vec::new();
        let store = std::sync::Arc::new(store);
        for _ in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.index_increment("flows", "sample", "stats.totalFires", 1.0).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let record = store.index_get("flows", "sample").await.unwrap().unwrap();
        assert_eq!(record.metadata["stats"]["totalFires"], serde_json::json!(100.0));
    }

    #[tokio::test]
    async fn kv_ttl_expiry() {
        let store = InMemoryStore::new();
        store.kv_set("k", serde_json::json!(1), Some(0)).await.unwrap();
        assert_eq!(store.kv_get("k").await.unwrap(), Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn idempotent_enqueue_returns_existing_id() {
        let queue = InMemoryQueue::new();
        let mut opts = crate::queue::JobOptions::default();
        opts.job_id = Some("fixed".into());
        let req = EnqueueRequest::new("do_thing", serde_json::json!({})).with_opts(opts.clone());
        let id1 = queue.enqueue("q", req.clone()).await.unwrap();
        let id2 = queue.enqueue("q", req).await.unwrap();
        assert_eq!(id1, id2);
        let counts = queue.get_job_counts("q").await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn claim_requires_processing_started() {
        let queue = InMemoryQueue::new();
        queue.enqueue("q", EnqueueRequest::new("job", serde_json::json!({}))).await.unwrap();
        let claimed = queue.claim_jobs("q", &[], 10).await.unwrap();
        assert!(claimed.is_empty());
        queue.start_processing("q").await.unwrap();
        let claimed = queue.claim_jobs("q", &[], 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn fail_job_retries_then_exhausts() {
        let queue = InMemoryQueue::new();
        let mut opts = JobOptions::default();
        opts.attempts = 2;
        queue.enqueue("q", EnqueueRequest::new("job", serde_json::json!({})).with_opts(opts)).await.unwrap();
        queue.start_processing("q").await.unwrap();
        let claimed = queue.claim_jobs("q", &[], 10).await.unwrap();
        let job_id = &claimed[0].id;

        let outcome = queue.fail_job("q", job_id, "boom").await.unwrap();
        assert!(matches!(outcome, FailOutcome::WillRetry { next_attempt: 2, .. }));

        let claimed = queue.claim_jobs("q", &[], 10).await.unwrap();
        let outcome = queue.fail_job("q", &claimed[0].id, "boom again").await.unwrap();
        assert_eq!(outcome, FailOutcome::ExhaustedRetries);
    }
}
