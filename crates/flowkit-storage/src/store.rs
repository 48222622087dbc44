//! The `Store` storage interface: append-only event streams, a sorted index
//! with optimistic CAS, and a TTL key-value store (§4.1).

use async_trait::async_trait;
use flowkit_core::config::FilterMap;
use flowkit_core::event::{Event, NewEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on index entry {key}/{id}: expected {expected}, found {actual}")]
    VersionConflict { key: String, id: String, expected: u64, actual: u64 },
    #[error("index entry {0}/{1} not found")]
    NotFound(String, String),
    #[error("exhausted {0} retries applying optimistic update")]
    RetriesExhausted(u32),
    #[error("backend I/O error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrder {
    Asc,
    Desc,
}

impl Default for ReadOrder {
    fn default() -> Self {
        ReadOrder::Asc
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamReadOptions {
    pub from: Option<String>,
    pub to: Option<String>,
    pub types: Option<Vec<String>>,
    pub order: ReadOrder,
    pub limit: Option<usize>,
    pub after: Option<String>,
}

impl StreamReadOptions {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub score: f64,
    pub metadata: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct IndexReadQuery {
    pub offset: usize,
    pub limit: usize,
    pub filter: FilterMap,
}

/// Deep-merges `patch` into `base`: nested objects merge key by key, arrays
/// and scalars replace wholesale. Used by `index.update` and the relational
/// backend's JSON-column writes.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

/// Navigates a dot-path (`"stats.totalFires"`) for `index.increment`'s
/// fallback path, creating intermediate objects as needed.
pub fn increment_path(root: &mut Value, path: &str, by: f64) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cursor = root;
    for (i, part) in parts.iter().enumerate() {
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        let map = cursor.as_object_mut().expect("just coerced to object");
        if i == parts.len() - 1 {
            let current = map.get(*part).and_then(Value::as_f64).unwrap_or(0.0);
            let updated = current + by;
            map.insert(
                part.to_string(),
                serde_json::Number::from_f64(updated).map(Value::Number).unwrap_or(Value::from(updated as i64)),
            );
            return;
        }
        cursor = map.entry(part.to_string()).or_insert_with(|| Value::Object(Default::default()));
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn stream_append(&self, subject: &str, event: NewEvent) -> Result<Event, StoreError>;

    async fn stream_read(&self, subject: &str, opts: StreamReadOptions) -> Result<Vec<Event>, StoreError>;

    async fn stream_delete(&self, subject: &str) -> Result<bool, StoreError>;

    /// Upserts; on collision the whole record is replaced and `version` increments.
    async fn index_add(&self, key: &str, id: &str, score: f64, metadata: Value) -> Result<IndexRecord, StoreError>;

    /// Deep-merges `metadata_patch`, bumps `version`. Optimistic CAS on the
    /// version observed when the call started; `Ok(false)` on conflict.
    async fn index_update(&self, key: &str, id: &str, metadata_patch: Value) -> Result<bool, StoreError>;

    /// Retries `index_update` with `100ms * 2^attempt` backoff on CAS
    /// failure, up to `max_retries`; errors with `RetriesExhausted` after.
    async fn index_update_with_retry(
        &self,
        key: &str,
        id: &str,
        metadata_patch: Value,
        max_retries: u32,
    ) -> Result<(), StoreError> {
        for attempt in 0..max_retries {
            if self.index_update(key, id, metadata_patch.clone()).await? {
                return Ok(());
            }
            let delay_ms = 100u64.saturating_mul(1u64 << attempt.min(20));
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        Err(StoreError::RetriesExhausted(max_retries))
    }

    async fn index_increment(&self, key: &str, id: &str, field_path: &str, by: f64) -> Result<f64, StoreError>;

    async fn index_get(&self, key: &str, id: &str) -> Result<Option<IndexRecord>, StoreError>;

    async fn index_read(&self, key: &str, query: IndexReadQuery) -> Result<Vec<IndexRecord>, StoreError>;

    async fn index_delete(&self, key: &str, id: &str) -> Result<bool, StoreError>;

    async fn kv_get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn kv_set(&self, key: &str, value: Value, ttl_sec: Option<u64>) -> Result<(), StoreError>;

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError>;

    /// `pattern` accepts a trailing `*` wildcard.
    async fn kv_clear(&self, pattern: &str) -> Result<u64, StoreError>;

    async fn kv_increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_merges_nested_objects() {
        let mut base = json!({"stats": {"total": 1, "success": 1}, "name": "a"});
        let patch = json!({"stats": {"success": 2}});
        deep_merge(&mut base, &patch);
        assert_eq!(base, json!({"stats": {"total": 1, "success": 2}, "name": "a"}));
    }

    #[test]
    fn deep_merge_replaces_scalars_and_arrays() {
        let mut base = json!({"tags": ["a"], "count": 1});
        let patch = json!({"tags": ["b", "c"], "count": 2});
        deep_merge(&mut base, &patch);
        assert_eq!(base, json!({"tags": ["b", "c"], "count": 2}));
    }

    #[test]
    fn increment_path_creates_missing_segments() {
        let mut root = json!({});
        increment_path(&mut root, "stats.totalFires", 1.0);
        increment_path(&mut root, "stats.totalFires", 1.0);
        assert_eq!(root["stats"]["totalFires"], json!(2.0));
    }
}
