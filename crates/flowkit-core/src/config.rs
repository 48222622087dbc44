//! Engine configuration, assembled from environment variables.
//!
//! There is no config-file framework here, by design: the reference crate
//! this workspace is modeled on parses its own `*_URL` / `*_MODE` environment
//! variables by hand in `main.rs` and fails fast with `anyhow::Context` on a
//! missing required value. This module follows the same shape so the same
//! failure behavior (refuse to start on a bad config, per the "Configuration
//! error" kind) is available to every binary that embeds the engine.

use std::collections::HashMap;
use std::env;

use thiserror::Error;

use crate::flow::{Backoff, BackoffKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown adapter '{value}' for {field} (expected one of: {expected})")]
    UnknownAdapter { field: &'static str, value: String, expected: &'static str },
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {field}: {value} ({reason})")]
    InvalidValue { field: &'static str, value: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAdapter {
    Memory,
    File,
    Relational,
}

impl StorageAdapter {
    fn parse(field: &'static str, raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "relational" => Ok(Self::Relational),
            other => Err(ConfigError::UnknownAdapter {
                field,
                value: other.to_string(),
                expected: "memory|file|relational",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAdapter {
    Memory,
    Relational,
}

impl StreamAdapter {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "memory" => Ok(Self::Memory),
            "relational" => Ok(Self::Relational),
            other => Err(ConfigError::UnknownAdapter {
                field: "stream.adapter",
                value: other.to_string(),
                expected: "memory|relational",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateScope {
    Always,
    Flow,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCleanupStrategy {
    Never,
    Ttl,
    OnComplete,
    Immediate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueWorkerDefaults {
    pub concurrency: usize,
    pub autorun: bool,
    pub polling_interval_ms: u64,
}

impl Default for QueueWorkerDefaults {
    fn default() -> Self {
        Self { concurrency: 5, autorun: true, polling_interval_ms: 250 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOptionDefaults {
    pub attempts: u32,
    pub backoff: Backoff,
    pub priority: i32,
    pub timeout_ms: Option<u64>,
}

impl Default for JobOptionDefaults {
    fn default() -> Self {
        Self { attempts: 3, backoff: Backoff::fixed(1000), priority: 0, timeout_ms: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateConfig {
    pub auto_scope: StateScope,
    pub cleanup_strategy: StateCleanupStrategy,
    pub cleanup_ttl_ms: Option<u64>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            auto_scope: StateScope::Flow,
            cleanup_strategy: StateCleanupStrategy::OnComplete,
            cleanup_ttl_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStrings {
    pub postgres_url: Option<String>,
    pub file_dir: Option<String>,
}

/// The process-wide configuration surface enumerated in the external
/// interfaces section: adapter selection per storage interface, naming
/// prefixes, worker/job defaults, state scoping policy, and connection
/// strings. `dir` (user flow file discovery) is carried but unused by this
/// crate — it's consumed by the external build-time discovery collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub dir: Option<String>,

    pub queue_adapter: StorageAdapter,
    pub queue_prefix: String,
    pub queue_worker: QueueWorkerDefaults,
    pub queue_default_job_options: JobOptionDefaults,

    pub store_adapter: StorageAdapter,
    pub store_prefix: String,
    pub store_state: StateConfig,
    pub store_event_ttl_sec: Option<u64>,
    pub store_metadata_ttl_sec: Option<u64>,

    pub stream_adapter: StreamAdapter,
    pub stream_prefix: String,

    pub connections: ConnectionStrings,

    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: None,
            queue_adapter: StorageAdapter::Memory,
            queue_prefix: "flowkit".into(),
            queue_worker: QueueWorkerDefaults::default(),
            queue_default_job_options: JobOptionDefaults::default(),
            store_adapter: StorageAdapter::Memory,
            store_prefix: "flowkit".into(),
            store_state: StateConfig::default(),
            store_event_ttl_sec: None,
            store_metadata_ttl_sec: None,
            stream_adapter: StreamAdapter::Memory,
            stream_prefix: "flowkit".into(),
            connections: ConnectionStrings { postgres_url: None, file_dir: None },
            log_level: "info".into(),
        }
    }
}

impl EngineConfig {
    /// Load from environment variables, falling back to in-memory defaults
    /// for anything unset. Adapter names and backoff kind are validated
    /// eagerly: a bad value here is a Configuration error (§7), fatal at
    /// init rather than discovered later mid-run.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("FLOW_DIR") {
            cfg.dir = Some(v);
        }
        if let Ok(v) = env::var("QUEUE_ADAPTER") {
            cfg.queue_adapter = StorageAdapter::parse("queue.adapter", &v)?;
        }
        if let Ok(v) = env::var("QUEUE_PREFIX") {
            cfg.queue_prefix = v;
        }
        if let Ok(v) = env::var("QUEUE_WORKER_CONCURRENCY") {
            cfg.queue_worker.concurrency = parse_usize("queue.worker.concurrency", &v)?;
        }
        if let Ok(v) = env::var("QUEUE_WORKER_AUTORUN") {
            cfg.queue_worker.autorun = parse_bool("queue.worker.autorun", &v)?;
        }
        if let Ok(v) = env::var("QUEUE_WORKER_POLLING_INTERVAL_MS") {
            cfg.queue_worker.polling_interval_ms = parse_u64("queue.worker.pollingIntervalMs", &v)?;
        }
        if let Ok(v) = env::var("QUEUE_DEFAULT_ATTEMPTS") {
            cfg.queue_default_job_options.attempts = parse_u32("queue.defaultJobOptions.attempts", &v)?;
        }
        if let Ok(v) = env::var("QUEUE_DEFAULT_BACKOFF_TYPE") {
            let kind = match v.as_str() {
                "fixed" => BackoffKind::Fixed,
                "exponential" => BackoffKind::Exponential,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "queue.defaultJobOptions.backoff.type",
                        value: other.to_string(),
                        reason: "expected fixed|exponential".into(),
                    })
                }
            };
            cfg.queue_default_job_options.backoff.kind = kind;
        }
        if let Ok(v) = env::var("QUEUE_DEFAULT_BACKOFF_DELAY_MS") {
            cfg.queue_default_job_options.backoff.delay_ms = parse_u64("queue.defaultJobOptions.backoff.delayMs", &v)?;
        }

        if let Ok(v) = env::var("STORE_ADAPTER") {
            cfg.store_adapter = StorageAdapter::parse("store.adapter", &v)?;
        }
        if let Ok(v) = env::var("STORE_PREFIX") {
            cfg.store_prefix = v;
        }
        if let Ok(v) = env::var("STORE_STATE_AUTO_SCOPE") {
            cfg.store_state.auto_scope = match v.as_str() {
                "always" => StateScope::Always,
                "flow" => StateScope::Flow,
                "never" => StateScope::Never,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "store.state.autoScope",
                        value: other.to_string(),
                        reason: "expected always|flow|never".into(),
                    })
                }
            };
        }
        if let Ok(v) = env::var("STORE_STATE_CLEANUP_STRATEGY") {
            cfg.store_state.cleanup_strategy = match v.as_str() {
                "never" => StateCleanupStrategy::Never,
                "ttl" => StateCleanupStrategy::Ttl,
                "on-complete" => StateCleanupStrategy::OnComplete,
                "immediate" => StateCleanupStrategy::Immediate,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "store.state.cleanup.strategy",
                        value: other.to_string(),
                        reason: "expected never|ttl|on-complete|immediate".into(),
                    })
                }
            };
        }

        if let Ok(v) = env::var("STREAM_ADAPTER") {
            cfg.stream_adapter = StreamAdapter::parse(&v)?;
        }
        if let Ok(v) = env::var("STREAM_PREFIX") {
            cfg.stream_prefix = v;
        }

        cfg.connections.postgres_url = env::var("DATABASE_URL").ok();
        cfg.connections.file_dir = env::var("FLOWKIT_FILE_DIR").ok();

        if matches!(cfg.queue_adapter, StorageAdapter::Relational)
            || matches!(cfg.store_adapter, StorageAdapter::Relational)
            || matches!(cfg.stream_adapter, StreamAdapter::Relational)
        {
            if cfg.connections.postgres_url.is_none() {
                return Err(ConfigError::MissingVar("DATABASE_URL"));
            }
        }

        if let Ok(v) = env::var("RUST_LOG") {
            cfg.log_level = v;
        }

        Ok(cfg)
    }
}

fn parse_usize(field: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue { field, value: raw.to_string(), reason: "not an integer".into() })
}

fn parse_u64(field: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue { field, value: raw.to_string(), reason: "not an integer".into() })
}

fn parse_u32(field: &'static str, raw: &str) -> Result<u32, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue { field, value: raw.to_string(), reason: "not an integer".into() })
}

fn parse_bool(field: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue { field, value: raw.to_string(), reason: "expected true|false".into() }),
    }
}

/// Helper used by `index.read`'s filter map and similar loosely-typed call
/// sites; kept here so both `flowkit-storage` and `flowkit-engine` share one
/// definition of "a flat filter map".
pub type FilterMap = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_memory() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.queue_adapter, StorageAdapter::Memory);
        assert_eq!(cfg.store_adapter, StorageAdapter::Memory);
        assert_eq!(cfg.stream_adapter, StreamAdapter::Memory);
    }

    #[test]
    fn rejects_unknown_adapter() {
        let err = StorageAdapter::parse("queue.adapter", "redis").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAdapter { .. }));
    }
}
