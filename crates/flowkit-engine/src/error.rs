//! Per-subsystem error taxonomies. Each enum groups by *kind* — transient
//! I/O, job-execution failure, configuration error, protocol violation, lost
//! invariant — so callers can match on kind without string-parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unknown step '{flow_name}/{step_name}'")]
    UnknownStep { flow_name: String, step_name: String },
    #[error("no handler registered for step '{flow_name}/{step_name}'")]
    NoHandler { flow_name: String, step_name: String },
    #[error("step handler failed: {0}")]
    HandlerFailed(String),
    #[error("step timed out after {0}ms")]
    Timeout(u64),
    #[error("queue error: {0}")]
    Queue(#[from] flowkit_storage::QueueError),
    #[error("store error: {0}")]
    Store(#[from] flowkit_storage::StoreError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown flow '{0}'")]
    UnknownFlow(String),
    #[error("unknown run '{0}'")]
    UnknownRun(uuid::Uuid),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Await(#[from] crate::await_subsystem::AwaitError),
    #[error(transparent)]
    Trigger(#[from] crate::trigger_subsystem::TriggerError),
    #[error(transparent)]
    Projection(#[from] crate::projection::ProjectionError),
    #[error("store error: {0}")]
    Store(#[from] flowkit_storage::StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] flowkit_storage::QueueError),
    #[error("configuration error: {0}")]
    Config(#[from] flowkit_core::config::ConfigError),
    #[error("flow definition error: {0}")]
    FlowDef(#[from] flowkit_core::flow::FlowDefError),
}
