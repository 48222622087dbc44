//! Shared domain types for the flow/step execution engine.
//!
//! This crate has no I/O of its own — it defines the vocabulary (`FlowDef`,
//! `StepDef`, `RunRecord`, `Event`, `TriggerRecord`, `AwaitRecord`) shared by
//! the storage, engine, and gateway crates so none of them need to agree on
//! wire shapes by convention alone.

pub mod config;
pub mod event;
pub mod flow;
pub mod ids;
pub mod run;
pub mod trigger;

pub use config::EngineConfig;
pub use event::{event_types, Event, NewEvent};
pub use flow::{AwaitSpec, Backoff, BackoffKind, FlowDef, FlowDefError, JobDefaults, StepDef, WorkerOptions};
pub use ids::{new_run_id, step_id, step_job_id};
pub use run::{AwaitInfo, AwaitPosition, RunRecord, RunStatus};
pub use trigger::{Subscription, SubscriptionMode, TriggerRecord, TriggerStats, TriggerStatus, TriggerType};
