//! Run records — one per flow execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::AwaitSpec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Awaiting,
    Completed,
    Failed,
    Canceled,
    Stalled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled | RunStatus::Stalled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Awaiting => "awaiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Stalled => "stalled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AwaitPosition {
    Before,
    After,
}

impl std::fmt::Display for AwaitPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AwaitPosition::Before => write!(f, "before"),
            AwaitPosition::After => write!(f, "after"),
        }
    }
}

/// Entry stored in `RunRecord::awaiting_steps`, keyed by `"{stepName}:await-{position}"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwaitInfo {
    pub await_type: String,
    pub await_config: Value,
    pub registered_at: i64,
    pub resolve_at: Option<i64>,
}

impl AwaitInfo {
    pub fn from_spec(spec: &AwaitSpec, registered_at: i64) -> Self {
        let resolve_at = match spec {
            AwaitSpec::Time { delay_ms } => Some(registered_at + *delay_ms as i64),
            _ => None,
        };
        Self {
            await_type: spec.kind_name().to_string(),
            await_config: serde_json::to_value(spec).unwrap_or(Value::Null),
            registered_at,
            resolve_at,
        }
    }
}

pub fn await_key(step_name: &str, position: AwaitPosition) -> String {
    format!("{step_name}:await-{position}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub flow_name: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub step_count: Option<u32>,
    pub completed_steps: u32,
    pub last_activity_at: i64,
    pub emitted_events: BTreeMap<String, u64>,
    pub awaiting_steps: BTreeMap<String, AwaitInfo>,
    pub version: u64,
}

impl RunRecord {
    pub fn new(run_id: Uuid, flow_name: impl Into<String>, started_at: i64) -> Self {
        Self {
            run_id,
            flow_name: flow_name.into(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            step_count: None,
            completed_steps: 0,
            last_activity_at: started_at,
            emitted_events: BTreeMap::new(),
            awaiting_steps: BTreeMap::new(),
            version: 0,
        }
    }

    /// Invariant: `status` is terminal iff `completedAt` is set.
    pub fn invariant_holds(&self) -> bool {
        self.status.is_terminal() == self.completed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_run_is_running_and_not_terminal() {
        let run = RunRecord::new(Uuid::nil(), "sample", 0);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.invariant_holds());
    }

    #[test]
    fn await_key_format() {
        assert_eq!(await_key("start", AwaitPosition::Before), "start:await-before");
    }
}
