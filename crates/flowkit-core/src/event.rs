//! Event records — the append-only vocabulary flowing through the engine.
//!
//! Event *type* is an open string rather than a closed enum: steps emit
//! user-chosen names (`started.done`, `order.validated`, ...) alongside the
//! engine's own lifecycle types (`flow.start`, `step.completed`, ...), and a
//! closed Rust enum can't represent that without reintroducing a catch-all
//! variant. Matching on `event_type()` against the constants in
//! [`event_types`] keeps call sites exhaustive-enough without one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type constants the engine itself appends (as opposed to user `emit` names).
pub mod event_types {
    pub const FLOW_START: &str = "flow.start";
    pub const FLOW_COMPLETED: &str = "flow.completed";
    pub const FLOW_FAILED: &str = "flow.failed";
    pub const FLOW_CANCEL: &str = "flow.cancel";
    pub const FLOW_STALLED: &str = "flow.stalled";

    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_RETRY: &str = "step.retry";

    pub const EMIT: &str = "emit";

    pub const AWAIT_REGISTERED: &str = "await.registered";
    pub const AWAIT_RESOLVED: &str = "await.resolved";
    pub const AWAIT_TIMEOUT: &str = "await.timeout";

    pub const TRIGGER_REGISTERED: &str = "trigger.registered";
    pub const TRIGGER_UPDATED: &str = "trigger.updated";
    pub const TRIGGER_FIRED: &str = "trigger.fired";
    pub const TRIGGER_RETIRED: &str = "trigger.retired";
    pub const SUBSCRIPTION_ADDED: &str = "subscription.added";

    pub const LOG: &str = "log";

    pub const TERMINAL_FLOW_TYPES: &[&str] = &[FLOW_COMPLETED, FLOW_FAILED, FLOW_CANCEL, FLOW_STALLED];
}

/// An event before the Event Manager has assigned `id`/`ts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub run_id: Uuid,
    pub flow_name: String,
    pub step_name: Option<String>,
    pub step_id: Option<String>,
    pub attempt: Option<u32>,
    pub data: Option<Value>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, run_id: Uuid, flow_name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            run_id,
            flow_name: flow_name.into(),
            step_name: None,
            step_id: None,
            attempt: None,
            data: None,
        }
    }

    pub fn with_step(mut self, step_name: impl Into<String>, step_id: impl Into<String>, attempt: u32) -> Self {
        self.step_name = Some(step_name.into());
        self.step_id = Some(step_id.into());
        self.attempt = Some(attempt);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// An immutable, persisted event record: `id` is monotonic within its stream,
/// `ts` is ms-since-epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub ts: i64,
    pub event_type: String,
    pub run_id: Uuid,
    pub flow_name: String,
    pub step_name: Option<String>,
    pub step_id: Option<String>,
    pub attempt: Option<u32>,
    pub data: Option<Value>,
}

impl Event {
    pub fn from_new(new: NewEvent, id: String, ts: i64) -> Self {
        Self {
            id,
            ts,
            event_type: new.event_type,
            run_id: new.run_id,
            flow_name: new.flow_name,
            step_name: new.step_name,
            step_id: new.step_id,
            attempt: new.attempt,
            data: new.data,
        }
    }

    pub fn is_terminal_flow_event(&self) -> bool {
        event_types::TERMINAL_FLOW_TYPES.contains(&self.event_type.as_str())
    }

    /// For `emit` events, the user-chosen event name lives under `data.name`.
    pub fn emitted_name(&self) -> Option<&str> {
        if self.event_type != event_types::EMIT {
            return None;
        }
        self.data.as_ref()?.get("name")?.as_str()
    }
}

/// Lexicographically sortable monotonic id generator, one per stream.
///
/// Zero-padded decimal so string order and numeric order agree; mirrors the
/// auto-increment sequencing the relational backend gets from the database
/// and the atomic counter the in-memory backend keeps by hand.
#[derive(Debug, Default)]
pub struct SortableIdGen {
    counter: std::sync::atomic::AtomicU64,
}

impl SortableIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("{n:020}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sortable_ids_increase_lexicographically() {
        let gen = SortableIdGen::new();
        let a = gen.next();
        let b = gen.next();
        assert!(a < b);
    }

    #[test]
    fn emit_event_exposes_name_from_data() {
        let run_id = Uuid::nil();
        let new = NewEvent::new(event_types::EMIT, run_id, "sample")
            .with_data(serde_json::json!({"name": "started.done", "payload": {"x": 1}}));
        let event = Event::from_new(new, "1".into(), 0);
        assert_eq!(event.emitted_name(), Some("started.done"));
    }

    #[test]
    fn terminal_flow_events_are_recognized() {
        let run_id = Uuid::nil();
        let new = NewEvent::new(event_types::FLOW_COMPLETED, run_id, "sample");
        let event = Event::from_new(new, "1".into(), 0);
        assert!(event.is_terminal_flow_event());
    }
}
