//! Flow and step definitions — the static declaration a user registers.
//!
//! These are pure data: building the analyzed DAG (step levels, subscribe/emit
//! wiring) is a function over a [`FlowDef`], not a method that mutates it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the four suspension flavors a step can declare before/after its handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AwaitSpec {
    Time {
        delay_ms: u64,
    },
    Event {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Webhook {
        path: String,
        method: String,
    },
    Schedule {
        cron: String,
        #[serde(default)]
        once: bool,
    },
}

impl AwaitSpec {
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            AwaitSpec::Event { timeout_ms, .. } => *timeout_ms,
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            AwaitSpec::Time { .. } => "time",
            AwaitSpec::Event { .. } => "event",
            AwaitSpec::Webhook { .. } => "webhook",
            AwaitSpec::Schedule { .. } => "schedule",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Fixed, delay_ms }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Exponential, delay_ms }
    }

    /// `backoff.delayMs * (backoff.type=='exponential' ? 2^attemptsMade : 1)`
    pub fn delay_for_attempt(&self, attempts_made: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => self.delay_ms.saturating_mul(1u64 << attempts_made.min(32)),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(1000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefaults {
    pub attempts: u32,
    pub backoff: Backoff,
    pub priority: i32,
    pub timeout_ms: Option<u64>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::default(),
            priority: 0,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub autorun: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { concurrency: 1, autorun: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDef {
    pub flow_name: String,
    pub step_name: String,
    pub subscribes: BTreeSet<String>,
    pub emits: BTreeSet<String>,
    pub await_before: Option<AwaitSpec>,
    pub await_after: Option<AwaitSpec>,
    pub queue_name: String,
    pub worker: WorkerOptions,
    pub job_defaults: JobDefaults,
}

impl StepDef {
    pub fn new(flow_name: impl Into<String>, step_name: impl Into<String>) -> Self {
        let flow_name = flow_name.into();
        let step_name = step_name.into();
        Self {
            queue_name: format!("{flow_name}:{step_name}"),
            flow_name,
            step_name,
            subscribes: BTreeSet::new(),
            emits: BTreeSet::new(),
            await_before: None,
            await_after: None,
            worker: WorkerOptions::default(),
            job_defaults: JobDefaults::default(),
        }
    }

    pub fn subscribing_to(mut self, event: impl Into<String>) -> Self {
        self.subscribes.insert(event.into());
        self
    }

    pub fn emitting(mut self, event: impl Into<String>) -> Self {
        self.emits.insert(event.into());
        self
    }

    pub fn with_await_before(mut self, spec: AwaitSpec) -> Self {
        self.await_before = Some(spec);
        self
    }

    pub fn with_await_after(mut self, spec: AwaitSpec) -> Self {
        self.await_after = Some(spec);
        self
    }

    pub fn with_job_defaults(mut self, defaults: JobDefaults) -> Self {
        self.job_defaults = defaults;
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlowDefError {
    #[error("flow '{0}' has no entry step '{1}' registered")]
    MissingEntry(String, String),
    #[error("entry step '{0}' must not subscribe to any event")]
    EntrySubscribes(String),
    #[error("step '{step}' subscribes to '{event}' but no step in flow '{flow}' emits it")]
    DanglingSubscription { flow: String, step: String, event: String },
    #[error("flow '{0}' contains a cycle reachable from its entry step")]
    Cycle(String),
}

/// A named DAG of steps with one entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDef {
    pub flow_name: String,
    pub entry: String,
    pub steps: BTreeMap<String, StepDef>,
}

impl FlowDef {
    pub fn new(flow_name: impl Into<String>, entry: StepDef) -> Self {
        let flow_name = flow_name.into();
        let entry_name = entry.step_name.clone();
        let mut steps = BTreeMap::new();
        steps.insert(entry_name.clone(), entry);
        Self { flow_name, entry: entry_name, steps }
    }

    pub fn with_step(mut self, step: StepDef) -> Self {
        self.steps.insert(step.step_name.clone(), step);
        self
    }

    pub fn entry_step(&self) -> &StepDef {
        self.steps.get(&self.entry).expect("entry step always present by construction")
    }

    /// Validates the two invariants in §3: the entry step subscribes to
    /// nothing, and every other step's subscriptions are produced by some
    /// `emits` set within the same flow.
    pub fn validate(&self) -> Result<(), FlowDefError> {
        if !self.steps.contains_key(&self.entry) {
            return Err(FlowDefError::MissingEntry(self.flow_name.clone(), self.entry.clone()));
        }
        let entry = self.entry_step();
        if !entry.subscribes.is_empty() {
            return Err(FlowDefError::EntrySubscribes(entry.step_name.clone()));
        }

        let produced: BTreeSet<&str> = self.steps.values().flat_map(|s| s.emits.iter().map(String::as_str)).collect();
        for step in self.steps.values() {
            if step.step_name == self.entry {
                continue;
            }
            for event in &step.subscribes {
                if !produced.contains(event.as_str()) {
                    return Err(FlowDefError::DanglingSubscription {
                        flow: self.flow_name.clone(),
                        step: step.step_name.clone(),
                        event: event.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Steps whose `subscribes` set contains the given emitted event name.
    pub fn subscribers_of<'a>(&'a self, event: &str) -> impl Iterator<Item = &'a StepDef> {
        self.steps.values().filter(move |s| s.subscribes.contains(event))
    }

    /// Steps with no further downstream work: every event they emit (if any)
    /// has no subscriber in this flow. A step with an empty `emits` set is
    /// vacuously terminal. A run is done once every terminal step has
    /// completed and no awaits remain pending.
    pub fn terminal_steps(&self) -> BTreeSet<&str> {
        self.steps
            .values()
            .filter(|step| step.emits.iter().all(|event| self.subscribers_of(event).next().is_none()))
            .map(|step| step.step_name.as_str())
            .collect()
    }

    /// Longest-path-from-entry level per step (entry is level 0), computed by
    /// repeated relaxation over the subscribes/emits edges.
    pub fn levels(&self) -> BTreeMap<String, u32> {
        let mut levels: BTreeMap<String, u32> = BTreeMap::new();
        levels.insert(self.entry.clone(), 0);
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(self.entry.clone());

        while let Some(name) = queue.pop_front() {
            let Some(step) = self.steps.get(&name) else { continue };
            let level = levels[&name];
            for emitted in &step.emits {
                for dependent in self.subscribers_of(emitted) {
                    let next_level = level + 1;
                    let improved = match levels.get(&dependent.step_name) {
                        Some(existing) => next_level > *existing,
                        None => true,
                    };
                    if improved {
                        levels.insert(dependent.step_name.clone(), next_level);
                        queue.push_back(dependent.step_name.clone());
                    }
                }
            }
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_flow() -> FlowDef {
        let entry = StepDef::new("sample", "start").emitting("started.done");
        let next = StepDef::new("sample", "next").subscribing_to("started.done");
        FlowDef::new("sample", entry).with_step(next)
    }

    #[test]
    fn validates_clean_flow() {
        assert!(sample_flow().validate().is_ok());
    }

    #[test]
    fn rejects_entry_with_subscription() {
        let bad_entry = StepDef::new("sample", "start").subscribing_to("oops");
        let flow = FlowDef::new("sample", bad_entry);
        assert_eq!(flow.validate(), Err(FlowDefError::EntrySubscribes("start".into())));
    }

    #[test]
    fn rejects_dangling_subscription() {
        let entry = StepDef::new("sample", "start");
        let orphan = StepDef::new("sample", "orphan").subscribing_to("never.emitted");
        let flow = FlowDef::new("sample", entry).with_step(orphan);
        assert!(matches!(flow.validate(), Err(FlowDefError::DanglingSubscription { .. })));
    }

    #[test]
    fn computes_levels() {
        let levels = sample_flow().levels();
        assert_eq!(levels["start"], 0);
        assert_eq!(levels["next"], 1);
    }

    #[test]
    fn terminal_steps_are_leaves_of_the_emit_graph() {
        let flow = sample_flow();
        assert_eq!(flow.terminal_steps(), BTreeSet::from(["next"]));
    }

    #[test]
    fn single_step_flow_is_its_own_terminal_step() {
        let entry = StepDef::new("sample", "start");
        let flow = FlowDef::new("sample", entry);
        assert_eq!(flow.terminal_steps(), BTreeSet::from(["start"]));
    }

    #[test]
    fn emitting_to_nothing_still_counts_as_terminal() {
        let entry = StepDef::new("sample", "start").emitting("nobody.listens");
        let flow = FlowDef::new("sample", entry);
        assert_eq!(flow.terminal_steps(), BTreeSet::from(["start"]));
    }

    #[test]
    fn backoff_delay_math() {
        let fixed = Backoff::fixed(100);
        assert_eq!(fixed.delay_for_attempt(0), 100);
        assert_eq!(fixed.delay_for_attempt(3), 100);

        let exp = Backoff::exponential(100);
        assert_eq!(exp.delay_for_attempt(0), 100);
        assert_eq!(exp.delay_for_attempt(1), 200);
        assert_eq!(exp.delay_for_attempt(2), 400);
    }
}
