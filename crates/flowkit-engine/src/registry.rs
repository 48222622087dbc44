//! Registry of analyzed [`FlowDef`]s: the source of truth the Runner and
//! Projection Wiring consult to resolve step metadata and subscriber fan-out.

use std::collections::BTreeMap;

use flowkit_core::flow::{FlowDef, FlowDefError, StepDef};

#[derive(Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, FlowDef>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the flow before registering; a flow with a broken
    /// subscribe/emit graph is rejected rather than silently accepted.
    pub fn register(&mut self, flow: FlowDef) -> Result<(), FlowDefError> {
        flow.validate()?;
        self.flows.insert(flow.flow_name.clone(), flow);
        Ok(())
    }

    pub fn get(&self, flow_name: &str) -> Option<&FlowDef> {
        self.flows.get(flow_name)
    }

    pub fn step(&self, flow_name: &str, step_name: &str) -> Option<&StepDef> {
        self.flows.get(flow_name)?.steps.get(step_name)
    }

    pub fn entry_step(&self, flow_name: &str) -> Option<&StepDef> {
        Some(self.flows.get(flow_name)?.entry_step())
    }

    /// Steps in `flow_name` whose `subscribes` contains `event_name`.
    pub fn subscribers_of<'a>(&'a self, flow_name: &str, event_name: &'a str) -> Vec<&'a StepDef> {
        let Some(flow) = self.flows.get(flow_name) else { return vec![] };
        flow.subscribers_of(event_name).collect()
    }

    pub fn flow_names(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(|s| s.as_str())
    }

    pub fn flows(&self) -> impl Iterator<Item = &FlowDef> {
        self.flows.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit_core::flow::StepDef;

    fn sample_flow() -> FlowDef {
        let entry = StepDef::new("sample", "start").emitting("started.done");
        let next = StepDef::new("sample", "next").subscribing_to("started.done");
        FlowDef::new("sample", entry).with_step(next)
    }

    #[test]
    fn register_and_lookup_round_trip() {
        let mut registry = FlowRegistry::new();
        registry.register(sample_flow()).unwrap();
        assert!(registry.get("sample").is_some());
        assert_eq!(registry.entry_step("sample").unwrap().step_name, "start");
        let subs = registry.subscribers_of("sample", "started.done");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].step_name, "next");
    }

    #[test]
    fn rejects_invalid_flow() {
        let mut registry = FlowRegistry::new();
        let broken = StepDef::new("sample", "start").subscribing_to("oops");
        let flow = FlowDef::new("sample", broken);
        assert!(registry.register(flow).is_err());
    }
}
