//! Hook Registry: `(flowName, stepName) -> {onAwaitRegister, onAwaitResolve,
//! onAwaitTimeout}`. Hooks are plain function values; failures are caught,
//! logged, and never propagate into a step's retry accounting.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

pub type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Hook = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HookContext {
    pub run_id: uuid::Uuid,
    pub flow_name: String,
    pub step_name: String,
    pub position: String,
    pub payload: Value,
}

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub enum HookKind {
    #[default]
    OnAwaitRegister,
    OnAwaitResolve,
    OnAwaitTimeout,
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: parking_lot::RwLock<HashMap<(String, String, &'static str), Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn kind_key(kind: HookKind) -> &'static str {
        match kind {
            HookKind::OnAwaitRegister => "on_await_register",
            HookKind::OnAwaitResolve => "on_await_resolve",
            HookKind::OnAwaitTimeout => "on_await_timeout",
        }
    }

    pub fn register(&self, flow_name: impl Into<String>, step_name: impl Into<String>, kind: HookKind, hook: Hook) {
        self.hooks.write().insert((flow_name.into(), step_name.into(), Self::kind_key(kind)), hook);
    }

    /// Invokes the hook if one is registered; errors are caught by the
    /// closure itself (hooks never return a `Result`), matching the
    /// "failures are caught, logged, never propagate" rule.
    pub async fn invoke(&self, flow_name: &str, step_name: &str, kind: HookKind, ctx: HookContext) {
        let hook = self.hooks.read().get(&(flow_name.to_string(), step_name.to_string(), Self::kind_key(kind))).cloned();
        if let Some(hook) = hook {
            hook(ctx).await;
        } else {
            warn!(flow_name, step_name, kind = Self::kind_key(kind), "no hook registered, skipping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn invokes_registered_hook() {
        let registry = HookRegistry::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        registry.register(
            "sample",
            "start",
            HookKind::OnAwaitRegister,
            Arc::new(move |_ctx| {
                let fired = fired_clone.clone();
                Box::pin(async move {
                    fired.store(true, Ordering::SeqCst);
                })
            }),
        );
        registry
            .invoke(
                "sample",
                "start",
                HookKind::OnAwaitRegister,
                HookContext { run_id: uuid::Uuid::nil(), flow_name: "sample".into(), step_name: "start".into(), position: "before".into(), payload: Value::Null },
            )
            .await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_hook_is_a_silent_no_op() {
        let registry = HookRegistry::new();
        registry
            .invoke(
                "sample",
                "start",
                HookKind::OnAwaitResolve,
                HookContext { run_id: uuid::Uuid::nil(), flow_name: "sample".into(), step_name: "start".into(), position: "before".into(), payload: Value::Null },
            )
            .await;
    }
}
