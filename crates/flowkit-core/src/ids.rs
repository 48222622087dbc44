//! Identifier helpers for runs, step executions, and idempotent job keys.

use uuid::Uuid;

/// Mint a new run identifier.
///
/// Run ids are 128 bits of randomness, not time-ordered — unlike the
/// internal storage row ids, a `runId` leaking its creation order is not a
/// property callers should depend on.
pub fn new_run_id() -> Uuid {
    Uuid::new_v4()
}

/// `stepId = "{runId}__{stepName}__attempt-{n}"`
pub fn step_id(run_id: Uuid, step_name: &str, attempt: u32) -> String {
    format!("{run_id}__{step_name}__attempt-{attempt}")
}

/// Idempotent job key for a step enqueue: `"{runId}__{stepName}"`.
///
/// Re-using this as the queue's `jobId` is what collapses duplicate
/// enqueues from retries or out-of-order emits into a single execution.
pub fn step_job_id(run_id: Uuid, step_name: &str) -> String {
    format!("{run_id}__{step_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_id_format() {
        let run_id = Uuid::nil();
        assert_eq!(
            step_id(run_id, "start", 2),
            "00000000-0000-0000-0000-000000000000__start__attempt-2"
        );
    }

    #[test]
    fn job_id_is_stable_across_attempts() {
        let run_id = new_run_id();
        assert_eq!(step_job_id(run_id, "next"), step_job_id(run_id, "next"));
    }
}
