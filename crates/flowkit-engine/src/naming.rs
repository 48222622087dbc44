//! Subject/topic/index naming, all under a configurable prefix `P`.

pub fn run_stream(prefix: &str, run_id: uuid::Uuid) -> String {
    format!("{prefix}:flow:run:{run_id}")
}

pub fn trigger_stream(prefix: &str, trigger_name: &str) -> String {
    format!("{prefix}:trigger:event:{trigger_name}")
}

pub fn flow_runs_index(prefix: &str, flow_name: &str) -> String {
    format!("{prefix}:flow:runs:{flow_name}")
}

pub fn flows_index(prefix: &str) -> String {
    format!("{prefix}:flows")
}

pub fn triggers_index(prefix: &str) -> String {
    format!("{prefix}:triggers")
}

pub fn scheduler_jobs_index(prefix: &str) -> String {
    format!("{prefix}:scheduler:jobs")
}

pub fn flow_events_topic(prefix: &str, run_id: uuid::Uuid) -> String {
    format!("{prefix}:stream:flow:events:{run_id}")
}

pub fn flow_stats_topic(prefix: &str) -> String {
    format!("{prefix}:stream:flow:stats")
}

pub fn trigger_events_topic(prefix: &str, trigger_name: &str) -> String {
    format!("{prefix}:stream:trigger:events:{trigger_name}")
}

pub fn trigger_stats_topic(prefix: &str) -> String {
    format!("{prefix}:stream:trigger:stats")
}

/// Internal queue carrying delayed await resume/timeout jobs (time and
/// schedule flavors); the Runner claims from this queue alongside user step
/// queues and dispatches to `AwaitSubsystem::handle_resume_job`.
pub fn await_resume_queue(prefix: &str) -> String {
    format!("{prefix}:await:resume")
}

pub fn await_token_key(run_id: uuid::Uuid, step_name: &str, position: &str) -> String {
    format!("await:token:{run_id}:{step_name}:{position}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_are_stable() {
        let run_id = uuid::Uuid::nil();
        assert_eq!(run_stream("flowkit", run_id), format!("flowkit:flow:run:{run_id}"));
        assert_eq!(flows_index("flowkit"), "flowkit:flows");
    }
}
