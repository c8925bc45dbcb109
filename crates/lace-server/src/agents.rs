use dashmap::DashMap;
use lace_core::ids::ThreadId;
use tokio_util::sync::CancellationToken;

/// In-flight agent responses that can be stopped from the HTTP API.
#[derive(Default)]
pub struct AgentRuns {
    runs: DashMap<ThreadId, CancellationToken>,
}

impl AgentRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new response for `agent_id`. A run already in flight for the
    /// same agent is cancelled first.
    pub fn begin(&self, agent_id: ThreadId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.runs.insert(agent_id.clone(), token.clone()) {
            previous.cancel();
            tracing::debug!(agent_id = %agent_id, "Superseded in-flight agent run");
        }
        token
    }

    /// Forget a run that completed on its own.
    pub fn finish(&self, agent_id: &ThreadId) {
        self.runs.remove(agent_id);
    }

    /// Cancel the in-flight run, if any. Returns whether one was stopped.
    pub fn stop(&self, agent_id: &ThreadId) -> bool {
        match self.runs.remove(agent_id) {
            Some((_, token)) => {
                token.cancel();
                tracing::info!(agent_id = %agent_id, "Agent run stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, agent_id: &ThreadId) -> bool {
        self.runs.contains_key(agent_id)
    }

    pub fn running_count(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_cancels_token() {
        let runs = AgentRuns::new();
        let agent = ThreadId::from_raw("s1.1");
        let token = runs.begin(agent.clone());

        assert!(runs.is_running(&agent));
        assert!(runs.stop(&agent));
        assert!(token.is_cancelled());
        assert!(!runs.is_running(&agent));
    }

    #[test]
    fn stop_unknown_agent_is_false() {
        let runs = AgentRuns::new();
        assert!(!runs.stop(&ThreadId::from_raw("s1.9")));
    }

    #[test]
    fn finish_removes_without_cancelling() {
        let runs = AgentRuns::new();
        let agent = ThreadId::from_raw("s1.1");
        let token = runs.begin(agent.clone());

        runs.finish(&agent);
        assert!(!token.is_cancelled());
        assert!(!runs.stop(&agent));
    }

    #[test]
    fn begin_supersedes_previous_run() {
        let runs = AgentRuns::new();
        let agent = ThreadId::from_raw("s1.1");
        let first = runs.begin(agent.clone());
        let second = runs.begin(agent.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(runs.running_count(), 1);
    }
}
