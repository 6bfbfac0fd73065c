use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tunables. Every field has a default so partial TOML tables load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for agent and api steps without `timeout_seconds`
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Upper bound of the exponential retry backoff
    #[serde(default = "default_retry_backoff_cap_secs")]
    pub retry_backoff_cap_secs: u64,

    /// Loop iteration cap when a loop sets no `max_iterations`
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: usize,

    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Lifetime of execution snapshots in the state cache
    #[serde(default = "default_state_cache_ttl_secs")]
    pub state_cache_ttl_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_retry_backoff_cap_secs() -> u64 {
    10
}

fn default_max_iterations() -> usize {
    100
}

fn default_max_sub_workflow_depth() -> u32 {
    8
}

fn default_state_cache_ttl_secs() -> u64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            retry_backoff_cap_secs: default_retry_backoff_cap_secs(),
            default_max_iterations: default_max_iterations(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            state_cache_ttl_secs: default_state_cache_ttl_secs(),
        }
    }
}

impl EngineConfig {
    pub fn state_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.state_cache_ttl_secs)
    }

    /// Delay before retry number `attempt` (1-based): `min(2^(attempt-1), cap)` seconds
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let secs = 2_u64.saturating_pow(exp).min(self.retry_backoff_cap_secs);
        Duration::from_secs(secs)
    }
}
