use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_EVALUATIONS_PER_CYCLE: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Evaluations after which a change cycle is abandoned as unstable
    #[serde(default = "default_max_evaluations")]
    pub max_evaluations_per_cycle: u64,

    /// Record eval and inform timings per node
    #[serde(default)]
    pub profile: bool,

    /// Look for deferral cycles when a cycle stalls with deferred nodes left
    #[serde(default = "default_true")]
    pub detect_cycles_on_stall: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_evaluations_per_cycle: default_max_evaluations(),
            profile: false,
            detect_cycles_on_stall: default_true(),
        }
    }
}

fn default_max_evaluations() -> u64 {
    DEFAULT_MAX_EVALUATIONS_PER_CYCLE
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn with_max_evaluations(mut self, max: u64) -> Self {
        self.max_evaluations_per_cycle = max;
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"profile": true}"#).unwrap();
        assert!(config.profile);
        assert!(config.detect_cycles_on_stall);
        assert_eq!(config.max_evaluations_per_cycle, DEFAULT_MAX_EVALUATIONS_PER_CYCLE);
    }
}
