use serde::{Deserialize, Serialize};

/// Engine tuning knobs. Deserialized from whatever configuration source the
/// host process uses; every field has a serde default so partial configs
/// stay valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on nested expression evaluation, shared across every
    /// task spawned by the same execution.
    #[serde(default = "default_max_eval_depth")]
    pub max_eval_depth: usize,
}

fn default_max_eval_depth() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_eval_depth: default_max_eval_depth(),
        }
    }
}
