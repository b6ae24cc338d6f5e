use serde::{Deserialize, Serialize};

/// Global engine configuration shared across planning and execution layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows per block exchanged between operators. Every block except the
    /// terminal one carries exactly this many rows.
    pub batch_size_rows: usize,

    /// Default number of parallel segments for a materialization.
    /// 0 means "use the CPU count", resolved when a query starts.
    pub num_segments: usize,

    /// Segment count used when writing freshly constructed columns.
    #[serde(default = "default_write_segments")]
    pub write_num_segments: usize,

    /// Once a lazy plan accumulates this many dependency nodes, callers are
    /// advised to materialize eagerly.
    #[serde(default = "default_max_lazy_node_size")]
    pub max_lazy_node_size: usize,

    /// Disable the rule-driven optimizer (debugging aid).
    #[serde(default)]
    pub disable_optimization: bool,
}

fn default_max_lazy_node_size() -> usize {
    10_000
}

fn default_write_segments() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 256,
            num_segments: 0,
            write_num_segments: default_write_segments(),
            max_lazy_node_size: default_max_lazy_node_size(),
            disable_optimization: false,
        }
    }
}
