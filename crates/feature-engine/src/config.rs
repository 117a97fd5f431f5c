use serde::{Deserialize, Serialize};

use crate::params::VALUE_TOLERANCE;

/// Construction-time settings for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Parameter writes closer than this to the stored value are no-ops.
    pub value_tolerance: f64,
    /// Configuration `(name, description)` created with the engine.
    pub default_configuration: Option<(String, String)>,
    /// Maximum number of recorded operations. `None` keeps everything.
    pub history_limit: Option<usize>,
    /// When false, mutations run but are not recorded for undo.
    pub record_history: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            value_tolerance: VALUE_TOLERANCE,
            default_configuration: Some(("Default".into(), "Default configuration".into())),
            history_limit: None,
            record_history: true,
        }
    }
}

impl EngineConfig {
    /// No seeded configuration and no history.
    pub fn bare() -> Self {
        Self {
            default_configuration: None,
            record_history: false,
            ..Self::default()
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.value_tolerance = tolerance;
        self
    }

    pub fn without_default_configuration(mut self) -> Self {
        self.default_configuration = None;
        self
    }
}
