use serde::{Deserialize, Serialize};

// Re-export shared types from model-types
pub use model_types::{EndCondition, ExtrudeDirection, FeatureId};

/// Opaque handle to a solid owned by the geometry evaluator.
/// Not persisted; valid only for the current evaluator session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SolidHandle(pub u64);

/// Geometry published by a feature after a successful update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    /// Closed planar profile published by a sketch.
    Profile { sketch: FeatureId },
    /// Solid body produced by the evaluator.
    Solid { handle: SolidHandle },
}

impl Geometry {
    pub fn solid_handle(&self) -> Option<SolidHandle> {
        match self {
            Geometry::Solid { handle } => Some(*handle),
            Geometry::Profile { .. } => None,
        }
    }
}

/// Everything the evaluator needs to build an extrusion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtrudeRequest {
    /// The feature being evaluated.
    pub feature_id: FeatureId,
    /// Output of the driving sketch.
    pub profile: Geometry,
    /// Output of the target feature, for up-to end conditions.
    pub target: Option<Geometry>,
    pub depth: f64,
    pub direction: ExtrudeDirection,
    pub end_condition: EndCondition,
    /// Draft angle in degrees.
    pub draft: f64,
    pub thin_walled: bool,
    pub wall_thickness: f64,
}

/// Errors from geometry evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("missing input geometry: {reason}")]
    MissingInput { reason: String },

    #[error("operation not supported: {operation}")]
    NotSupported { operation: String },

    #[error("evaluator error: {message}")]
    Other { message: String },
}
