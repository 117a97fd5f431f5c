use std::fmt;

use geometry_eval::Geometry;
use model_types::{
    EndCondition, ExtrudeDirection, FeatureId, FeatureKind, FeatureStatus, ParamType,
    ParameterKey,
};
use serde::{Deserialize, Serialize};

use crate::expression::ExpressionError;
use crate::params::{Bounds, ParameterSpec};

/// Handle returned by every subscription API (parameters, update callbacks,
/// history and active-configuration listeners). Pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(pub u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single node of the parametric model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Unique identifier.
    pub id: FeatureId,
    /// User-visible name.
    pub name: String,
    pub status: FeatureStatus,
    /// Variant-specific definition.
    pub variant: FeatureVariant,
    /// Geometry from the last successful update. Kept when an update fails.
    #[serde(skip)]
    pub output: Option<Geometry>,
    /// Reason for the most recent failed update.
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl Feature {
    /// A new feature starts out `Invalid` until its first update.
    pub fn new(id: FeatureId, name: impl Into<String>, variant: FeatureVariant) -> Self {
        Self {
            id,
            name: name.into(),
            status: FeatureStatus::Invalid,
            variant,
            output: None,
            last_error: None,
        }
    }

    pub fn kind(&self) -> FeatureKind {
        self.variant.kind()
    }

    pub fn is_valid(&self) -> bool {
        self.status == FeatureStatus::Valid
    }

    pub fn is_suppressed(&self) -> bool {
        self.status == FeatureStatus::Suppressed
    }

    pub fn suppress(&mut self) {
        self.status = FeatureStatus::Suppressed;
    }

    /// Unsuppressing puts the feature back in line for evaluation.
    pub fn unsuppress(&mut self) {
        if self.status == FeatureStatus::Suppressed {
            self.status = FeatureStatus::Invalid;
        }
    }
}

/// The closed set of feature variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeatureVariant {
    /// A 2D sketch. No parameters, no dependencies.
    Sketch,
    Extrusion(ExtrusionState),
}

impl FeatureVariant {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureVariant::Sketch => FeatureKind::Sketch,
            FeatureVariant::Extrusion(_) => FeatureKind::Extrusion,
        }
    }

    /// Dependencies implied by the definition itself.
    pub fn intrinsic_dependencies(&self) -> Vec<FeatureId> {
        match self {
            FeatureVariant::Sketch => Vec::new(),
            FeatureVariant::Extrusion(state) => {
                let mut deps = vec![state.sketch_id.clone()];
                if let Some(target) = &state.target_id {
                    if target != &state.sketch_id {
                        deps.push(target.clone());
                    }
                }
                deps
            }
        }
    }

    /// Parameters registered with the store when a feature of this variant is created.
    pub fn parameter_specs(&self) -> Vec<ParameterSpec> {
        match self {
            FeatureVariant::Sketch => Vec::new(),
            FeatureVariant::Extrusion(state) => state.parameter_specs(),
        }
    }
}

/// Parameter names owned by an extrusion.
pub mod extrusion_params {
    pub const DEPTH: &str = "depth";
    pub const DIRECTION: &str = "direction";
    pub const END_CONDITION: &str = "endCondition";
    pub const DRAFT: &str = "draft";
    pub const THIN_WALLED: &str = "thinWalled";
    pub const WALL_THICKNESS: &str = "wallThickness";
}

/// Definition of an extrusion feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionState {
    /// The driving sketch. Always a dependency.
    pub sketch_id: FeatureId,
    pub direction: ExtrudeDirection,
    pub end_condition: EndCondition,
    /// Target for the up-to end conditions.
    pub target_id: Option<FeatureId>,
}

impl ExtrusionState {
    pub fn new(sketch_id: FeatureId) -> Self {
        Self {
            sketch_id,
            direction: ExtrudeDirection::Normal,
            end_condition: EndCondition::Blind,
            target_id: None,
        }
    }

    pub fn parameter_specs(&self) -> Vec<ParameterSpec> {
        use extrusion_params::*;
        vec![
            ParameterSpec::new(DEPTH, 10.0, ParamType::Length, Bounds::none().with_min(0.0)),
            ParameterSpec::new(
                DIRECTION,
                self.direction.index() as f64,
                ParamType::Count,
                Bounds::range(0.0, ExtrudeDirection::MAX_INDEX as f64).with_step(1.0),
            ),
            ParameterSpec::new(
                END_CONDITION,
                self.end_condition.index() as f64,
                ParamType::Count,
                Bounds::range(0.0, EndCondition::MAX_INDEX as f64).with_step(1.0),
            ),
            ParameterSpec::new(
                DRAFT,
                0.0,
                ParamType::Angle,
                Bounds::range(-90.0, 90.0).with_step(1.0),
            ),
            ParameterSpec::new(THIN_WALLED, 0.0, ParamType::Boolean, Bounds::none()),
            ParameterSpec::new(
                WALL_THICKNESS,
                1.0,
                ParamType::Length,
                Bounds::none().with_min(0.0),
            ),
        ]
    }
}

/// Result of asking one feature to re-derive its geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Valid,
    Failed { reason: String },
    /// Suppressed features are not evaluated.
    Skipped,
    /// The graph knows the id but the registry has no record for it.
    Missing,
}

/// What happened during one update cascade, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReport {
    /// Every feature that was evaluated, successful or not.
    pub evaluated: Vec<FeatureId>,
    pub failed: Vec<(FeatureId, String)>,
    pub skipped: Vec<FeatureId>,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// How many times `id` was evaluated in this cascade.
    pub fn evaluation_count(&self, id: &FeatureId) -> usize {
        self.evaluated.iter().filter(|e| *e == id).count()
    }

    pub fn position(&self, id: &FeatureId) -> Option<usize> {
        self.evaluated.iter().position(|e| e == id)
    }

    pub(crate) fn record(&mut self, id: &FeatureId, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Valid => self.evaluated.push(id.clone()),
            UpdateOutcome::Failed { reason } => {
                self.evaluated.push(id.clone());
                self.failed.push((id.clone(), reason));
            }
            UpdateOutcome::Skipped => self.skipped.push(id.clone()),
            UpdateOutcome::Missing => self
                .failed
                .push((id.clone(), "feature record missing".to_string())),
        }
    }

    pub fn merge(&mut self, other: UpdateReport) {
        self.evaluated.extend(other.evaluated);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
    }
}

/// Outcome of applying a configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Keys whose stored value changed, in key order.
    pub written: Vec<ParameterKey>,
    /// Keys left alone because the store does not have them or refused the value.
    pub rejected: Vec<(ParameterKey, String)>,
    pub update: UpdateReport,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty() && self.update.is_success()
    }
}

/// Error categories shared by every engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    ConstraintViolation,
    ParseFailure,
    EvaluationFailure,
    PreconditionFailure,
    Io,
}

/// Errors from the feature engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("feature not found: {id}")]
    FeatureNotFound { id: FeatureId },

    #[error("parameter not found: {key}")]
    ParameterNotFound { key: ParameterKey },

    #[error("configuration not found: {name}")]
    ConfigurationNotFound { name: String },

    #[error("dependency not found: {dependent} -> {dependency}")]
    DependencyNotFound {
        dependent: FeatureId,
        dependency: FeatureId,
    },

    #[error("callback not found: {id}")]
    CallbackNotFound { id: CallbackId },

    #[error("design table has no {entry}")]
    TableEntryNotFound { entry: String },

    #[error("feature already exists: {id}")]
    DuplicateFeature { id: FeatureId },

    #[error("parameter already exists: {key}")]
    DuplicateParameter { key: ParameterKey },

    #[error("configuration already exists: {name}")]
    DuplicateConfiguration { name: String },

    #[error("design table already has {entry}")]
    DuplicateTableEntry { entry: String },

    #[error("value {value} for {key} is outside [{min:?}, {max:?}]")]
    OutOfRange {
        key: ParameterKey,
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },

    #[error("value for {key} is not a finite number")]
    NotFinite { key: ParameterKey },

    #[error("dependency {dependent} -> {dependency} would create a cycle")]
    CycleDetected {
        dependent: FeatureId,
        dependency: FeatureId,
    },

    #[error("expression for {key} failed: {source}")]
    Expression {
        key: ParameterKey,
        #[source]
        source: ExpressionError,
    },

    #[error("parse error: {reason}")]
    Parse { reason: String },

    #[error("update of {id} failed: {reason}")]
    EvaluationFailed { id: FeatureId, reason: String },

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("precondition failed: {reason}")]
    Precondition { reason: String },

    #[error("io error: {reason}")]
    Io { reason: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::FeatureNotFound { .. }
            | EngineError::ParameterNotFound { .. }
            | EngineError::ConfigurationNotFound { .. }
            | EngineError::DependencyNotFound { .. }
            | EngineError::CallbackNotFound { .. }
            | EngineError::TableEntryNotFound { .. } => ErrorKind::NotFound,
            EngineError::DuplicateFeature { .. }
            | EngineError::DuplicateParameter { .. }
            | EngineError::DuplicateConfiguration { .. }
            | EngineError::DuplicateTableEntry { .. } => ErrorKind::Duplicate,
            EngineError::OutOfRange { .. }
            | EngineError::NotFinite { .. }
            | EngineError::CycleDetected { .. } => ErrorKind::ConstraintViolation,
            EngineError::Expression { source, .. } => match source {
                ExpressionError::CircularReference { .. }
                | ExpressionError::UnknownReference { .. }
                | ExpressionError::DivisionByZero
                | ExpressionError::NotFinite => ErrorKind::EvaluationFailure,
                _ => ErrorKind::ParseFailure,
            },
            EngineError::Parse { .. } => ErrorKind::ParseFailure,
            EngineError::EvaluationFailed { .. } => ErrorKind::EvaluationFailure,
            EngineError::NothingToUndo
            | EngineError::NothingToRedo
            | EngineError::Precondition { .. } => ErrorKind::PreconditionFailure,
            EngineError::Io { .. } => ErrorKind::Io,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extrusion_declares_six_parameters() {
        let state = ExtrusionState::new(FeatureId::new("sketch1"));
        let names: Vec<_> = state.parameter_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            ["depth", "direction", "endCondition", "draft", "thinWalled", "wallThickness"]
        );
    }

    #[test]
    fn extrusion_target_becomes_intrinsic_dependency() {
        let mut state = ExtrusionState::new(FeatureId::new("sketch1"));
        state.target_id = Some(FeatureId::new("body"));
        let variant = FeatureVariant::Extrusion(state);
        assert_eq!(
            variant.intrinsic_dependencies(),
            vec![FeatureId::new("sketch1"), FeatureId::new("body")]
        );
        assert!(FeatureVariant::Sketch.intrinsic_dependencies().is_empty());
    }

    #[test]
    fn unsuppress_only_leaves_suppressed_state() {
        let mut f = Feature::new(FeatureId::new("s"), "S", FeatureVariant::Sketch);
        f.status = FeatureStatus::Valid;
        f.unsuppress();
        assert_eq!(f.status, FeatureStatus::Valid);
        f.suppress();
        f.unsuppress();
        assert_eq!(f.status, FeatureStatus::Invalid);
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        let cycle = EngineError::CycleDetected {
            dependent: FeatureId::new("a"),
            dependency: FeatureId::new("b"),
        };
        assert_eq!(cycle.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(EngineError::NothingToUndo.kind(), ErrorKind::PreconditionFailure);
        let missing = EngineError::FeatureNotFound {
            id: FeatureId::new("x"),
        };
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn report_tracks_failures_and_skips() {
        let mut report = UpdateReport::default();
        let a = FeatureId::new("a");
        let b = FeatureId::new("b");
        report.record(&a, UpdateOutcome::Valid);
        report.record(&b, UpdateOutcome::Failed { reason: "boom".into() });
        report.record(&FeatureId::new("c"), UpdateOutcome::Skipped);
        assert!(!report.is_success());
        assert_eq!(report.position(&b), Some(1));
        assert_eq!(report.evaluation_count(&a), 1);
        assert_eq!(report.skipped.len(), 1);
    }
}
