use serde::{Deserialize, Serialize};

/// Semantic type of a scalar parameter. Drives write coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParamType {
    /// Length (mm).
    Length,
    /// Angle (degrees).
    Angle,
    /// Integer count. Stored rounded half away from zero.
    Count,
    /// Percentage, bounded to [0, 100] unless explicit bounds are given.
    Percentage,
    /// Stored as 0.0 or 1.0.
    Boolean,
    Custom,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Length => "Length",
            ParamType::Angle => "Angle",
            ParamType::Count => "Count",
            ParamType::Percentage => "Percentage",
            ParamType::Boolean => "Boolean",
            ParamType::Custom => "Custom",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Length" => Some(ParamType::Length),
            "Angle" => Some(ParamType::Angle),
            "Count" => Some(ParamType::Count),
            "Percentage" => Some(ParamType::Percentage),
            "Boolean" => Some(ParamType::Boolean),
            "Custom" => Some(ParamType::Custom),
            _ => None,
        }
    }
}

/// Lifecycle status of a feature.
///
/// The integer codes are part of the feature text format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeatureStatus {
    /// Evaluated and up to date.
    Valid,
    /// Needs evaluation.
    Invalid,
    /// Excluded from evaluation; definition preserved.
    Suppressed,
    /// Last evaluation failed.
    Error,
}

impl FeatureStatus {
    pub fn code(self) -> i32 {
        match self {
            FeatureStatus::Valid => 0,
            FeatureStatus::Invalid => 1,
            FeatureStatus::Suppressed => 2,
            FeatureStatus::Error => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(FeatureStatus::Valid),
            1 => Some(FeatureStatus::Invalid),
            2 => Some(FeatureStatus::Suppressed),
            3 => Some(FeatureStatus::Error),
            _ => None,
        }
    }
}

/// Discriminator for the closed set of feature variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeatureKind {
    Sketch,
    Extrusion,
}

impl FeatureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureKind::Sketch => "Sketch",
            FeatureKind::Extrusion => "Extrusion",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Sketch" => Some(FeatureKind::Sketch),
            "Extrusion" => Some(FeatureKind::Extrusion),
            _ => None,
        }
    }
}

/// Which way an extrusion grows from its sketch plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExtrudeDirection {
    #[default]
    Normal,
    Reverse,
    Symmetric,
    Custom,
}

impl ExtrudeDirection {
    pub const MAX_INDEX: i64 = 3;

    pub fn index(self) -> i64 {
        match self {
            ExtrudeDirection::Normal => 0,
            ExtrudeDirection::Reverse => 1,
            ExtrudeDirection::Symmetric => 2,
            ExtrudeDirection::Custom => 3,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(ExtrudeDirection::Normal),
            1 => Some(ExtrudeDirection::Reverse),
            2 => Some(ExtrudeDirection::Symmetric),
            3 => Some(ExtrudeDirection::Custom),
            _ => None,
        }
    }
}

/// How far an extrusion goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EndCondition {
    /// A fixed depth.
    #[default]
    Blind,
    ThroughAll,
    UpToSurface,
    UpToBody,
    UpToVertex,
}

impl EndCondition {
    pub const MAX_INDEX: i64 = 4;

    pub fn index(self) -> i64 {
        match self {
            EndCondition::Blind => 0,
            EndCondition::ThroughAll => 1,
            EndCondition::UpToSurface => 2,
            EndCondition::UpToBody => 3,
            EndCondition::UpToVertex => 4,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(EndCondition::Blind),
            1 => Some(EndCondition::ThroughAll),
            2 => Some(EndCondition::UpToSurface),
            3 => Some(EndCondition::UpToBody),
            4 => Some(EndCondition::UpToVertex),
            _ => None,
        }
    }

    /// Up-to end conditions read geometry from a target feature.
    pub fn requires_target(self) -> bool {
        matches!(
            self,
            EndCondition::UpToSurface | EndCondition::UpToBody | EndCondition::UpToVertex
        )
    }
}
