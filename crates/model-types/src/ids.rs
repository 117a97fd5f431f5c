use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a feature within one model instance.
///
/// Opaque to the engine: any non-empty string works, and freshly created
/// features get a random UUID string. Ids are never reissued within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&FeatureId> for FeatureId {
    fn from(value: &FeatureId) -> Self {
        value.clone()
    }
}

impl AsRef<str> for FeatureId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for FeatureId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Address of a parameter: the owning feature plus the parameter name.
///
/// The textual form is `<feature-id>:<param-name>`, split at the first colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterKey {
    pub feature_id: FeatureId,
    pub name: String,
}

impl ParameterKey {
    pub fn new(feature_id: impl Into<FeatureId>, name: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.into(),
            name: name.into(),
        }
    }

    /// Parse the `feature:name` form. Returns `None` when there is no colon
    /// or either half is empty.
    pub fn parse(text: &str) -> Option<Self> {
        let (feature, name) = text.split_once(':')?;
        if feature.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(feature, name))
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.feature_id, self.name)
    }
}
