use std::collections::{HashMap, HashSet};

use model_types::{FeatureId, FeatureStatus};

use crate::types::{EngineError, Feature};

/// Owning store of feature records, kept in creation order.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    features: HashMap<FeatureId, Feature>,
    order: Vec<FeatureId>,
    /// Every id handed out this session. Ids are never reused.
    issued: HashSet<FeatureId>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &FeatureId) -> bool {
        self.features.contains_key(id)
    }

    /// True if `id` was ever registered, even if since removed.
    pub fn was_issued(&self, id: &FeatureId) -> bool {
        self.issued.contains(id)
    }

    /// Mint an id that has never been used.
    pub fn generate_id(&self) -> FeatureId {
        loop {
            let id = FeatureId::generate();
            if !self.issued.contains(&id) {
                return id;
            }
        }
    }

    /// Append a feature at the end of the order.
    pub fn insert(&mut self, feature: Feature) -> Result<(), EngineError> {
        let position = self.order.len();
        self.insert_at(position, feature)
    }

    /// Insert at `position` (clamped). Used to put a removed feature back.
    pub fn insert_at(&mut self, position: usize, feature: Feature) -> Result<(), EngineError> {
        if self.features.contains_key(&feature.id) {
            return Err(EngineError::DuplicateFeature { id: feature.id });
        }
        let position = position.min(self.order.len());
        self.issued.insert(feature.id.clone());
        self.order.insert(position, feature.id.clone());
        self.features.insert(feature.id.clone(), feature);
        Ok(())
    }

    /// Remove a feature. Returns the record and its position.
    pub fn remove(&mut self, id: &FeatureId) -> Result<(Feature, usize), EngineError> {
        let feature = self
            .features
            .remove(id)
            .ok_or_else(|| EngineError::FeatureNotFound { id: id.clone() })?;
        let position = self.position(id).unwrap_or(self.order.len());
        self.order.retain(|f| f != id);
        Ok((feature, position))
    }

    pub fn get(&self, id: &FeatureId) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn get_mut(&mut self, id: &FeatureId) -> Option<&mut Feature> {
        self.features.get_mut(id)
    }

    /// Lookup that reports a missing id as an error.
    pub fn require(&self, id: &FeatureId) -> Result<&Feature, EngineError> {
        self.get(id)
            .ok_or_else(|| EngineError::FeatureNotFound { id: id.clone() })
    }

    pub fn require_mut(&mut self, id: &FeatureId) -> Result<&mut Feature, EngineError> {
        self.get_mut(id)
            .ok_or_else(|| EngineError::FeatureNotFound { id: id.clone() })
    }

    pub fn position(&self, id: &FeatureId) -> Option<usize> {
        self.order.iter().position(|f| f == id)
    }

    /// Ids in creation order.
    pub fn ids(&self) -> &[FeatureId] {
        &self.order
    }

    /// Features in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.order.iter().filter_map(|id| self.features.get(id))
    }

    /// Rename a feature. Returns the previous name.
    pub fn rename(&mut self, id: &FeatureId, name: impl Into<String>) -> Result<String, EngineError> {
        let feature = self.require_mut(id)?;
        Ok(std::mem::replace(&mut feature.name, name.into()))
    }

    /// Suppress or unsuppress. Returns the status before the change.
    pub fn set_suppressed(
        &mut self,
        id: &FeatureId,
        suppressed: bool,
    ) -> Result<FeatureStatus, EngineError> {
        let feature = self.require_mut(id)?;
        let prior = feature.status;
        if suppressed {
            feature.suppress();
        } else {
            feature.unsuppress();
        }
        Ok(prior)
    }

    pub fn set_status(&mut self, id: &FeatureId, status: FeatureStatus) -> Result<(), EngineError> {
        self.require_mut(id)?.status = status;
        Ok(())
    }
}
