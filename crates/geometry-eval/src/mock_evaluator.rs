//! MockEvaluator — deterministic test double implementing GeometryEvaluator.
//!
//! Hands out sequential solid handles, records every request it accepted,
//! and rejects the same inputs a real back end would choke on.
//! Used by feature-engine for unit and integration testing.

use std::collections::HashSet;

use crate::traits::GeometryEvaluator;
use crate::types::*;

/// Deterministic test double for the geometry evaluator.
#[derive(Debug)]
pub struct MockEvaluator {
    next_handle: u64,
    requests: Vec<ExtrudeRequest>,
    /// Features whose evaluation is forced to fail.
    failing: HashSet<FeatureId>,
}

impl MockEvaluator {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            requests: Vec::new(),
            failing: HashSet::new(),
        }
    }

    /// Make every subsequent evaluation of `feature_id` fail.
    pub fn fail_feature(&mut self, feature_id: impl Into<FeatureId>) {
        self.failing.insert(feature_id.into());
    }

    pub fn clear_failures(&mut self) {
        self.failing.clear();
    }

    /// Requests that produced a solid, in call order.
    pub fn requests(&self) -> &[ExtrudeRequest] {
        &self.requests
    }

    /// Number of successful extrusions for one feature.
    pub fn extrude_count(&self, feature_id: &FeatureId) -> usize {
        self.requests
            .iter()
            .filter(|r| &r.feature_id == feature_id)
            .count()
    }

    /// The last accepted request for a feature.
    pub fn last_request(&self, feature_id: &FeatureId) -> Option<&ExtrudeRequest> {
        self.requests.iter().rev().find(|r| &r.feature_id == feature_id)
    }

    fn alloc_handle(&mut self) -> SolidHandle {
        let h = SolidHandle(self.next_handle);
        self.next_handle += 1;
        h
    }
}

impl Default for MockEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryEvaluator for MockEvaluator {
    fn extrude(&mut self, request: &ExtrudeRequest) -> Result<SolidHandle, EvalError> {
        if self.failing.contains(&request.feature_id) {
            return Err(EvalError::Other {
                message: format!("forced failure for {}", request.feature_id),
            });
        }
        if !matches!(request.profile, Geometry::Profile { .. }) {
            return Err(EvalError::MissingInput {
                reason: "extrusion needs a sketch profile".into(),
            });
        }
        if request.end_condition == EndCondition::Blind && request.depth <= 0.0 {
            return Err(EvalError::InvalidParameter {
                reason: format!("blind depth must be positive, got {}", request.depth),
            });
        }
        if request.thin_walled && request.wall_thickness <= 0.0 {
            return Err(EvalError::InvalidParameter {
                reason: "thin wall needs a positive wall thickness".into(),
            });
        }
        if request.end_condition.requires_target() && request.target.is_none() {
            return Err(EvalError::MissingInput {
                reason: format!("{:?} needs a target", request.end_condition),
            });
        }

        self.requests.push(request.clone());
        Ok(self.alloc_handle())
    }
}
