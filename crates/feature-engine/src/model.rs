use std::collections::HashSet;

use geometry_eval::GeometryEvaluator;
use model_types::{FeatureId, FeatureStatus, ParameterKey};
use tracing::{debug, warn};

use crate::graph::DependencyGraph;
use crate::params::ParameterStore;
use crate::rebuild;
use crate::registry::FeatureRegistry;
use crate::snapshot::FeatureSnapshot;
use crate::types::{EngineError, FeatureVariant, UpdateReport};

/// Parameter store, feature registry and dependency graph of one model.
///
/// These are the primitives history operations replay. They do not record
/// anything themselves.
pub struct Model {
    pub(crate) params: ParameterStore,
    pub(crate) registry: FeatureRegistry,
    pub(crate) graph: DependencyGraph,
}

impl Model {
    pub fn new(value_tolerance: f64) -> Self {
        Self {
            params: ParameterStore::with_tolerance(value_tolerance),
            registry: FeatureRegistry::new(),
            graph: DependencyGraph::new(),
        }
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Capture a feature with its parameters and edges.
    pub fn snapshot(&self, id: &FeatureId) -> Result<FeatureSnapshot, EngineError> {
        let feature = self.registry.require(id)?;
        Ok(FeatureSnapshot {
            id: feature.id.clone(),
            name: feature.name.clone(),
            status: feature.status,
            variant: feature.variant.clone(),
            dependencies: self.graph.dependencies(id),
            dependents: self.graph.dependents(id),
            parameters: self.params.parameters(id).into_iter().cloned().collect(),
            position: self.registry.position(id).unwrap_or(usize::MAX),
        })
    }

    /// Register a feature from a snapshot: record, parameters, then edges.
    ///
    /// Every endpoint must already exist. Nothing is evaluated.
    pub fn insert_snapshot(&mut self, snap: &FeatureSnapshot) -> Result<(), EngineError> {
        if self.registry.contains(&snap.id) || self.graph.contains(&snap.id) {
            return Err(EngineError::DuplicateFeature {
                id: snap.id.clone(),
            });
        }
        for other in snap.dependencies.iter().chain(&snap.dependents) {
            if !self.graph.contains(other) {
                return Err(EngineError::Precondition {
                    reason: format!("{} references missing feature {other}", snap.id),
                });
            }
        }
        for param in &snap.parameters {
            let key = ParameterKey::new(snap.id.clone(), param.name());
            if self.params.contains(&key) {
                return Err(EngineError::DuplicateParameter { key });
            }
        }

        self.registry.insert_at(snap.position, snap.to_feature())?;
        self.graph.add_feature(snap.id.clone())?;
        for param in &snap.parameters {
            self.params.insert(snap.id.clone(), param.clone())?;
        }

        let edges = snap
            .dependencies
            .iter()
            .map(|dep| (&snap.id, dep))
            .chain(snap.dependents.iter().map(|d| (d, &snap.id)));
        for (dependent, dependency) in edges {
            if let Err(e) = self.graph.add_dependency(dependent, dependency) {
                self.discard(&snap.id);
                return Err(e);
            }
        }
        debug!(feature = %snap.id, kind = snap.kind().as_str(), "feature inserted");
        Ok(())
    }

    /// Remove a feature everywhere and return what is needed to restore it.
    pub fn detach_feature(&mut self, id: &FeatureId) -> Result<FeatureSnapshot, EngineError> {
        let snap = self.snapshot(id)?;
        self.discard(id);
        debug!(feature = %id, "feature detached");
        Ok(snap)
    }

    fn discard(&mut self, id: &FeatureId) {
        if self.graph.remove_feature(id).is_err() {
            warn!(feature = %id, "feature missing from graph during removal");
        }
        self.params.remove_feature(id);
        if self.registry.remove(id).is_err() {
            warn!(feature = %id, "feature missing from registry during removal");
        }
    }

    /// Update `id` and cascade to its dependents.
    ///
    /// Dependencies still waiting for their first evaluation are brought
    /// up to date first.
    pub fn update_feature(
        &mut self,
        id: &FeatureId,
        evaluator: &mut dyn GeometryEvaluator,
    ) -> Result<UpdateReport, EngineError> {
        let stale: Vec<FeatureId> = self
            .graph
            .upstream_order(id)?
            .into_iter()
            .filter(|dep| {
                self.registry
                    .get(dep)
                    .is_some_and(|f| f.status == FeatureStatus::Invalid)
            })
            .collect();

        let Self {
            params,
            registry,
            graph,
        } = self;
        let mut evaluate =
            |fid: &FeatureId| rebuild::evaluate_feature(registry, params, evaluator, fid);

        let mut report = UpdateReport::default();
        graph.run(&stale, &mut evaluate, &mut report);
        report.merge(graph.update_feature(id, &mut evaluate)?);
        Ok(report)
    }

    /// Update every feature once, in global topological order.
    pub fn update_all(&mut self, evaluator: &mut dyn GeometryEvaluator) -> UpdateReport {
        let Self {
            params,
            registry,
            graph,
        } = self;
        graph.update_all(|fid| rebuild::evaluate_feature(registry, params, evaluator, fid))
    }

    /// Update the given features and everything downstream of them, each once.
    /// Ids no longer in the graph are ignored.
    pub fn update_many(
        &mut self,
        ids: &[FeatureId],
        evaluator: &mut dyn GeometryEvaluator,
    ) -> UpdateReport {
        let mut affected: HashSet<FeatureId> = HashSet::new();
        for id in ids {
            if let Ok(downstream) = self.graph.update_order(id) {
                affected.insert(id.clone());
                affected.extend(downstream);
            }
        }
        let order: Vec<FeatureId> = self
            .graph
            .topological_order()
            .into_iter()
            .filter(|id| affected.contains(id))
            .collect();

        let Self {
            params,
            registry,
            graph,
        } = self;
        let mut evaluate =
            |fid: &FeatureId| rebuild::evaluate_feature(registry, params, evaluator, fid);
        let mut report = UpdateReport::default();
        graph.run(&order, &mut evaluate, &mut report);
        report
    }

    /// Point an extrusion at a new up-to target, moving the graph edge with it.
    /// Returns the previous target.
    pub fn set_extrusion_target(
        &mut self,
        id: &FeatureId,
        target: Option<FeatureId>,
    ) -> Result<Option<FeatureId>, EngineError> {
        let feature = self.registry.require(id)?;
        let FeatureVariant::Extrusion(state) = &feature.variant else {
            return Err(EngineError::Precondition {
                reason: format!("{id} is not an extrusion"),
            });
        };
        let old = state.target_id.clone();
        let sketch = state.sketch_id.clone();

        if let Some(t) = &target {
            if !self.graph.contains(t) {
                return Err(EngineError::FeatureNotFound { id: t.clone() });
            }
            if self.graph.would_create_cycle(id, t) {
                return Err(EngineError::CycleDetected {
                    dependent: id.clone(),
                    dependency: t.clone(),
                });
            }
        }

        if let Some(o) = &old {
            if o != &sketch && target.as_ref() != Some(o) && self.graph.has_dependency(id, o) {
                self.graph.remove_dependency(id, o)?;
            }
        }
        if let Some(t) = &target {
            self.graph.add_dependency(id, t)?;
        }
        if let Some(FeatureVariant::Extrusion(state)) =
            self.registry.get_mut(id).map(|f| &mut f.variant)
        {
            state.target_id = target;
        }
        Ok(old)
    }
}
