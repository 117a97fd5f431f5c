pub mod config;
pub mod configuration;
pub mod design_table;
pub mod expression;
pub mod graph;
pub mod history;
pub mod model;
pub mod params;
pub mod rebuild;
pub mod registry;
pub mod snapshot;
pub mod types;

use std::path::Path;

use geometry_eval::GeometryEvaluator;
use model_types::{FeatureId, FeatureStatus, ParamType, ParameterKey};
use tracing::{debug, info, instrument, warn};

pub use crate::config::EngineConfig;
pub use crate::configuration::{Configuration, ConfigurationManager};
pub use crate::design_table::DesignTable;
pub use crate::history::{FeatureHistory, Operation, ValueChange};
pub use crate::model::Model;
pub use crate::params::{Bounds, Parameter, ParameterStore};
pub use crate::snapshot::FeatureSnapshot;
pub use crate::types::{
    ApplyReport, CallbackId, EngineError, ErrorKind, ExtrusionState, Feature, FeatureVariant,
    UpdateReport,
};

/// The parametric feature engine.
///
/// Owns the model, the geometry evaluator, the undo history and the
/// configuration layer. Every model mutation goes through a history
/// [`Operation`] so it can be undone.
pub struct Engine<E: GeometryEvaluator> {
    model: Model,
    evaluator: E,
    history: FeatureHistory,
    configurations: ConfigurationManager,
    design_table: DesignTable,
    config: EngineConfig,
}

impl<E: GeometryEvaluator> Engine<E> {
    /// Create an engine with default settings.
    pub fn new(evaluator: E) -> Self {
        Self::with_config(evaluator, EngineConfig::default())
    }

    pub fn with_config(evaluator: E, config: EngineConfig) -> Self {
        let mut configurations = ConfigurationManager::new();
        if let Some((name, description)) = &config.default_configuration {
            if let Err(e) = configurations.create(name, description) {
                warn!(error = %e, "could not create default configuration");
            }
        }
        Self {
            model: Model::new(config.value_tolerance),
            evaluator,
            history: FeatureHistory::with_limit(config.history_limit),
            configurations,
            design_table: DesignTable::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn params(&self) -> &ParameterStore {
        self.model.params()
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn evaluator_mut(&mut self) -> &mut E {
        &mut self.evaluator
    }

    pub fn history(&self) -> &FeatureHistory {
        &self.history
    }

    pub fn configurations(&self) -> &ConfigurationManager {
        &self.configurations
    }

    pub fn design_table(&self) -> &DesignTable {
        &self.design_table
    }

    /// Run an operation forward and record it.
    fn execute(&mut self, op: Operation) -> Result<UpdateReport, EngineError> {
        let report = op.redo(&mut self.model, &mut self.evaluator)?;
        if self.config.record_history {
            self.history.add_operation(op);
        }
        Ok(report)
    }

    // ── Features ───────────────────────────────────────────────────────

    pub fn feature(&self, id: &FeatureId) -> Option<&Feature> {
        self.model.registry().get(id)
    }

    /// Features in creation order.
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.model.registry().iter()
    }

    pub fn feature_status(&self, id: &FeatureId) -> Option<FeatureStatus> {
        self.feature(id).map(|f| f.status)
    }

    pub fn create_sketch(&mut self, name: &str) -> Result<FeatureId, EngineError> {
        self.create_feature(name, FeatureVariant::Sketch)
    }

    pub fn create_extrusion(
        &mut self,
        name: &str,
        sketch_id: &FeatureId,
    ) -> Result<FeatureId, EngineError> {
        self.create_feature(
            name,
            FeatureVariant::Extrusion(ExtrusionState::new(sketch_id.clone())),
        )
    }

    /// Create a feature under a freshly generated id.
    pub fn create_feature(
        &mut self,
        name: &str,
        variant: FeatureVariant,
    ) -> Result<FeatureId, EngineError> {
        let id = self.model.registry().generate_id();
        self.create_feature_with_id(id, name, variant)
    }

    /// Create a feature under a caller-chosen id.
    ///
    /// Ids already issued in this session are rejected, even if the feature
    /// carrying them has since been deleted. Ids may not contain `:`, `,` or
    /// control characters. The feature's parameters are
    /// registered with their defaults and its intrinsic dependencies are
    /// wired. It starts out `Invalid`; nothing is evaluated.
    pub fn create_feature_with_id(
        &mut self,
        id: impl Into<FeatureId>,
        name: &str,
        variant: FeatureVariant,
    ) -> Result<FeatureId, EngineError> {
        let id = id.into();
        if id.is_empty() {
            return Err(EngineError::Precondition {
                reason: "feature id must not be empty".into(),
            });
        }
        // Keys are written as `feature:name` in comma-separated tables.
        if id.as_str().contains(|c: char| c == ':' || c == ',' || c.is_control()) {
            return Err(EngineError::Precondition {
                reason: format!("feature id '{id}' contains a reserved character"),
            });
        }
        let registry = self.model.registry();
        if registry.contains(&id) || registry.was_issued(&id) {
            return Err(EngineError::DuplicateFeature { id });
        }
        let dependencies = variant.intrinsic_dependencies();
        for dep in &dependencies {
            if !registry.contains(dep) {
                return Err(EngineError::FeatureNotFound { id: dep.clone() });
            }
        }

        let snapshot = FeatureSnapshot {
            id: id.clone(),
            name: name.to_string(),
            status: FeatureStatus::Invalid,
            parameters: variant.parameter_specs().iter().map(|s| s.build()).collect(),
            variant,
            dependencies,
            dependents: Vec::new(),
            position: registry.len(),
        };
        self.execute(Operation::AddFeature {
            snapshot: Box::new(snapshot),
        })?;
        info!(feature = %id, name, "feature created");
        Ok(id)
    }

    /// Delete a feature with its parameters and edges. Former dependents
    /// are re-evaluated and fail for lack of input.
    pub fn delete_feature(&mut self, id: &FeatureId) -> Result<UpdateReport, EngineError> {
        let snapshot = self.model.snapshot(id)?;
        let report = self.execute(Operation::RemoveFeature {
            snapshot: Box::new(snapshot),
        })?;
        info!(feature = %id, "feature deleted");
        Ok(report)
    }

    pub fn rename_feature(&mut self, id: &FeatureId, name: &str) -> Result<(), EngineError> {
        let old_name = self.model.registry().require(id)?.name.clone();
        if old_name == name {
            return Ok(());
        }
        self.execute(Operation::RenameFeature {
            feature_id: id.clone(),
            old_name,
            new_name: name.to_string(),
        })?;
        Ok(())
    }

    /// Suppress or unsuppress a feature and update it with its dependents.
    pub fn set_suppressed(
        &mut self,
        id: &FeatureId,
        suppressed: bool,
    ) -> Result<UpdateReport, EngineError> {
        let prior = self.model.registry().require(id)?.status;
        if (prior == FeatureStatus::Suppressed) == suppressed {
            return Ok(UpdateReport::default());
        }
        self.execute(Operation::SetSuppressed {
            feature_id: id.clone(),
            suppressed,
            prior,
        })
    }

    /// Point an extrusion at the feature its up-to end condition stops at.
    pub fn set_extrusion_target(
        &mut self,
        id: &FeatureId,
        target: Option<FeatureId>,
    ) -> Result<UpdateReport, EngineError> {
        let feature = self.model.registry().require(id)?;
        let FeatureVariant::Extrusion(state) = &feature.variant else {
            return Err(EngineError::Precondition {
                reason: format!("{id} is not an extrusion"),
            });
        };
        if state.target_id == target {
            return Ok(UpdateReport::default());
        }
        let old_target = state.target_id.clone();
        self.execute(Operation::SetExtrusionTarget {
            feature_id: id.clone(),
            old_target,
            new_target: target,
        })
    }

    /// Text form of a feature's snapshot.
    pub fn serialize_feature(&self, id: &FeatureId) -> Result<String, EngineError> {
        Ok(self.model.snapshot(id)?.serialize())
    }

    // ── Parameters ─────────────────────────────────────────────────────

    pub fn parameter(&self, key: &ParameterKey) -> Option<&Parameter> {
        self.model.params().get(key)
    }

    pub fn parameter_value(&self, key: &ParameterKey) -> Option<f64> {
        self.model.params().value(key)
    }

    pub fn create_parameter(
        &mut self,
        key: ParameterKey,
        value: f64,
        param_type: ParamType,
        bounds: Bounds,
    ) -> Result<(), EngineError> {
        if !value.is_finite() {
            return Err(EngineError::NotFinite { key });
        }
        if self.model.params().contains(&key) {
            return Err(EngineError::DuplicateParameter { key });
        }
        let parameter = Parameter::new(key.name.clone(), value, param_type, bounds);
        self.execute(Operation::CreateParameter {
            key,
            parameter: Box::new(parameter),
        })?;
        Ok(())
    }

    /// Write a parameter and update its owner with everything downstream.
    ///
    /// Writing the value already stored is a no-op: nothing fires, nothing
    /// is recorded.
    pub fn set_parameter(
        &mut self,
        key: &ParameterKey,
        value: f64,
    ) -> Result<UpdateReport, EngineError> {
        let params = self.model.params();
        let current = params
            .get(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        let new_value = params.validate(key, value)?;
        if current.expression().is_none()
            && (new_value - current.value()).abs() <= self.config.value_tolerance
        {
            debug!(param = %key, "value unchanged");
            return Ok(UpdateReport::default());
        }
        let op = Operation::SetParameter {
            key: key.clone(),
            old_value: current.value(),
            old_expression: current.expression().map(str::to_string),
            new_value,
        };
        self.execute(op)
    }

    /// Drive a parameter from an expression.
    pub fn set_expression(
        &mut self,
        key: &ParameterKey,
        text: &str,
    ) -> Result<UpdateReport, EngineError> {
        let current = self
            .model
            .params()
            .get(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        let op = Operation::SetExpression {
            key: key.clone(),
            old_value: current.value(),
            old_expression: current.expression().map(str::to_string),
            new_expression: text.to_string(),
        };
        self.execute(op)
    }

    pub fn subscribe_parameter(
        &mut self,
        key: &ParameterKey,
        callback: impl FnMut(f64) + 'static,
    ) -> Result<CallbackId, EngineError> {
        self.model.params.subscribe(key, callback)
    }

    pub fn unsubscribe_parameter(
        &mut self,
        key: &ParameterKey,
        id: CallbackId,
    ) -> Result<(), EngineError> {
        self.model.params.unsubscribe(key, id)
    }

    // ── Dependencies ───────────────────────────────────────────────────

    /// Add `dependent -> dependency`. Returns `false` if the edge already
    /// exists. A cycle is refused and leaves the graph unchanged.
    ///
    /// Nothing is re-evaluated.
    pub fn add_dependency(
        &mut self,
        dependent: &FeatureId,
        dependency: &FeatureId,
    ) -> Result<bool, EngineError> {
        let graph = self.model.graph();
        for id in [dependent, dependency] {
            if !graph.contains(id) {
                return Err(EngineError::FeatureNotFound { id: id.clone() });
            }
        }
        if graph.has_dependency(dependent, dependency) {
            return Ok(false);
        }
        self.execute(Operation::AddDependency {
            dependent: dependent.clone(),
            dependency: dependency.clone(),
        })?;
        Ok(true)
    }

    /// Remove an edge. Edges implied by a feature's definition, such as an
    /// extrusion's sketch, cannot be removed. Nothing is re-evaluated.
    pub fn remove_dependency(
        &mut self,
        dependent: &FeatureId,
        dependency: &FeatureId,
    ) -> Result<(), EngineError> {
        if !self.model.graph().has_dependency(dependent, dependency) {
            return Err(EngineError::DependencyNotFound {
                dependent: dependent.clone(),
                dependency: dependency.clone(),
            });
        }
        let intrinsic = self
            .feature(dependent)
            .is_some_and(|f| f.variant.intrinsic_dependencies().contains(dependency));
        if intrinsic {
            return Err(EngineError::Precondition {
                reason: format!("{dependent} is defined in terms of {dependency}"),
            });
        }
        self.execute(Operation::RemoveDependency {
            dependent: dependent.clone(),
            dependency: dependency.clone(),
        })?;
        Ok(())
    }

    pub fn dependencies(&self, id: &FeatureId) -> Vec<FeatureId> {
        self.model.graph().dependencies(id)
    }

    pub fn dependents(&self, id: &FeatureId) -> Vec<FeatureId> {
        self.model.graph().dependents(id)
    }

    /// Register a callback fired each time `id` is updated.
    pub fn on_feature_update(
        &mut self,
        id: &FeatureId,
        callback: impl FnMut(&FeatureId) + 'static,
    ) -> Result<CallbackId, EngineError> {
        self.model.graph.on_update(id, callback)
    }

    pub fn remove_feature_update_callback(
        &mut self,
        id: &FeatureId,
        callback: CallbackId,
    ) -> Result<(), EngineError> {
        self.model.graph.remove_update_callback(id, callback)
    }

    // ── Updates ────────────────────────────────────────────────────────

    /// Update `id` and everything downstream of it.
    pub fn update_feature(&mut self, id: &FeatureId) -> Result<UpdateReport, EngineError> {
        self.model.update_feature(id, &mut self.evaluator)
    }

    pub fn update_all(&mut self) -> UpdateReport {
        self.model.update_all(&mut self.evaluator)
    }

    // ── History ────────────────────────────────────────────────────────

    pub fn undo(&mut self) -> Result<UpdateReport, EngineError> {
        self.history.undo(&mut self.model, &mut self.evaluator)
    }

    pub fn redo(&mut self) -> Result<UpdateReport, EngineError> {
        self.history.redo(&mut self.model, &mut self.evaluator)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn subscribe_history(&mut self, listener: impl FnMut() + 'static) -> CallbackId {
        self.history.subscribe(listener)
    }

    pub fn unsubscribe_history(&mut self, id: CallbackId) -> Result<(), EngineError> {
        self.history.unsubscribe(id)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    // ── Configurations ─────────────────────────────────────────────────

    pub fn configuration(&self, name: &str) -> Option<&Configuration> {
        self.configurations.get(name)
    }

    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.configurations.active()
    }

    pub fn create_configuration(&mut self, name: &str, description: &str) -> Result<(), EngineError> {
        self.configurations.create(name, description)
    }

    /// Remove a configuration and its design table column, if any.
    pub fn remove_configuration(&mut self, name: &str) -> Result<Configuration, EngineError> {
        let removed = self.configurations.remove(name)?;
        if self.design_table.has_configuration(name) {
            self.design_table.remove_configuration(name)?;
        }
        Ok(removed)
    }

    /// Rename a configuration and its design table column, if any.
    pub fn rename_configuration(&mut self, old: &str, new: &str) -> Result<(), EngineError> {
        if self.design_table.has_configuration(new) {
            return Err(EngineError::DuplicateTableEntry {
                entry: format!("configuration {new}"),
            });
        }
        self.configurations.rename(old, new)?;
        if self.design_table.has_configuration(old) {
            self.design_table.rename_configuration(old, new)?;
        }
        Ok(())
    }

    pub fn set_active_configuration(&mut self, name: &str) -> Result<(), EngineError> {
        self.configurations.set_active(name)
    }

    pub fn set_configuration_value(
        &mut self,
        name: &str,
        key: ParameterKey,
        value: f64,
    ) -> Result<(), EngineError> {
        self.configurations.require_mut(name)?.set_value(key, value);
        Ok(())
    }

    pub fn subscribe_active_configuration(
        &mut self,
        listener: impl FnMut(Option<&str>) + 'static,
    ) -> CallbackId {
        self.configurations.subscribe(listener)
    }

    pub fn unsubscribe_active_configuration(&mut self, id: CallbackId) -> Result<(), EngineError> {
        self.configurations.unsubscribe(id)
    }

    /// Write every value of `name` into the store, then update every feature
    /// once in topological order.
    ///
    /// Keys the store does not have, or whose values it refuses, are
    /// reported and skipped. The whole application is one undo step; when no
    /// value changes nothing is recorded.
    #[instrument(skip(self))]
    pub fn apply_configuration(&mut self, name: &str) -> Result<ApplyReport, EngineError> {
        let config = self.configurations.require(name)?;
        let params = self.model.params();

        let mut changes = Vec::new();
        let mut rejected = Vec::new();
        for (key, value) in config.values() {
            let current = match params.get(key) {
                Some(p) => p,
                None => {
                    rejected.push((key.clone(), "parameter not found".to_string()));
                    continue;
                }
            };
            match params.validate(key, *value) {
                Ok(new_value)
                    if current.expression().is_none()
                        && (new_value - current.value()).abs() <= self.config.value_tolerance => {}
                Ok(new_value) => changes.push(ValueChange {
                    key: key.clone(),
                    old_value: current.value(),
                    old_expression: current.expression().map(str::to_string),
                    new_value,
                }),
                Err(e) => rejected.push((key.clone(), e.to_string())),
            }
        }
        for (key, reason) in &rejected {
            warn!(param = %key, %reason, "configuration value skipped");
        }

        let written = changes.iter().map(|c| c.key.clone()).collect();
        let update = if changes.is_empty() {
            debug!(configuration = name, "configuration matches the model");
            self.model.update_all(&mut self.evaluator)
        } else {
            self.execute(Operation::ApplyConfiguration {
                name: name.to_string(),
                changes,
            })?
        };
        info!(
            configuration = name,
            evaluated = update.evaluated.len(),
            "configuration applied"
        );
        Ok(ApplyReport {
            written,
            rejected,
            update,
        })
    }

    /// Capture store values into `name`: everything when `filter` is empty,
    /// otherwise just the listed keys. Returns how many values were captured.
    pub fn update_configuration_from_model(
        &mut self,
        name: &str,
        filter: &[ParameterKey],
    ) -> Result<usize, EngineError> {
        let features = self.model.registry().ids().to_vec();
        self.configurations
            .update_from_model(name, self.model.params(), &features, filter)
    }

    pub fn serialize_configurations(&self) -> String {
        self.configurations.serialize()
    }

    pub fn load_configurations(&mut self, text: &str) -> Result<(), EngineError> {
        self.configurations.load(text)
    }

    // ── Design table ───────────────────────────────────────────────────

    pub fn add_table_parameter(&mut self, key: ParameterKey) -> Result<(), EngineError> {
        self.design_table
            .add_parameter(key, &self.configurations, self.model.params())
    }

    pub fn remove_table_parameter(&mut self, key: &ParameterKey) -> Result<(), EngineError> {
        self.design_table.remove_parameter(key)
    }

    pub fn add_table_configuration(&mut self, name: &str) -> Result<(), EngineError> {
        self.design_table
            .add_configuration(name, &mut self.configurations, &self.model.params)
    }

    pub fn remove_table_configuration(&mut self, name: &str) -> Result<(), EngineError> {
        self.design_table.remove_configuration(name)
    }

    pub fn set_table_cell(
        &mut self,
        configuration: &str,
        key: &ParameterKey,
        value: f64,
    ) -> Result<(), EngineError> {
        self.design_table.set_cell(configuration, key, value)
    }

    pub fn table_cell(&self, configuration: &str, key: &ParameterKey) -> Option<f64> {
        self.design_table.cell(configuration, key)
    }

    pub fn clear_design_table(&mut self) {
        self.design_table.clear();
    }

    /// Rebuild the design table from the configurations.
    pub fn refresh_design_table(&mut self) {
        self.design_table
            .update_from_configurations(&self.configurations);
    }

    /// Push design table cells into the configurations.
    pub fn push_design_table(&mut self) -> Result<(), EngineError> {
        self.design_table
            .update_configurations(&mut self.configurations)
    }

    pub fn export_design_table_csv(&self) -> Result<String, EngineError> {
        self.design_table.to_csv()
    }

    /// Replace the design table from CSV and push it into the configurations.
    pub fn import_design_table_csv(&mut self, text: &str) -> Result<(), EngineError> {
        self.design_table.import_csv(text)?;
        self.push_design_table()
    }

    pub fn export_design_table_file(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        self.design_table.export_csv_file(path)
    }

    pub fn import_design_table_file(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        self.design_table.import_csv_file(path)?;
        self.push_design_table()
    }
}
