use geometry_eval::GeometryEvaluator;
use model_types::{FeatureId, FeatureStatus, ParameterKey};
use tracing::{debug, info, instrument};

use crate::model::Model;
use crate::params::Parameter;
use crate::snapshot::FeatureSnapshot;
use crate::types::{CallbackId, EngineError, UpdateReport};

/// One parameter write inside a bulk operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub key: ParameterKey,
    pub old_value: f64,
    pub old_expression: Option<String>,
    pub new_value: f64,
}

/// A reversible mutation recorded by the engine.
///
/// Each variant carries everything it needs to undo and redo itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    AddFeature {
        snapshot: Box<FeatureSnapshot>,
    },
    RemoveFeature {
        snapshot: Box<FeatureSnapshot>,
    },
    SetParameter {
        key: ParameterKey,
        old_value: f64,
        /// Expression cleared by the write, if any.
        old_expression: Option<String>,
        new_value: f64,
    },
    SetExpression {
        key: ParameterKey,
        old_value: f64,
        old_expression: Option<String>,
        new_expression: String,
    },
    CreateParameter {
        key: ParameterKey,
        parameter: Box<Parameter>,
    },
    AddDependency {
        dependent: FeatureId,
        dependency: FeatureId,
    },
    RemoveDependency {
        dependent: FeatureId,
        dependency: FeatureId,
    },
    RenameFeature {
        feature_id: FeatureId,
        old_name: String,
        new_name: String,
    },
    SetSuppressed {
        feature_id: FeatureId,
        suppressed: bool,
        prior: FeatureStatus,
    },
    SetExtrusionTarget {
        feature_id: FeatureId,
        old_target: Option<FeatureId>,
        new_target: Option<FeatureId>,
    },
    ApplyConfiguration {
        name: String,
        changes: Vec<ValueChange>,
    },
}

impl Operation {
    /// The feature this operation is about, if any.
    pub fn feature_id(&self) -> Option<&FeatureId> {
        match self {
            Operation::AddFeature { snapshot } | Operation::RemoveFeature { snapshot } => {
                Some(&snapshot.id)
            }
            Operation::SetParameter { key, .. }
            | Operation::SetExpression { key, .. }
            | Operation::CreateParameter { key, .. } => Some(&key.feature_id),
            Operation::AddDependency { dependent, .. }
            | Operation::RemoveDependency { dependent, .. } => Some(dependent),
            Operation::RenameFeature { feature_id, .. }
            | Operation::SetSuppressed { feature_id, .. }
            | Operation::SetExtrusionTarget { feature_id, .. } => Some(feature_id),
            Operation::ApplyConfiguration { .. } => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Operation::AddFeature { snapshot } => format!("Add feature: {}", snapshot.name),
            Operation::RemoveFeature { snapshot } => format!("Remove feature: {}", snapshot.name),
            Operation::SetParameter { key, .. } => format!("Set parameter: {}", key.name),
            Operation::SetExpression { key, .. } => format!("Set expression: {}", key.name),
            Operation::CreateParameter { key, .. } => format!("Create parameter: {}", key.name),
            Operation::AddDependency { dependency, .. } => format!("Add dependency: {dependency}"),
            Operation::RemoveDependency { dependency, .. } => {
                format!("Remove dependency: {dependency}")
            }
            Operation::RenameFeature { new_name, .. } => format!("Rename feature: {new_name}"),
            Operation::SetSuppressed {
                feature_id,
                suppressed,
                ..
            } => {
                if *suppressed {
                    format!("Suppress feature: {feature_id}")
                } else {
                    format!("Unsuppress feature: {feature_id}")
                }
            }
            Operation::SetExtrusionTarget { feature_id, .. } => {
                format!("Set extrusion target: {feature_id}")
            }
            Operation::ApplyConfiguration { name, .. } => format!("Apply configuration: {name}"),
        }
    }

    /// Apply the operation. The first execution of a new operation is a redo.
    pub fn redo(
        &self,
        model: &mut Model,
        evaluator: &mut dyn GeometryEvaluator,
    ) -> Result<UpdateReport, EngineError> {
        match self {
            Operation::AddFeature { snapshot } => {
                model.insert_snapshot(snapshot)?;
                Ok(UpdateReport::default())
            }
            Operation::RemoveFeature { snapshot } => {
                model.detach_feature(&snapshot.id)?;
                Ok(model.update_many(&snapshot.dependents, evaluator))
            }
            Operation::SetParameter { key, new_value, .. } => {
                model.params.set(key, *new_value)?;
                refresh(model, evaluator, &key.feature_id)
            }
            Operation::SetExpression {
                key,
                new_expression,
                ..
            } => {
                model.params.set_expression(key, new_expression)?;
                refresh(model, evaluator, &key.feature_id)
            }
            Operation::CreateParameter { key, parameter } => {
                model
                    .params
                    .insert(key.feature_id.clone(), (**parameter).clone())?;
                Ok(UpdateReport::default())
            }
            Operation::AddDependency {
                dependent,
                dependency,
            } => {
                model.graph.add_dependency(dependent, dependency)?;
                Ok(UpdateReport::default())
            }
            Operation::RemoveDependency {
                dependent,
                dependency,
            } => {
                model.graph.remove_dependency(dependent, dependency)?;
                Ok(UpdateReport::default())
            }
            Operation::RenameFeature {
                feature_id,
                new_name,
                ..
            } => {
                model.registry.rename(feature_id, new_name.clone())?;
                Ok(UpdateReport::default())
            }
            Operation::SetSuppressed {
                feature_id,
                suppressed,
                ..
            } => apply_suppression(model, evaluator, feature_id, *suppressed),
            Operation::SetExtrusionTarget {
                feature_id,
                new_target,
                ..
            } => {
                model.set_extrusion_target(feature_id, new_target.clone())?;
                model.update_feature(feature_id, evaluator)
            }
            Operation::ApplyConfiguration { changes, .. } => {
                for change in changes {
                    model.params.set(&change.key, change.new_value)?;
                }
                Ok(model.update_all(evaluator))
            }
        }
    }

    /// Reverse the operation.
    pub fn undo(
        &self,
        model: &mut Model,
        evaluator: &mut dyn GeometryEvaluator,
    ) -> Result<UpdateReport, EngineError> {
        match self {
            Operation::AddFeature { snapshot } => {
                require_feature(model, &snapshot.id)?;
                model.detach_feature(&snapshot.id)?;
                Ok(UpdateReport::default())
            }
            Operation::RemoveFeature { snapshot } => {
                let mut restored = (**snapshot).clone();
                if restored.status != FeatureStatus::Suppressed {
                    restored.status = FeatureStatus::Invalid;
                }
                model.insert_snapshot(&restored)?;
                model.update_feature(&restored.id, evaluator)
            }
            Operation::SetParameter {
                key,
                old_value,
                old_expression,
                ..
            }
            | Operation::SetExpression {
                key,
                old_value,
                old_expression,
                ..
            } => {
                restore_value(model, key, *old_value, old_expression.as_deref())?;
                refresh(model, evaluator, &key.feature_id)
            }
            Operation::CreateParameter { key, .. } => {
                model.params.remove(key)?;
                Ok(UpdateReport::default())
            }
            Operation::AddDependency {
                dependent,
                dependency,
            } => {
                model.graph.remove_dependency(dependent, dependency)?;
                Ok(UpdateReport::default())
            }
            Operation::RemoveDependency {
                dependent,
                dependency,
            } => {
                model.graph.add_dependency(dependent, dependency)?;
                Ok(UpdateReport::default())
            }
            Operation::RenameFeature {
                feature_id,
                old_name,
                ..
            } => {
                model.registry.rename(feature_id, old_name.clone())?;
                Ok(UpdateReport::default())
            }
            Operation::SetSuppressed {
                feature_id, prior, ..
            } => apply_suppression(
                model,
                evaluator,
                feature_id,
                *prior == FeatureStatus::Suppressed,
            ),
            Operation::SetExtrusionTarget {
                feature_id,
                old_target,
                ..
            } => {
                model.set_extrusion_target(feature_id, old_target.clone())?;
                model.update_feature(feature_id, evaluator)
            }
            Operation::ApplyConfiguration { changes, .. } => {
                for change in changes.iter().rev() {
                    restore_value(
                        model,
                        &change.key,
                        change.old_value,
                        change.old_expression.as_deref(),
                    )?;
                }
                Ok(model.update_all(evaluator))
            }
        }
    }
}

fn require_feature(model: &Model, id: &FeatureId) -> Result<(), EngineError> {
    if model.registry.contains(id) {
        Ok(())
    } else {
        Err(EngineError::Precondition {
            reason: format!("feature {id} no longer exists"),
        })
    }
}

/// Put a parameter back, expression included.
fn restore_value(
    model: &mut Model,
    key: &ParameterKey,
    value: f64,
    expression: Option<&str>,
) -> Result<(), EngineError> {
    model.params.restore(key, value, expression)?;
    Ok(())
}

/// Cascade from the parameter's owner, if it is a feature.
fn refresh(
    model: &mut Model,
    evaluator: &mut dyn GeometryEvaluator,
    owner: &FeatureId,
) -> Result<UpdateReport, EngineError> {
    if model.graph.contains(owner) {
        model.update_feature(owner, evaluator)
    } else {
        Ok(UpdateReport::default())
    }
}

fn apply_suppression(
    model: &mut Model,
    evaluator: &mut dyn GeometryEvaluator,
    id: &FeatureId,
    suppressed: bool,
) -> Result<UpdateReport, EngineError> {
    model.registry.set_suppressed(id, suppressed)?;
    model.update_feature(id, evaluator)
}

type HistoryListener = Box<dyn FnMut()>;

/// Ordered log of operations with an undo cursor.
///
/// `position` is the index of the first undone operation; it equals the
/// number of operations when nothing is undone.
pub struct FeatureHistory {
    operations: Vec<Operation>,
    position: usize,
    limit: Option<usize>,
    listeners: Vec<(CallbackId, HistoryListener)>,
    next_listener: u64,
}

impl FeatureHistory {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
            position: 0,
            limit: None,
            listeners: Vec::new(),
            next_listener: 1,
        }
    }

    /// Keep at most `limit` operations; the oldest are dropped first.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::new()
        }
    }

    /// Append an already-applied operation, discarding any redo tail.
    pub fn add_operation(&mut self, op: Operation) {
        debug!(description = %op.description(), "recording operation");
        self.operations.truncate(self.position);
        self.operations.push(op);
        if let Some(limit) = self.limit {
            if self.operations.len() > limit {
                let excess = self.operations.len() - limit;
                self.operations.drain(..excess);
            }
        }
        self.position = self.operations.len();
        self.notify();
    }

    /// Undo the operation before the cursor. On failure the cursor stays put.
    #[instrument(skip_all, fields(position = self.position))]
    pub fn undo(
        &mut self,
        model: &mut Model,
        evaluator: &mut dyn GeometryEvaluator,
    ) -> Result<UpdateReport, EngineError> {
        if self.position == 0 {
            return Err(EngineError::NothingToUndo);
        }
        let op = &self.operations[self.position - 1];
        let report = op.undo(model, evaluator)?;
        info!(description = %op.description(), "undone");
        self.position -= 1;
        self.notify();
        Ok(report)
    }

    /// Redo the operation at the cursor. On failure the cursor stays put.
    #[instrument(skip_all, fields(position = self.position))]
    pub fn redo(
        &mut self,
        model: &mut Model,
        evaluator: &mut dyn GeometryEvaluator,
    ) -> Result<UpdateReport, EngineError> {
        if self.position == self.operations.len() {
            return Err(EngineError::NothingToRedo);
        }
        let op = &self.operations[self.position];
        let report = op.redo(model, evaluator)?;
        info!(description = %op.description(), "redone");
        self.position += 1;
        self.notify();
        Ok(report)
    }

    pub fn can_undo(&self) -> bool {
        self.position > 0
    }

    pub fn can_redo(&self) -> bool {
        self.position < self.operations.len()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn current_position(&self) -> usize {
        self.position
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Description of the operation `undo` would reverse.
    pub fn undo_description(&self) -> Option<String> {
        self.position
            .checked_sub(1)
            .and_then(|i| self.operations.get(i))
            .map(Operation::description)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.operations.get(self.position).map(Operation::description)
    }

    pub fn clear(&mut self) {
        self.operations.clear();
        self.position = 0;
        self.notify();
    }

    /// Register a callback fired whenever the log or cursor changes.
    pub fn subscribe(&mut self, listener: impl FnMut() + 'static) -> CallbackId {
        let id = CallbackId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: CallbackId) -> Result<(), EngineError> {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        if self.listeners.len() == before {
            return Err(EngineError::CallbackNotFound { id });
        }
        Ok(())
    }

    fn notify(&mut self) {
        for (_, listener) in self.listeners.iter_mut() {
            listener();
        }
    }
}

impl Default for FeatureHistory {
    fn default() -> Self {
        Self::new()
    }
}
