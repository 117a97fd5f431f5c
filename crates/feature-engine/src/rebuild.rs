use geometry_eval::{ExtrudeRequest, Geometry, GeometryEvaluator};
use model_types::{EndCondition, ExtrudeDirection, FeatureId, FeatureStatus, ParameterKey};
use tracing::{debug, warn};

use crate::params::ParameterStore;
use crate::registry::FeatureRegistry;
use crate::types::{extrusion_params, ExtrusionState, FeatureVariant, UpdateOutcome};

/// Re-derive one feature's geometry from the store and its inputs.
///
/// On success the feature becomes `Valid` and publishes new output. On
/// failure it becomes `Error` and keeps whatever output it had before.
pub fn evaluate_feature(
    registry: &mut FeatureRegistry,
    params: &ParameterStore,
    evaluator: &mut dyn GeometryEvaluator,
    id: &FeatureId,
) -> UpdateOutcome {
    let Some(feature) = registry.get(id) else {
        return UpdateOutcome::Missing;
    };
    if feature.is_suppressed() {
        debug!(feature = %id, "skipping suppressed feature");
        return UpdateOutcome::Skipped;
    }

    let result = match &feature.variant {
        FeatureVariant::Sketch => Ok((
            Geometry::Profile { sketch: id.clone() },
            FeatureVariant::Sketch,
        )),
        FeatureVariant::Extrusion(state) => {
            let synced = sync_state(state, params, id);
            execute_extrusion(&synced, registry, params, evaluator, id)
                .map(|geometry| (geometry, FeatureVariant::Extrusion(synced)))
        }
    };

    let Some(feature) = registry.get_mut(id) else {
        return UpdateOutcome::Missing;
    };
    match result {
        Ok((geometry, variant)) => {
            feature.variant = variant;
            feature.output = Some(geometry);
            feature.status = FeatureStatus::Valid;
            feature.last_error = None;
            UpdateOutcome::Valid
        }
        Err(reason) => {
            warn!(feature = %id, %reason, "feature update failed");
            feature.status = FeatureStatus::Error;
            feature.last_error = Some(reason.clone());
            UpdateOutcome::Failed { reason }
        }
    }
}

/// Pull the enum-valued parameters back into the variant state.
fn sync_state(state: &ExtrusionState, params: &ParameterStore, id: &FeatureId) -> ExtrusionState {
    let mut synced = state.clone();
    let read = |name: &str| params.value(&ParameterKey::new(id.clone(), name));
    if let Some(direction) = read(extrusion_params::DIRECTION)
        .and_then(|v| ExtrudeDirection::from_index(v as i64))
    {
        synced.direction = direction;
    }
    if let Some(end) = read(extrusion_params::END_CONDITION)
        .and_then(|v| EndCondition::from_index(v as i64))
    {
        synced.end_condition = end;
    }
    synced
}

/// Output of an input feature, if it is usable.
fn input_geometry(registry: &FeatureRegistry, input: &FeatureId) -> Result<Geometry, String> {
    let feature = registry
        .get(input)
        .ok_or_else(|| format!("input feature {input} not found"))?;
    match (feature.status, &feature.output) {
        (FeatureStatus::Valid, Some(output)) => Ok(output.clone()),
        (FeatureStatus::Valid, None) => Err(format!("input feature {input} has no output")),
        (status, _) => Err(format!("input feature {input} is {status:?}")),
    }
}

fn execute_extrusion(
    state: &ExtrusionState,
    registry: &FeatureRegistry,
    params: &ParameterStore,
    evaluator: &mut dyn GeometryEvaluator,
    id: &FeatureId,
) -> Result<Geometry, String> {
    let profile = input_geometry(registry, &state.sketch_id)?;

    let target = if state.end_condition.requires_target() {
        let target_id = state
            .target_id
            .as_ref()
            .ok_or_else(|| format!("{:?} needs a target feature", state.end_condition))?;
        Some(input_geometry(registry, target_id)?)
    } else {
        None
    };

    let value = |name: &str, default: f64| params.value_or(&ParameterKey::new(id.clone(), name), default);
    let request = ExtrudeRequest {
        feature_id: id.clone(),
        profile,
        target,
        depth: value(extrusion_params::DEPTH, 10.0),
        direction: state.direction,
        end_condition: state.end_condition,
        draft: value(extrusion_params::DRAFT, 0.0),
        thin_walled: value(extrusion_params::THIN_WALLED, 0.0) != 0.0,
        wall_thickness: value(extrusion_params::WALL_THICKNESS, 1.0),
    };

    let handle = evaluator.extrude(&request).map_err(|e| e.to_string())?;
    debug!(feature = %id, handle = handle.0, depth = request.depth, "extrusion built");
    Ok(Geometry::Solid { handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Feature;
    use geometry_eval::MockEvaluator;

    fn setup() -> (FeatureRegistry, ParameterStore) {
        let mut registry = FeatureRegistry::new();
        let mut params = ParameterStore::new();
        registry
            .insert(Feature::new(FeatureId::new("sketch1"), "Sketch", FeatureVariant::Sketch))
            .unwrap();
        let state = ExtrusionState::new(FeatureId::new("sketch1"));
        for spec in state.parameter_specs() {
            params.insert(FeatureId::new("ext1"), spec.build()).unwrap();
        }
        registry
            .insert(Feature::new(
                FeatureId::new("ext1"),
                "Extrude",
                FeatureVariant::Extrusion(state),
            ))
            .unwrap();
        (registry, params)
    }

    #[test]
    fn extrusion_after_sketch_is_valid() {
        let (mut registry, params) = setup();
        let mut ev = MockEvaluator::new();
        let sketch = FeatureId::new("sketch1");
        let ext = FeatureId::new("ext1");

        assert_eq!(evaluate_feature(&mut registry, &params, &mut ev, &sketch), UpdateOutcome::Valid);
        assert_eq!(evaluate_feature(&mut registry, &params, &mut ev, &ext), UpdateOutcome::Valid);

        let feature = registry.get(&ext).unwrap();
        assert!(feature.is_valid());
        assert!(feature.output.as_ref().and_then(|g| g.solid_handle()).is_some());
        assert_eq!(ev.last_request(&ext).unwrap().depth, 10.0);
    }

    #[test]
    fn extrusion_without_valid_sketch_fails() {
        let (mut registry, params) = setup();
        let mut ev = MockEvaluator::new();
        let ext = FeatureId::new("ext1");

        let outcome = evaluate_feature(&mut registry, &params, &mut ev, &ext);
        assert!(matches!(outcome, UpdateOutcome::Failed { .. }));
        let feature = registry.get(&ext).unwrap();
        assert_eq!(feature.status, FeatureStatus::Error);
        assert!(feature.last_error.is_some());
    }

    #[test]
    fn failure_keeps_previous_output() {
        let (mut registry, mut params) = setup();
        let mut ev = MockEvaluator::new();
        let sketch = FeatureId::new("sketch1");
        let ext = FeatureId::new("ext1");
        evaluate_feature(&mut registry, &params, &mut ev, &sketch);
        evaluate_feature(&mut registry, &params, &mut ev, &ext);
        let before = registry.get(&ext).unwrap().output.clone();

        params.set(&ParameterKey::new("ext1", "depth"), 0.0).unwrap();
        let outcome = evaluate_feature(&mut registry, &params, &mut ev, &ext);
        assert!(matches!(outcome, UpdateOutcome::Failed { .. }));
        assert_eq!(registry.get(&ext).unwrap().output, before);
    }

    #[test]
    fn end_condition_parameter_drives_state() {
        let (mut registry, mut params) = setup();
        let mut ev = MockEvaluator::new();
        let sketch = FeatureId::new("sketch1");
        let ext = FeatureId::new("ext1");
        evaluate_feature(&mut registry, &params, &mut ev, &sketch);

        params.set(&ParameterKey::new("ext1", "endCondition"), 1.0).unwrap();
        params.set(&ParameterKey::new("ext1", "direction"), 2.0).unwrap();
        assert_eq!(evaluate_feature(&mut registry, &params, &mut ev, &ext), UpdateOutcome::Valid);

        let request = ev.last_request(&ext).unwrap();
        assert_eq!(request.end_condition, EndCondition::ThroughAll);
        assert_eq!(request.direction, ExtrudeDirection::Symmetric);
        match &registry.get(&ext).unwrap().variant {
            FeatureVariant::Extrusion(state) => {
                assert_eq!(state.end_condition, EndCondition::ThroughAll)
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn up_to_condition_without_target_fails() {
        let (mut registry, mut params) = setup();
        let mut ev = MockEvaluator::new();
        evaluate_feature(&mut registry, &params, &mut ev, &FeatureId::new("sketch1"));
        params.set(&ParameterKey::new("ext1", "endCondition"), 3.0).unwrap();

        let outcome = evaluate_feature(&mut registry, &params, &mut ev, &FeatureId::new("ext1"));
        assert!(matches!(outcome, UpdateOutcome::Failed { reason } if reason.contains("target")));
    }

    #[test]
    fn suppressed_and_missing() {
        let (mut registry, params) = setup();
        let mut ev = MockEvaluator::new();
        registry.set_suppressed(&FeatureId::new("sketch1"), true).unwrap();
        assert_eq!(
            evaluate_feature(&mut registry, &params, &mut ev, &FeatureId::new("sketch1")),
            UpdateOutcome::Skipped
        );
        assert_eq!(
            evaluate_feature(&mut registry, &params, &mut ev, &FeatureId::new("nope")),
            UpdateOutcome::Missing
        );
    }
}
