use std::collections::HashMap;

use model_types::{FeatureId, ParamType, ParameterKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expression::{self, ParameterLookup};
use crate::types::{CallbackId, EngineError};

/// Writes closer than this to the stored value are no-ops.
pub const VALUE_TOLERANCE: f64 = 1e-10;

/// Optional range and step of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
}

impl Bounds {
    pub const fn none() -> Self {
        Self {
            min: None,
            max: None,
            step: None,
        }
    }

    pub const fn range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            step: None,
        }
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }
}

/// Declaration of a parameter a feature variant registers on creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub value: f64,
    pub param_type: ParamType,
    pub bounds: Bounds,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, value: f64, param_type: ParamType, bounds: Bounds) -> Self {
        Self {
            name: name.into(),
            value,
            param_type,
            bounds,
        }
    }

    pub fn build(&self) -> Parameter {
        Parameter::new(self.name.clone(), self.value, self.param_type, self.bounds)
    }
}

/// A typed scalar with optional bounds and expression.
///
/// `min <= value <= max` always holds. Count values are integral and
/// Boolean values are 0 or 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    param_type: ParamType,
    value: f64,
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
    /// When set, `value` caches its last evaluation.
    expression: Option<String>,
}

impl Parameter {
    /// Build a parameter. The initial value is coerced and clamped into
    /// range rather than rejected. Percentages default to [0, 100].
    pub fn new(name: impl Into<String>, value: f64, param_type: ParamType, bounds: Bounds) -> Self {
        let (min, max) = match param_type {
            ParamType::Percentage => (bounds.min.or(Some(0.0)), bounds.max.or(Some(100.0))),
            _ => (bounds.min, bounds.max),
        };
        let mut param = Self {
            name: name.into(),
            param_type,
            value: 0.0,
            min,
            max,
            step: bounds.step,
            expression: None,
        };
        let seed = if value.is_nan() { 0.0 } else { value };
        param.value = param.clamp(param.coerce(seed));
        param
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_type(&self) -> ParamType {
        self.param_type
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn step(&self) -> Option<f64> {
        self.step
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            min: self.min,
            max: self.max,
            step: self.step,
        }
    }

    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    pub fn is_constrained(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    pub(crate) fn set_expression_text(&mut self, expression: Option<String>) {
        self.expression = expression;
    }

    /// Type coercion applied to every candidate value.
    fn coerce(&self, value: f64) -> f64 {
        match self.param_type {
            ParamType::Count => value.round(),
            ParamType::Boolean => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            _ => value,
        }
    }

    fn clamp(&self, mut value: f64) -> f64 {
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        value
    }

    fn check_bounds(&self, key: &ParameterKey, value: f64) -> Result<(), EngineError> {
        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        if below || above {
            return Err(EngineError::OutOfRange {
                key: key.clone(),
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

type Subscriber = Box<dyn FnMut(f64)>;

struct Entry {
    param: Parameter,
    subscribers: Vec<(CallbackId, Subscriber)>,
}

/// Authoritative storage for every parameter in a model.
pub struct ParameterStore {
    entries: HashMap<ParameterKey, Entry>,
    /// Parameter names per feature, in creation order.
    order: HashMap<FeatureId, Vec<String>>,
    tolerance: f64,
    next_callback: u64,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::with_tolerance(VALUE_TOLERANCE)
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            entries: HashMap::new(),
            order: HashMap::new(),
            tolerance,
            next_callback: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ParameterKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Create a parameter. The initial value is clamped into range.
    pub fn create(
        &mut self,
        key: ParameterKey,
        value: f64,
        param_type: ParamType,
        bounds: Bounds,
    ) -> Result<(), EngineError> {
        if !value.is_finite() {
            return Err(EngineError::NotFinite { key });
        }
        let param = Parameter::new(key.name.clone(), value, param_type, bounds);
        self.insert(key.feature_id, param)
    }

    /// Create a parameter whose value comes from `text`. Returns the stored value.
    pub fn create_expression(
        &mut self,
        key: ParameterKey,
        text: &str,
        param_type: ParamType,
        bounds: Bounds,
    ) -> Result<f64, EngineError> {
        if self.contains(&key) {
            return Err(EngineError::DuplicateParameter { key });
        }
        let value = expression::evaluate(text, &key, &*self).map_err(|source| {
            EngineError::Expression {
                key: key.clone(),
                source,
            }
        })?;
        let mut param = Parameter::new(key.name.clone(), value, param_type, bounds);
        param.set_expression_text(Some(text.to_string()));
        let stored = param.value();
        self.insert(key.feature_id, param)?;
        Ok(stored)
    }

    /// Add a complete parameter record under `feature_id`.
    pub fn insert(&mut self, feature_id: FeatureId, param: Parameter) -> Result<(), EngineError> {
        let key = ParameterKey::new(feature_id.clone(), param.name());
        if self.entries.contains_key(&key) {
            return Err(EngineError::DuplicateParameter { key });
        }
        debug!(param = %key, value = param.value(), "parameter created");
        self.order
            .entry(feature_id)
            .or_default()
            .push(param.name().to_string());
        self.entries.insert(
            key,
            Entry {
                param,
                subscribers: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove a parameter. Its subscribers are dropped.
    pub fn remove(&mut self, key: &ParameterKey) -> Result<Parameter, EngineError> {
        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        if let Some(names) = self.order.get_mut(&key.feature_id) {
            names.retain(|n| n != &key.name);
            if names.is_empty() {
                self.order.remove(&key.feature_id);
            }
        }
        Ok(entry.param)
    }

    /// Remove every parameter of a feature, returned in creation order.
    pub fn remove_feature(&mut self, feature_id: &FeatureId) -> Vec<Parameter> {
        let names = self.order.remove(feature_id).unwrap_or_default();
        names
            .into_iter()
            .filter_map(|name| {
                self.entries
                    .remove(&ParameterKey::new(feature_id.clone(), name))
                    .map(|e| e.param)
            })
            .collect()
    }

    pub fn get(&self, key: &ParameterKey) -> Option<&Parameter> {
        self.entries.get(key).map(|e| &e.param)
    }

    pub fn value(&self, key: &ParameterKey) -> Option<f64> {
        self.get(key).map(Parameter::value)
    }

    /// Current value, or `default` when the key is absent.
    pub fn value_or(&self, key: &ParameterKey, default: f64) -> f64 {
        self.value(key).unwrap_or(default)
    }

    pub fn expression(&self, key: &ParameterKey) -> Option<&str> {
        self.get(key).and_then(Parameter::expression)
    }

    /// Parameters of one feature, in creation order.
    pub fn parameters(&self, feature_id: &FeatureId) -> Vec<&Parameter> {
        self.keys(feature_id)
            .iter()
            .filter_map(|k| self.get(k))
            .collect()
    }

    pub fn keys(&self, feature_id: &FeatureId) -> Vec<ParameterKey> {
        self.order
            .get(feature_id)
            .map(|names| {
                names
                    .iter()
                    .map(|n| ParameterKey::new(feature_id.clone(), n.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Write a literal value. Clears any expression on success.
    ///
    /// Returns whether the stored value changed.
    pub fn set(&mut self, key: &ParameterKey, value: f64) -> Result<bool, EngineError> {
        let changed = self.write(key, value)?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.param.set_expression_text(None);
        }
        Ok(changed)
    }

    /// Attach an expression and write its value.
    ///
    /// A failed parse, evaluation or bounds check leaves the parameter untouched.
    pub fn set_expression(&mut self, key: &ParameterKey, text: &str) -> Result<bool, EngineError> {
        if !self.contains(key) {
            return Err(EngineError::ParameterNotFound { key: key.clone() });
        }
        let candidate = expression::evaluate(text, key, &*self).map_err(|source| {
            EngineError::Expression {
                key: key.clone(),
                source,
            }
        })?;
        let changed = self.write(key, candidate)?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.param.set_expression_text(Some(text.to_string()));
        }
        Ok(changed)
    }

    /// The value `set(key, candidate)` would store, without storing it.
    pub fn validate(&self, key: &ParameterKey, candidate: f64) -> Result<f64, EngineError> {
        let param = self
            .get(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        if !candidate.is_finite() {
            return Err(EngineError::NotFinite { key: key.clone() });
        }
        let value = param.coerce(candidate);
        param.check_bounds(key, value)?;
        Ok(value)
    }

    /// Put back a captured value and expression exactly, without evaluating.
    pub(crate) fn restore(
        &mut self,
        key: &ParameterKey,
        value: f64,
        expression: Option<&str>,
    ) -> Result<bool, EngineError> {
        let tolerance = self.tolerance;
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        entry.param.set_expression_text(expression.map(str::to_string));
        if (value - entry.param.value).abs() <= tolerance {
            return Ok(false);
        }
        entry.param.value = value;
        debug!(param = %key, value, "parameter restored");
        for (_, callback) in entry.subscribers.iter_mut() {
            callback(value);
        }
        Ok(true)
    }

    /// Coerce, bounds-check and store. Subscribers fire only on a real change.
    fn write(&mut self, key: &ParameterKey, candidate: f64) -> Result<bool, EngineError> {
        let tolerance = self.tolerance;
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        if !candidate.is_finite() {
            return Err(EngineError::NotFinite { key: key.clone() });
        }

        let value = entry.param.coerce(candidate);
        entry.param.check_bounds(key, value)?;

        if (value - entry.param.value).abs() <= tolerance {
            return Ok(false);
        }

        entry.param.value = value;
        debug!(param = %key, value, subscribers = entry.subscribers.len(), "parameter changed");
        for (_, callback) in entry.subscribers.iter_mut() {
            callback(value);
        }
        Ok(true)
    }

    /// Register a callback fired after each change of `key`.
    pub fn subscribe(
        &mut self,
        key: &ParameterKey,
        callback: impl FnMut(f64) + 'static,
    ) -> Result<CallbackId, EngineError> {
        let id = CallbackId(self.next_callback);
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        entry.subscribers.push((id, Box::new(callback)));
        self.next_callback += 1;
        Ok(id)
    }

    pub fn unsubscribe(&mut self, key: &ParameterKey, id: CallbackId) -> Result<(), EngineError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| EngineError::ParameterNotFound { key: key.clone() })?;
        let before = entry.subscribers.len();
        entry.subscribers.retain(|(cb, _)| *cb != id);
        if entry.subscribers.len() == before {
            return Err(EngineError::CallbackNotFound { id });
        }
        Ok(())
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterLookup for ParameterStore {
    fn lookup(&self, key: &ParameterKey) -> Option<(f64, Option<&str>)> {
        self.get(key).map(|p| (p.value(), p.expression()))
    }
}
