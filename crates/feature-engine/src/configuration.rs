//! Named parameter snapshots and the manager that owns them.
//!
//! Text form of one configuration:
//!
//! ```text
//! Configuration:
//! Name: Tall
//! Description: Tall variant
//! Parameters:
//! ext1:depth = 100.000000
//! ```

use std::collections::BTreeMap;

use model_types::{FeatureId, ParameterKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::params::ParameterStore;
use crate::types::{CallbackId, EngineError};

/// A named, possibly partial, assignment of parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    name: String,
    description: String,
    values: BTreeMap<ParameterKey, f64>,
}

impl Configuration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn set_value(&mut self, key: ParameterKey, value: f64) {
        self.values.insert(key, value);
    }

    pub fn value(&self, key: &ParameterKey) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn value_or(&self, key: &ParameterKey, default: f64) -> f64 {
        self.value(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &ParameterKey) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove_value(&mut self, key: &ParameterKey) -> Option<f64> {
        self.values.remove(key)
    }

    pub fn clear_values(&mut self) {
        self.values.clear();
    }

    /// Stored values, ordered by key.
    pub fn values(&self) -> &BTreeMap<ParameterKey, f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("Configuration:\n");
        out.push_str(&format!("Name: {}\n", self.name));
        out.push_str(&format!("Description: {}\n", self.description));
        out.push_str("Parameters:\n");
        for (key, value) in &self.values {
            out.push_str(&format!("{key} = {value:.6}\n"));
        }
        out
    }

    /// Parse the text form. Headers must be intact; parameter lines that do
    /// not parse are skipped. Parameters end at a blank line.
    pub fn deserialize(text: &str) -> Result<Self, EngineError> {
        let mut lines = text.lines();
        let mut header = |expected: &str| -> Result<String, EngineError> {
            let line = lines.next().unwrap_or_default();
            line.strip_prefix(expected)
                .map(str::to_string)
                .ok_or_else(|| EngineError::Parse {
                    reason: format!("expected '{expected}', found '{line}'"),
                })
        };

        header("Configuration:")?;
        let name = header("Name: ")?;
        let description = header("Description: ")?;
        header("Parameters:")?;

        let mut config = Configuration::new(name, description);
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(" = ") else {
                continue;
            };
            let (Some(key), Ok(value)) = (ParameterKey::parse(key.trim()), value.trim().parse::<f64>())
            else {
                debug!(line, "skipping malformed configuration line");
                continue;
            };
            config.set_value(key, value);
        }
        Ok(config)
    }
}

type ActiveListener = Box<dyn FnMut(Option<&str>)>;

/// Owns every configuration of a model and tracks which one is active.
pub struct ConfigurationManager {
    /// Insertion order.
    configurations: Vec<Configuration>,
    active: Option<String>,
    listeners: Vec<(CallbackId, ActiveListener)>,
    next_listener: u64,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self {
            configurations: Vec::new(),
            active: None,
            listeners: Vec::new(),
            next_listener: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.configurations.iter().position(|c| c.name == name)
    }

    fn not_found(name: &str) -> EngineError {
        EngineError::ConfigurationNotFound {
            name: name.to_string(),
        }
    }

    /// Create an empty configuration. The first one becomes active.
    pub fn create(&mut self, name: &str, description: &str) -> Result<(), EngineError> {
        if self.contains(name) {
            return Err(EngineError::DuplicateConfiguration {
                name: name.to_string(),
            });
        }
        self.configurations.push(Configuration::new(name, description));
        debug!(configuration = name, "configuration created");
        if self.configurations.len() == 1 {
            self.active = Some(name.to_string());
            self.notify();
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Configuration> {
        self.configurations.iter_mut().find(|c| c.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&Configuration, EngineError> {
        self.get(name).ok_or_else(|| Self::not_found(name))
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut Configuration, EngineError> {
        self.get_mut(name).ok_or_else(|| Self::not_found(name))
    }

    /// Configurations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Configuration> {
        self.configurations.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.configurations.iter().map(|c| c.name.as_str()).collect()
    }

    /// Remove a configuration. If it was active, the first remaining one
    /// takes over, or nothing is active.
    pub fn remove(&mut self, name: &str) -> Result<Configuration, EngineError> {
        let index = self.position(name).ok_or_else(|| Self::not_found(name))?;
        let removed = self.configurations.remove(index);
        if self.active.as_deref() == Some(name) {
            self.active = self.configurations.first().map(|c| c.name.clone());
            self.notify();
        }
        Ok(removed)
    }

    /// Rename in place, keeping values and position.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), EngineError> {
        let index = self.position(old).ok_or_else(|| Self::not_found(old))?;
        if self.contains(new) {
            return Err(EngineError::DuplicateConfiguration {
                name: new.to_string(),
            });
        }
        self.configurations[index].name = new.to_string();
        if self.active.as_deref() == Some(old) {
            self.active = Some(new.to_string());
            self.notify();
        }
        Ok(())
    }

    pub fn active(&self) -> Option<&Configuration> {
        self.active.as_deref().and_then(|name| self.get(name))
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Listeners fire only when the active name actually changes.
    pub fn set_active(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.contains(name) {
            return Err(Self::not_found(name));
        }
        if self.active.as_deref() != Some(name) {
            info!(configuration = name, "active configuration changed");
            self.active = Some(name.to_string());
            self.notify();
        }
        Ok(())
    }

    /// Capture current store values into `name`.
    ///
    /// With an empty filter every parameter of every listed feature is
    /// captured; otherwise only the filtered keys that exist in the store.
    /// Returns how many values were written.
    pub fn update_from_model(
        &mut self,
        name: &str,
        params: &ParameterStore,
        features: &[FeatureId],
        filter: &[ParameterKey],
    ) -> Result<usize, EngineError> {
        let config = self.require_mut(name)?;
        let mut written = 0;
        if filter.is_empty() {
            for feature in features {
                for key in params.keys(feature) {
                    if let Some(value) = params.value(&key) {
                        config.set_value(key, value);
                        written += 1;
                    }
                }
            }
        } else {
            for key in filter {
                match params.value(key) {
                    Some(value) => {
                        config.set_value(key.clone(), value);
                        written += 1;
                    }
                    None => debug!(param = %key, "not in store, not captured"),
                }
            }
        }
        debug!(configuration = name, written, "configuration captured from model");
        Ok(written)
    }

    /// Register a callback fired with the new active name.
    pub fn subscribe(&mut self, listener: impl FnMut(Option<&str>) + 'static) -> CallbackId {
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
        let active = self.active.as_deref();
        for (_, listener) in self.listeners.iter_mut() {
            listener(active);
        }
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("ConfigurationManager:\n");
        out.push_str(&format!(
            "ActiveConfiguration: {}\n",
            self.active.as_deref().unwrap_or_default()
        ));
        out.push_str("Configurations:\n");
        for config in &self.configurations {
            out.push_str(&config.serialize());
            out.push('\n');
        }
        out
    }

    /// Replace every configuration with the ones in `text`.
    ///
    /// Blocks that fail to parse are dropped. An active name that no longer
    /// exists falls back to the first configuration.
    pub fn load(&mut self, text: &str) -> Result<(), EngineError> {
        let mut lines = text.lines();
        let mut next = |expected: &str| -> Result<String, EngineError> {
            let line = lines.next().unwrap_or_default();
            line.strip_prefix(expected)
                .map(str::to_string)
                .ok_or_else(|| EngineError::Parse {
                    reason: format!("expected '{expected}', found '{line}'"),
                })
        };
        next("ConfigurationManager:")?;
        let active = next("ActiveConfiguration: ")?;
        next("Configurations:")?;

        let mut blocks: Vec<String> = Vec::new();
        for line in lines {
            if line == "Configuration:" {
                blocks.push(String::new());
            }
            if let Some(block) = blocks.last_mut() {
                block.push_str(line);
                block.push('\n');
            }
        }

        let mut configurations: Vec<Configuration> = Vec::new();
        for block in &blocks {
            match Configuration::deserialize(block) {
                Ok(config) => match configurations.iter_mut().find(|c| c.name == config.name) {
                    Some(existing) => *existing = config,
                    None => configurations.push(config),
                },
                Err(e) => debug!(error = %e, "skipping configuration block"),
            }
        }

        self.configurations = configurations;
        self.active = if self.contains(&active) {
            Some(active)
        } else {
            self.configurations.first().map(|c| c.name.clone())
        };
        info!(count = self.configurations.len(), "configurations loaded");
        self.notify();
        Ok(())
    }
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Bounds;
    use model_types::ParamType;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn key(s: &str) -> ParameterKey {
        ParameterKey::parse(s).unwrap()
    }

    #[test]
    fn configuration_text_format() {
        let mut c = Configuration::new("Tall", "Tall variant");
        c.set_value(key("ext1:depth"), 100.0);
        c.set_value(key("ext1:draft"), 2.5);
        assert_eq!(
            c.serialize(),
            "Configuration:\nName: Tall\nDescription: Tall variant\nParameters:\n\
             ext1:depth = 100.000000\next1:draft = 2.500000\n"
        );
        assert_eq!(Configuration::deserialize(&c.serialize()).unwrap(), c);
    }

    #[test]
    fn tolerant_parameter_parsing() {
        let text = "Configuration:\nName: A\nDescription: \nParameters:\n\
                    ext1:depth = 5.000000\nnot a line\nnocolon = 1.0\next1:draft = abc\n\n\
                    ext1:late = 9.0\n";
        let c = Configuration::deserialize(text).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.value(&key("ext1:depth")), Some(5.0));
        assert_eq!(c.description(), "");
    }

    #[test]
    fn broken_header_is_rejected() {
        assert!(Configuration::deserialize("Configuration:\nName: A\nParameters:\n").is_err());
        assert!(Configuration::deserialize("").is_err());
    }

    #[test]
    fn first_configuration_becomes_active() {
        let mut m = ConfigurationManager::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        m.subscribe(move |name| sink.borrow_mut().push(name.map(str::to_string)));

        m.create("A", "").unwrap();
        m.create("B", "").unwrap();
        assert_eq!(m.active_name(), Some("A"));
        assert!(matches!(
            m.create("A", ""),
            Err(EngineError::DuplicateConfiguration { .. })
        ));

        m.set_active("A").unwrap();
        m.set_active("B").unwrap();
        assert_eq!(*seen.borrow(), vec![Some("A".to_string()), Some("B".to_string())]);
    }

    #[test]
    fn removing_active_falls_back_in_insertion_order() {
        let mut m = ConfigurationManager::new();
        for n in ["A", "B", "C"] {
            m.create(n, "").unwrap();
        }
        m.set_active("B").unwrap();
        m.remove("B").unwrap();
        assert_eq!(m.active_name(), Some("A"));
        m.remove("A").unwrap();
        m.remove("C").unwrap();
        assert_eq!(m.active_name(), None);
        assert!(m.active().is_none());
    }

    #[test]
    fn rename_keeps_values_and_active() {
        let mut m = ConfigurationManager::new();
        m.create("A", "first").unwrap();
        m.create("B", "").unwrap();
        m.require_mut("A").unwrap().set_value(key("f:x"), 3.0);

        m.rename("A", "Z").unwrap();
        assert_eq!(m.names(), ["Z", "B"]);
        assert_eq!(m.active_name(), Some("Z"));
        let z = m.get("Z").unwrap();
        assert_eq!(z.value(&key("f:x")), Some(3.0));
        assert_eq!(z.description(), "first");

        assert!(matches!(
            m.rename("Z", "B"),
            Err(EngineError::DuplicateConfiguration { .. })
        ));
        assert!(matches!(
            m.rename("nope", "Q"),
            Err(EngineError::ConfigurationNotFound { .. })
        ));
    }

    #[test]
    fn capture_from_model() {
        let mut ps = ParameterStore::new();
        ps.create(key("ext1:depth"), 10.0, ParamType::Length, Bounds::none()).unwrap();
        ps.create(key("ext1:draft"), 1.0, ParamType::Angle, Bounds::none()).unwrap();
        let features = [FeatureId::new("ext1")];

        let mut m = ConfigurationManager::new();
        m.create("A", "").unwrap();
        m.create("B", "").unwrap();
        assert_eq!(m.update_from_model("A", &ps, &features, &[]).unwrap(), 2);
        assert_eq!(
            m.update_from_model("B", &ps, &features, &[key("ext1:draft"), key("ext1:nope")])
                .unwrap(),
            1
        );
        assert_eq!(m.get("B").unwrap().values().len(), 1);
        assert!(m.update_from_model("C", &ps, &features, &[]).is_err());
    }

    #[test]
    fn manager_text_round_trip() {
        let mut m = ConfigurationManager::new();
        m.create("Default", "Default configuration").unwrap();
        m.create("Tall", "").unwrap();
        m.require_mut("Tall").unwrap().set_value(key("ext1:depth"), 100.0);
        m.set_active("Tall").unwrap();

        let text = m.serialize();
        assert!(text.starts_with("ConfigurationManager:\nActiveConfiguration: Tall\nConfigurations:\n"));

        let mut loaded = ConfigurationManager::new();
        loaded.load(&text).unwrap();
        assert_eq!(loaded.names(), ["Default", "Tall"]);
        assert_eq!(loaded.active_name(), Some("Tall"));
        assert_eq!(loaded.get("Tall"), m.get("Tall"));
    }
}
