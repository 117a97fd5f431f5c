//! Tabular view over configurations: parameter keys as rows, configuration
//! names as columns.
//!
//! CSV layout:
//!
//! ```text
//! Parameter,Default,Tall
//! ext1:depth,10,100
//! ext1:draft,0,5
//! ```
//!
//! Empty cells leave the pair unset. Malformed cells and row keys are
//! skipped on import.

use std::collections::HashMap;
use std::path::Path;

use model_types::ParameterKey;
use tracing::{debug, info};

use crate::configuration::ConfigurationManager;
use crate::params::ParameterStore;
use crate::types::EngineError;

const CORNER: &str = "Parameter";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesignTable {
    parameters: Vec<ParameterKey>,
    configurations: Vec<String>,
    values: HashMap<String, HashMap<ParameterKey, f64>>,
}

fn parse_error(reason: impl Into<String>) -> EngineError {
    EngineError::Parse {
        reason: reason.into(),
    }
}

fn csv_error(e: csv::Error) -> EngineError {
    if e.is_io_error() {
        EngineError::Io {
            reason: e.to_string(),
        }
    } else {
        parse_error(e.to_string())
    }
}

impl DesignTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameters(&self) -> &[ParameterKey] {
        &self.parameters
    }

    pub fn configurations(&self) -> &[String] {
        &self.configurations
    }

    pub fn has_parameter(&self, key: &ParameterKey) -> bool {
        self.parameters.contains(key)
    }

    pub fn has_configuration(&self, name: &str) -> bool {
        self.configurations.iter().any(|c| c == name)
    }

    pub fn clear(&mut self) {
        self.parameters.clear();
        self.configurations.clear();
        self.values.clear();
    }

    /// Add a row. Each column is seeded from its configuration, falling back
    /// to the store's current value.
    pub fn add_parameter(
        &mut self,
        key: ParameterKey,
        manager: &ConfigurationManager,
        params: &ParameterStore,
    ) -> Result<(), EngineError> {
        if self.has_parameter(&key) {
            return Err(EngineError::DuplicateTableEntry {
                entry: format!("parameter {key}"),
            });
        }
        for name in &self.configurations {
            let seed = manager
                .get(name)
                .and_then(|c| c.value(&key))
                .or_else(|| params.value(&key));
            if let Some(value) = seed {
                self.values
                    .entry(name.clone())
                    .or_default()
                    .insert(key.clone(), value);
            }
        }
        self.parameters.push(key);
        Ok(())
    }

    pub fn remove_parameter(&mut self, key: &ParameterKey) -> Result<(), EngineError> {
        let index = self
            .parameters
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| EngineError::TableEntryNotFound {
                entry: format!("parameter {key}"),
            })?;
        self.parameters.remove(index);
        for column in self.values.values_mut() {
            column.remove(key);
        }
        Ok(())
    }

    /// Add a column, creating the configuration in `manager` if it does not
    /// exist yet. Cells are seeded like [`DesignTable::add_parameter`].
    pub fn add_configuration(
        &mut self,
        name: &str,
        manager: &mut ConfigurationManager,
        params: &ParameterStore,
    ) -> Result<(), EngineError> {
        if self.has_configuration(name) {
            return Err(EngineError::DuplicateTableEntry {
                entry: format!("configuration {name}"),
            });
        }
        if !manager.contains(name) {
            manager.create(name, "")?;
        }
        let config = manager.get(name);
        let column = self.values.entry(name.to_string()).or_default();
        for key in &self.parameters {
            let seed = config
                .and_then(|c| c.value(key))
                .or_else(|| params.value(key));
            if let Some(value) = seed {
                column.insert(key.clone(), value);
            }
        }
        self.configurations.push(name.to_string());
        Ok(())
    }

    /// Drop a column. The configuration itself is left alone.
    pub fn remove_configuration(&mut self, name: &str) -> Result<(), EngineError> {
        let index = self
            .configurations
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| EngineError::TableEntryNotFound {
                entry: format!("configuration {name}"),
            })?;
        self.configurations.remove(index);
        self.values.remove(name);
        Ok(())
    }

    /// Move a column and its cells to a new name, keeping its position.
    pub fn rename_configuration(&mut self, old: &str, new: &str) -> Result<(), EngineError> {
        if old == new {
            return Ok(());
        }
        if self.has_configuration(new) {
            return Err(EngineError::DuplicateTableEntry {
                entry: format!("configuration {new}"),
            });
        }
        let column = self
            .configurations
            .iter_mut()
            .find(|c| c.as_str() == old)
            .ok_or_else(|| EngineError::TableEntryNotFound {
                entry: format!("configuration {old}"),
            })?;
        *column = new.to_string();
        if let Some(cells) = self.values.remove(old) {
            self.values.insert(new.to_string(), cells);
        }
        Ok(())
    }

    /// Set one cell. Unknown parameters become new rows.
    pub fn set_cell(
        &mut self,
        configuration: &str,
        key: &ParameterKey,
        value: f64,
    ) -> Result<(), EngineError> {
        if !self.has_configuration(configuration) {
            return Err(EngineError::TableEntryNotFound {
                entry: format!("configuration {configuration}"),
            });
        }
        if !self.has_parameter(key) {
            self.parameters.push(key.clone());
        }
        self.values
            .entry(configuration.to_string())
            .or_default()
            .insert(key.clone(), value);
        Ok(())
    }

    pub fn cell(&self, configuration: &str, key: &ParameterKey) -> Option<f64> {
        self.values
            .get(configuration)
            .and_then(|column| column.get(key))
            .copied()
    }

    pub fn cell_or(&self, configuration: &str, key: &ParameterKey, default: f64) -> f64 {
        self.cell(configuration, key).unwrap_or(default)
    }

    /// Rebuild the whole table from the manager's configurations.
    pub fn update_from_configurations(&mut self, manager: &ConfigurationManager) {
        self.clear();
        for config in manager.iter() {
            let column = self.values.entry(config.name().to_string()).or_default();
            for (key, value) in config.values() {
                column.insert(key.clone(), *value);
                if !self.parameters.contains(key) {
                    self.parameters.push(key.clone());
                }
            }
            self.configurations.push(config.name().to_string());
        }
        debug!(
            parameters = self.parameters.len(),
            configurations = self.configurations.len(),
            "design table rebuilt from configurations"
        );
    }

    /// Push the table's cells into the manager, creating missing
    /// configurations. Keys outside the table are left as they are.
    pub fn update_configurations(&self, manager: &mut ConfigurationManager) -> Result<(), EngineError> {
        for name in &self.configurations {
            if !manager.contains(name) {
                manager.create(name, "")?;
            }
            let config = manager.require_mut(name)?;
            for key in &self.parameters {
                if let Some(value) = self.cell(name, key) {
                    config.set_value(key.clone(), value);
                }
            }
        }
        Ok(())
    }

    pub fn to_csv(&self) -> Result<String, EngineError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(false)
            .from_writer(Vec::new());

        let mut header = vec![CORNER.to_string()];
        header.extend(self.configurations.iter().cloned());
        writer.write_record(&header).map_err(csv_error)?;

        for key in &self.parameters {
            let mut row = vec![key.to_string()];
            row.extend(
                self.configurations
                    .iter()
                    .map(|name| self.cell(name, key).map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&row).map_err(csv_error)?;
        }

        let bytes = writer.into_inner().map_err(|e| EngineError::Io {
            reason: e.to_string(),
        })?;
        String::from_utf8(bytes).map_err(|e| parse_error(e.to_string()))
    }

    /// Replace the table with the contents of `text`.
    pub fn import_csv(&mut self, text: &str) -> Result<(), EngineError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let mut records = reader.records();

        let header = records
            .next()
            .ok_or_else(|| parse_error("design table CSV has no header row"))?
            .map_err(csv_error)?;

        self.clear();
        let columns: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
        for name in &columns {
            if !name.is_empty() && !self.has_configuration(name) {
                self.configurations.push(name.clone());
                self.values.entry(name.clone()).or_default();
            }
        }

        for record in records {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable design table row");
                    continue;
                }
            };
            let Some(key) = record.get(0).and_then(ParameterKey::parse) else {
                debug!(row = ?record.get(0), "skipping design table row without a parameter key");
                continue;
            };
            if !self.has_parameter(&key) {
                self.parameters.push(key.clone());
            }
            for (cell, name) in record.iter().skip(1).zip(&columns) {
                if cell.is_empty() || name.is_empty() {
                    continue;
                }
                match cell.parse::<f64>() {
                    Ok(value) => {
                        self.values
                            .entry(name.clone())
                            .or_default()
                            .insert(key.clone(), value);
                    }
                    Err(_) => debug!(configuration = %name, param = %key, cell, "skipping malformed cell"),
                }
            }
        }
        info!(
            parameters = self.parameters.len(),
            configurations = self.configurations.len(),
            "design table imported"
        );
        Ok(())
    }

    pub fn export_csv_file(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        std::fs::write(path, self.to_csv()?)?;
        Ok(())
    }

    pub fn import_csv_file(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let text = std::fs::read_to_string(path)?;
        self.import_csv(&text)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from("DesignTable:\nParameters:\n");
        for key in &self.parameters {
            out.push_str(&format!("{key}\n"));
        }
        out.push_str("Configurations:\n");
        for name in &self.configurations {
            out.push_str(&format!("{name}\n"));
        }
        out.push_str("Values:\n");
        for name in &self.configurations {
            for key in &self.parameters {
                if let Some(value) = self.cell(name, key) {
                    out.push_str(&format!("{name},{key},{value}\n"));
                }
            }
        }
        out
    }

    pub fn deserialize(text: &str) -> Result<Self, EngineError> {
        enum Section {
            Parameters,
            Configurations,
            Values,
        }

        let mut lines = text.lines();
        if lines.next() != Some("DesignTable:") {
            return Err(parse_error("expected 'DesignTable:'"));
        }
        let mut table = DesignTable::new();
        let mut section = None;
        for line in lines {
            match line {
                "Parameters:" => section = Some(Section::Parameters),
                "Configurations:" => section = Some(Section::Configurations),
                "Values:" => section = Some(Section::Values),
                "" => {}
                _ => match section {
                    Some(Section::Parameters) => {
                        if let Some(key) = ParameterKey::parse(line) {
                            if !table.has_parameter(&key) {
                                table.parameters.push(key);
                            }
                        }
                    }
                    Some(Section::Configurations) => {
                        if !table.has_configuration(line) {
                            table.configurations.push(line.to_string());
                        }
                    }
                    Some(Section::Values) => {
                        let mut parts = line.splitn(3, ',');
                        let (Some(name), Some(key), Some(value)) =
                            (parts.next(), parts.next(), parts.next())
                        else {
                            continue;
                        };
                        let (Some(key), Ok(value)) = (ParameterKey::parse(key), value.parse::<f64>())
                        else {
                            continue;
                        };
                        if table.has_configuration(name) && table.has_parameter(&key) {
                            table
                                .values
                                .entry(name.to_string())
                                .or_default()
                                .insert(key, value);
                        }
                    }
                    None => return Err(parse_error(format!("unexpected line '{line}'"))),
                },
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Bounds;
    use crate::types::ErrorKind;
    use model_types::ParamType;

    fn key(s: &str) -> ParameterKey {
        ParameterKey::parse(s).unwrap()
    }

    fn store() -> ParameterStore {
        let mut ps = ParameterStore::new();
        ps.create(key("ext1:depth"), 10.0, ParamType::Length, Bounds::none()).unwrap();
        ps.create(key("ext1:draft"), 0.0, ParamType::Angle, Bounds::none()).unwrap();
        ps
    }

    fn table() -> (DesignTable, ConfigurationManager) {
        let ps = store();
        let mut manager = ConfigurationManager::new();
        let mut t = DesignTable::new();
        t.add_configuration("Default", &mut manager, &ps).unwrap();
        t.add_configuration("Tall", &mut manager, &ps).unwrap();
        t.add_parameter(key("ext1:depth"), &manager, &ps).unwrap();
        t.add_parameter(key("ext1:draft"), &manager, &ps).unwrap();
        t.set_cell("Tall", &key("ext1:depth"), 100.0).unwrap();
        t.set_cell("Tall", &key("ext1:draft"), 5.0).unwrap();
        (t, manager)
    }

    #[test]
    fn renamed_column_keeps_cells_and_position() {
        let (mut t, _) = table();
        t.rename_configuration("Tall", "Taller").unwrap();
        assert_eq!(t.configurations(), ["Default", "Taller"]);
        assert!(!t.has_configuration("Tall"));
        assert_eq!(t.cell("Taller", &key("ext1:depth")), Some(100.0));

        let err = t.rename_configuration("Taller", "Default").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        let err = t.rename_configuration("Ghost", "Other").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn seeding_prefers_configuration_over_store() {
        let ps = store();
        let mut manager = ConfigurationManager::new();
        manager.create("Tall", "").unwrap();
        manager.require_mut("Tall").unwrap().set_value(key("ext1:depth"), 77.0);

        let mut t = DesignTable::new();
        t.add_configuration("Tall", &mut manager, &ps).unwrap();
        t.add_configuration("New", &mut manager, &ps).unwrap();
        assert!(manager.contains("New"));

        t.add_parameter(key("ext1:depth"), &manager, &ps).unwrap();
        assert_eq!(t.cell("Tall", &key("ext1:depth")), Some(77.0));
        assert_eq!(t.cell("New", &key("ext1:depth")), Some(10.0));
        assert!(matches!(
            t.add_parameter(key("ext1:depth"), &manager, &ps),
            Err(EngineError::DuplicateTableEntry { .. })
        ));
    }

    #[test]
    fn set_cell_adds_unknown_parameter() {
        let (mut t, _) = table();
        t.set_cell("Default", &key("ext2:depth"), 3.0).unwrap();
        assert_eq!(t.parameters().len(), 3);
        assert_eq!(t.cell("Tall", &key("ext2:depth")), None);
        assert!(matches!(
            t.set_cell("Wide", &key("ext1:depth"), 1.0),
            Err(EngineError::TableEntryNotFound { .. })
        ));
    }

    #[test]
    fn csv_round_trip() {
        let (mut t, _) = table();
        let csv = t.to_csv().unwrap();
        assert_eq!(csv, "Parameter,Default,Tall\next1:depth,10,100\next1:draft,0,5\n");

        t.clear();
        t.import_csv(&csv).unwrap();
        assert_eq!(t.configurations(), ["Default", "Tall"]);
        assert_eq!(t.cell("Default", &key("ext1:depth")), Some(10.0));
        assert_eq!(t.cell("Default", &key("ext1:draft")), Some(0.0));
        assert_eq!(t.cell("Tall", &key("ext1:depth")), Some(100.0));
        assert_eq!(t.cell("Tall", &key("ext1:draft")), Some(5.0));
    }

    #[test]
    fn import_skips_bad_cells_and_keys() {
        let mut t = DesignTable::new();
        t.import_csv("Parameter, A ,B\next1:depth,1,\nbogus,2,3\next1:draft,x,4\next1:w,5\n")
            .unwrap();
        assert_eq!(t.configurations(), ["A", "B"]);
        assert_eq!(t.parameters(), [key("ext1:depth"), key("ext1:draft"), key("ext1:w")]);
        assert_eq!(t.cell("A", &key("ext1:depth")), Some(1.0));
        assert_eq!(t.cell("B", &key("ext1:depth")), None);
        assert_eq!(t.cell("A", &key("ext1:draft")), None);
        assert_eq!(t.cell("B", &key("ext1:draft")), Some(4.0));
        assert_eq!(t.cell("A", &key("ext1:w")), Some(5.0));
        assert!(t.import_csv("").is_err());
    }

    #[test]
    fn sync_with_manager() {
        let (t, mut manager) = table();
        manager.require_mut("Tall").unwrap().set_value(key("ext9:other"), 1.0);
        t.update_configurations(&mut manager).unwrap();
        let tall = manager.get("Tall").unwrap();
        assert_eq!(tall.value(&key("ext1:depth")), Some(100.0));
        assert_eq!(tall.value(&key("ext9:other")), Some(1.0));

        let mut rebuilt = DesignTable::new();
        rebuilt.update_from_configurations(&manager);
        assert_eq!(rebuilt.configurations(), ["Default", "Tall"]);
        assert_eq!(rebuilt.cell("Tall", &key("ext9:other")), Some(1.0));
        assert_eq!(rebuilt.cell("Default", &key("ext1:depth")), Some(10.0));
    }

    #[test]
    fn remove_rows_and_columns() {
        let (mut t, manager) = table();
        t.remove_configuration("Tall").unwrap();
        assert!(manager.contains("Tall"));
        assert_eq!(t.cell("Tall", &key("ext1:depth")), None);
        t.remove_parameter(&key("ext1:draft")).unwrap();
        assert_eq!(t.parameters(), [key("ext1:depth")]);
        assert!(t.remove_parameter(&key("ext1:draft")).is_err());
        assert!(t.remove_configuration("Tall").is_err());
    }

    #[test]
    fn internal_text_round_trip() {
        let (t, _) = table();
        let text = t.serialize();
        assert!(text.starts_with("DesignTable:\nParameters:\next1:depth\next1:draft\nConfigurations:\n"));
        assert!(text.contains("Values:\nDefault,ext1:depth,10\n"));
        assert_eq!(DesignTable::deserialize(&text).unwrap(), t);
    }
}
