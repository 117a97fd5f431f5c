//! Self-contained feature snapshots and their line-based text form.
//!
//! ```text
//! id=ext1
//! name=Extrude 1
//! status=1
//! kind=Extrusion
//! sketchId=sketch1
//! direction=0
//! endCondition=0
//! targetFeatureId=
//! dependencies=sketch1
//! dependents=
//! position=1
//! param.depth=10
//! meta.depth=Length,0,,
//! expr.depth={ext1:base} * 2
//! ```
//!
//! Unknown keys are ignored when reading.

use std::collections::HashMap;

use model_types::{EndCondition, ExtrudeDirection, FeatureId, FeatureKind, FeatureStatus, ParamType};
use serde::{Deserialize, Serialize};

use crate::params::{Bounds, Parameter};
use crate::types::{EngineError, ExtrusionState, Feature, FeatureVariant};

/// Everything needed to put a removed feature back: the record, its
/// parameters with metadata, and its edges in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub id: FeatureId,
    pub name: String,
    pub status: FeatureStatus,
    pub variant: FeatureVariant,
    pub dependencies: Vec<FeatureId>,
    pub dependents: Vec<FeatureId>,
    pub parameters: Vec<Parameter>,
    /// Position in the registry's creation order.
    pub position: usize,
}

impl FeatureSnapshot {
    pub fn kind(&self) -> FeatureKind {
        self.variant.kind()
    }

    /// Rebuild the feature record. Geometry is not part of a snapshot.
    pub fn to_feature(&self) -> Feature {
        let mut feature = Feature::new(self.id.clone(), self.name.clone(), self.variant.clone());
        feature.status = self.status;
        feature
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: &str| {
            out.push_str(key);
            out.push('=');
            out.push_str(&value.replace('\n', " "));
            out.push('\n');
        };

        line("id", self.id.as_str());
        line("name", &self.name);
        line("status", &self.status.code().to_string());
        line("kind", self.kind().as_str());
        if let FeatureVariant::Extrusion(state) = &self.variant {
            line("sketchId", state.sketch_id.as_str());
            line("direction", &state.direction.index().to_string());
            line("endCondition", &state.end_condition.index().to_string());
            line(
                "targetFeatureId",
                state.target_id.as_ref().map(FeatureId::as_str).unwrap_or(""),
            );
        }
        line("dependencies", &join_ids(&self.dependencies));
        line("dependents", &join_ids(&self.dependents));
        line("position", &self.position.to_string());

        for param in &self.parameters {
            line(&format!("param.{}", param.name()), &param.value().to_string());
            line(&format!("meta.{}", param.name()), &format_meta(param));
            if let Some(expr) = param.expression() {
                line(&format!("expr.{}", param.name()), expr);
            }
        }
        out
    }

    pub fn deserialize(text: &str) -> Result<Self, EngineError> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        let mut values: Vec<(&str, &str)> = Vec::new();
        let mut metas: HashMap<&str, &str> = HashMap::new();
        let mut exprs: HashMap<&str, &str> = HashMap::new();

        for raw in text.lines() {
            let Some((key, value)) = raw.split_once('=') else {
                continue;
            };
            if let Some(name) = key.strip_prefix("param.") {
                values.push((name, value));
            } else if let Some(name) = key.strip_prefix("meta.") {
                metas.insert(name, value);
            } else if let Some(name) = key.strip_prefix("expr.") {
                exprs.insert(name, value);
            } else {
                fields.insert(key, value);
            }
        }

        let id = fields
            .get("id")
            .filter(|v| !v.is_empty())
            .map(|v| FeatureId::new(*v))
            .ok_or_else(|| parse_error("missing id"))?;
        let name = fields.get("name").copied().unwrap_or_default().to_string();
        let status = match fields.get("status") {
            Some(v) => v
                .trim()
                .parse::<i32>()
                .ok()
                .and_then(FeatureStatus::from_code)
                .ok_or_else(|| parse_error(format!("bad status '{v}'")))?,
            None => FeatureStatus::Invalid,
        };
        let kind = fields
            .get("kind")
            .and_then(|v| FeatureKind::parse(v.trim()))
            .ok_or_else(|| parse_error("missing or unknown kind"))?;

        let variant = match kind {
            FeatureKind::Sketch => FeatureVariant::Sketch,
            FeatureKind::Extrusion => {
                let sketch_id = fields
                    .get("sketchId")
                    .filter(|v| !v.is_empty())
                    .map(|v| FeatureId::new(*v))
                    .ok_or_else(|| parse_error("extrusion without sketchId"))?;
                let mut state = ExtrusionState::new(sketch_id);
                if let Some(v) = fields.get("direction") {
                    state.direction = parse_index(v)
                        .and_then(ExtrudeDirection::from_index)
                        .ok_or_else(|| parse_error(format!("bad direction '{v}'")))?;
                }
                if let Some(v) = fields.get("endCondition") {
                    state.end_condition = parse_index(v)
                        .and_then(EndCondition::from_index)
                        .ok_or_else(|| parse_error(format!("bad endCondition '{v}'")))?;
                }
                state.target_id = fields
                    .get("targetFeatureId")
                    .filter(|v| !v.is_empty())
                    .map(|v| FeatureId::new(*v));
                FeatureVariant::Extrusion(state)
            }
        };

        let position = match fields.get("position") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map_err(|_| parse_error(format!("bad position '{v}'")))?,
            None => usize::MAX,
        };

        // Declared parameters first, then any extra ones in file order.
        let specs = variant.parameter_specs();
        let mut names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        for (name, _) in &values {
            if !names.contains(name) {
                names.push(*name);
            }
        }

        let mut parameters = Vec::new();
        for name in names {
            let spec = specs.iter().find(|s| s.name == name);
            let (param_type, bounds) = match metas.get(name) {
                Some(meta) => parse_meta(meta)?,
                None => spec
                    .map(|s| (s.param_type, s.bounds))
                    .unwrap_or((ParamType::Custom, Bounds::none())),
            };
            let value = match values.iter().find(|(n, _)| *n == name) {
                Some((_, v)) => parse_number(v)?,
                None => spec.map(|s| s.value).unwrap_or(0.0),
            };
            let mut param = Parameter::new(name, value, param_type, bounds);
            if let Some(expr) = exprs.get(name) {
                param.set_expression_text(Some(expr.to_string()));
            }
            parameters.push(param);
        }

        Ok(Self {
            id,
            name,
            status,
            variant,
            dependencies: split_ids(fields.get("dependencies").copied()),
            dependents: split_ids(fields.get("dependents").copied()),
            parameters,
            position,
        })
    }
}

fn parse_error(reason: impl Into<String>) -> EngineError {
    EngineError::Parse {
        reason: reason.into(),
    }
}

fn parse_index(text: &str) -> Option<i64> {
    text.trim().parse::<i64>().ok()
}

fn parse_number(text: &str) -> Result<f64, EngineError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| parse_error(format!("bad number '{text}'")))
}

fn join_ids(ids: &[FeatureId]) -> String {
    ids.iter().map(FeatureId::as_str).collect::<Vec<_>>().join(",")
}

fn split_ids(text: Option<&str>) -> Vec<FeatureId> {
    text.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FeatureId::new)
        .collect()
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// `Type,min,max,step` with empty fields for absent bounds.
fn format_meta(param: &Parameter) -> String {
    format!(
        "{},{},{},{}",
        param.param_type().as_str(),
        format_optional(param.min()),
        format_optional(param.max()),
        format_optional(param.step()),
    )
}

fn parse_meta(text: &str) -> Result<(ParamType, Bounds), EngineError> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    let [ty, min, max, step] = parts.as_slice() else {
        return Err(parse_error(format!("bad parameter metadata '{text}'")));
    };
    let param_type = ParamType::parse(ty)
        .ok_or_else(|| parse_error(format!("unknown parameter type '{ty}'")))?;
    let optional = |s: &str| -> Result<Option<f64>, EngineError> {
        if s.is_empty() {
            Ok(None)
        } else {
            parse_number(s).map(Some)
        }
    };
    Ok((
        param_type,
        Bounds {
            min: optional(*min)?,
            max: optional(*max)?,
            step: optional(*step)?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extrusion_snapshot() -> FeatureSnapshot {
        let mut state = ExtrusionState::new(FeatureId::new("sketch1"));
        state.end_condition = EndCondition::UpToBody;
        state.target_id = Some(FeatureId::new("body"));
        let mut parameters: Vec<Parameter> =
            state.parameter_specs().iter().map(|s| s.build()).collect();
        parameters[0] = Parameter::new("depth", 12.5, ParamType::Length, Bounds::none().with_min(0.0));
        parameters[0].set_expression_text(Some("{ext1:base} * 2.5".into()));
        parameters.push(Parameter::new("base", 5.0, ParamType::Custom, Bounds::range(1.0, 9.0)));

        FeatureSnapshot {
            id: FeatureId::new("ext1"),
            name: "Extrude = 1".into(),
            status: FeatureStatus::Valid,
            variant: FeatureVariant::Extrusion(state),
            dependencies: vec![FeatureId::new("sketch1"), FeatureId::new("body")],
            dependents: vec![FeatureId::new("fillet")],
            parameters,
            position: 2,
        }
    }

    #[test]
    fn extrusion_text_round_trip() {
        let snap = extrusion_snapshot();
        let text = snap.serialize();
        assert!(text.starts_with("id=ext1\nname=Extrude = 1\nstatus=0\n"));
        assert!(text.contains("dependencies=sketch1,body\n"));

        let back = FeatureSnapshot::deserialize(&text).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn sketch_round_trip() {
        let snap = FeatureSnapshot {
            id: FeatureId::new("sketch1"),
            name: "Sketch".into(),
            status: FeatureStatus::Invalid,
            variant: FeatureVariant::Sketch,
            dependencies: Vec::new(),
            dependents: vec![FeatureId::new("ext1")],
            parameters: Vec::new(),
            position: 0,
        };
        assert_eq!(FeatureSnapshot::deserialize(&snap.serialize()).unwrap(), snap);
    }

    #[test]
    fn unknown_keys_and_missing_metadata_are_tolerated() {
        let text = "id=ext1\nname=E\nstatus=1\nkind=Extrusion\nsketchId=s\ncolor=red\nparam.depth=30\n";
        let snap = FeatureSnapshot::deserialize(text).unwrap();
        assert_eq!(snap.parameters.len(), 6);
        let depth = snap.parameters.iter().find(|p| p.name() == "depth").unwrap();
        assert_eq!(depth.value(), 30.0);
        assert_eq!(depth.min(), Some(0.0));
        assert_eq!(snap.position, usize::MAX);
        assert_eq!(snap.to_feature().status, FeatureStatus::Invalid);
    }

    #[test]
    fn malformed_header_is_a_parse_error() {
        for text in [
            "name=x\nkind=Sketch\n",
            "id=a\nkind=Gear\n",
            "id=a\nkind=Sketch\nstatus=9\n",
            "id=a\nkind=Extrusion\n",
            "id=a\nkind=Extrusion\nsketchId=s\ndirection=7\n",
        ] {
            let err = FeatureSnapshot::deserialize(text).unwrap_err();
            assert!(matches!(err, EngineError::Parse { .. }), "{text}");
        }
    }
}
