//! Operation input schemas and the `Coalesce` contract.
//!
//! A schema lists the fields an operation accepts. Coalescing coerces loose
//! input (string numbers from query strings, integers where floats are
//! expected) into the declared types and reports every violation at once.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::handler::Handler;
use crate::types::Value;

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Any,
    String,
    Int,
    Float,
    Bool,
    Bytes,
    Array,
    Map,
}

/// Single field definition within a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Name of the field.
    pub name: String,
    /// Expected type; values are coerced when possible.
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
    /// Whether the field must be present and non-null.
    #[serde(default)]
    pub required: bool,
}

fn default_field_type() -> FieldType {
    FieldType::Any
}

/// Result of validating a value against a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The value conforms to the schema (possibly after coercion).
    Valid,
    /// The value violates one or more schema constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Coerces and validates a request input in place.
pub trait Coalesce: Send + Sync {
    fn coalesce(&self, input: &mut Value) -> ValidationResult;
}

/// Input schema of one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSchema {
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Reject fields that are not declared.
    #[serde(default)]
    pub strict: bool,
}

impl Coalesce for OperationSchema {
    fn coalesce(&self, input: &mut Value) -> ValidationResult {
        if input.is_null() {
            *input = Value::Map(BTreeMap::new());
        }
        let found = input.type_name();
        let Some(map) = input.as_map_mut() else {
            return ValidationResult::Invalid {
                errors: vec![format!("input must be a map, found {found}")],
            };
        };

        let mut errors = Vec::new();
        for field in &self.fields {
            match map.get_mut(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(format!("{}: required", field.name));
                    }
                }
                Some(value) => {
                    if let Err(found) = coerce(value, field.field_type) {
                        errors.push(format!(
                            "{}: expected {:?}, found {found}",
                            field.name, field.field_type
                        ));
                    }
                }
            }
        }
        if self.strict {
            for key in map.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    errors.push(format!("{key}: unknown field"));
                }
            }
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

/// Coerces `value` to `ty` in place, returning the found type name when it
/// cannot be converted.
fn coerce(value: &mut Value, ty: FieldType) -> Result<(), &'static str> {
    let coerced = match (ty, &*value) {
        (FieldType::Any, _)
        | (FieldType::String, Value::String(_))
        | (FieldType::Int, Value::Int(_))
        | (FieldType::Float, Value::Float(_))
        | (FieldType::Bool, Value::Bool(_))
        | (FieldType::Bytes, Value::Bytes(_))
        | (FieldType::Array, Value::Array(_))
        | (FieldType::Map, Value::Map(_)) => return Ok(()),
        (FieldType::Float, Value::Int(_)) => value.as_f64().map(Value::Float),
        (FieldType::Int, Value::Float(_)) => value.as_i64().map(Value::Int),
        (FieldType::Int, Value::String(s)) => s.trim().parse().ok().map(Value::Int),
        (FieldType::Float, Value::String(s)) => s.trim().parse().ok().map(Value::Float),
        (FieldType::Bool, Value::String(s)) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::String, Value::Int(_) | Value::Float(_) | Value::Bool(_)) => {
            Some(Value::String(value.to_display_string()))
        }
        (FieldType::Bytes, Value::String(s)) => Some(Value::Bytes(s.as_bytes().to_vec())),
        _ => None,
    };
    match coerced {
        Some(v) => {
            *value = v;
            Ok(())
        }
        None => Err(value.type_name()),
    }
}

/// Input schemas keyed by operation, consulted by the engine before
/// dispatch.
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    operations: HashMap<Handler, OperationSchema>,
}

impl Interfaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handler: Handler, schema: OperationSchema) {
        self.operations.insert(handler, schema);
    }

    #[must_use]
    pub fn get(&self, handler: &Handler) -> Option<&OperationSchema> {
        self.operations.get(handler)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> OperationSchema {
        serde_json::from_value(json!({
            "fields": [
                {"name": "id", "type": "int", "required": true},
                {"name": "ratio", "type": "float"},
                {"name": "active", "type": "bool"},
                {"name": "label", "type": "string"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn coerces_loose_input() {
        let mut input = Value::from(json!({"id": "42", "ratio": 2, "active": "true", "label": 7}));
        assert!(schema().coalesce(&mut input).is_valid());
        assert_eq!(
            input,
            Value::from(json!({"id": 42, "ratio": 2.0, "active": true, "label": "7"}))
        );
    }

    #[test]
    fn reports_every_violation() {
        let mut input = Value::from(json!({"ratio": "lots", "active": 3}));
        let ValidationResult::Invalid { errors } = schema().coalesce(&mut input) else {
            panic!("expected invalid");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e == "id: required"));
    }

    #[test]
    fn strict_rejects_unknown_fields_and_null_becomes_empty_map() {
        let strict = OperationSchema {
            fields: vec![],
            strict: true,
        };
        let mut input = Value::from(json!({"x": 1}));
        assert!(!strict.coalesce(&mut input).is_valid());
        let mut empty = Value::Null;
        assert!(strict.coalesce(&mut empty).is_valid());
        assert_eq!(empty, Value::Map(BTreeMap::new()));
    }
}
