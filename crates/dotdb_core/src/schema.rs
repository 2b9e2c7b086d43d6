//! Structural shape validation.
//!
//! Schemas are declared at open time against a path prefix. Before a
//! `set` at path `Q`, every schema whose prefix `P` covers `Q` checks
//! the incoming value against its sub-schema at the remainder `Q \ P`
//! (descending `properties` by key, `items` for array indexes). A
//! remainder with no declared sub-schema passes. Validation failure
//! aborts the write before any mutation.

use crate::error::{CoreError, CoreResult};
use dotdb_codec::{segment_as_index, Path, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// JSON type named by a schema.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SchemaType {
    /// Object with string keys.
    Object,
    /// Ordered sequence.
    Array,
    /// UTF-8 string.
    String,
    /// IEEE-754 double.
    Number,
    /// Boolean.
    Boolean,
    /// Null.
    Null,
}

impl SchemaType {
    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (SchemaType::Object, Value::Object(_))
                | (SchemaType::Array, Value::Array(_))
                | (SchemaType::String, Value::String(_))
                | (SchemaType::Number, Value::Number(_))
                | (SchemaType::Boolean, Value::Bool(_))
                | (SchemaType::Null, Value::Null)
        )
    }

    fn name(self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Null => "null",
        }
    }
}

/// A structural shape check.
///
/// Deserialized from the host's schema documents (camelCase keys).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Schema {
    /// Required JSON type, if constrained.
    #[serde(rename = "type")]
    pub schema_type: Option<SchemaType>,

    /// Per-key sub-schemas for objects.
    pub properties: Option<HashMap<String, Schema>>,
    /// Keys that must be present on objects.
    pub required: Option<Vec<String>>,

    /// Minimum string length in bytes.
    pub min_length: Option<usize>,
    /// Maximum string length in bytes.
    pub max_length: Option<usize>,
    /// Regex the string must match.
    pub pattern: Option<String>,

    /// Inclusive numeric lower bound.
    pub minimum: Option<f64>,
    /// Inclusive numeric upper bound.
    pub maximum: Option<f64>,
    /// Exclusive numeric lower bound.
    pub exclusive_minimum: Option<f64>,
    /// Exclusive numeric upper bound.
    pub exclusive_maximum: Option<f64>,

    /// Element schema for arrays.
    pub items: Option<Box<Schema>>,
    /// Minimum array length.
    pub min_items: Option<usize>,
    /// Maximum array length.
    pub max_items: Option<usize>,
    /// Whether array elements must be pairwise unequal.
    pub unique_items: Option<bool>,

    /// Closed set of allowed values, compared by deep equality.
    #[serde(rename = "enum")]
    pub allowed: Option<Vec<Value>>,
}

impl Schema {
    /// Creates a schema constraining only the type.
    #[must_use]
    pub fn of_type(schema_type: SchemaType) -> Self {
        Self {
            schema_type: Some(schema_type),
            ..Self::default()
        }
    }

    /// Parses a schema from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the document does not describe a
    /// schema.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CoreError::validation(format!("invalid schema document: {e}")))
    }

    /// Descends to the sub-schema addressed by `segments`.
    ///
    /// Objects descend through `properties`; numeric segments descend
    /// through `items`. Returns `None` when the schema says nothing
    /// about that location.
    #[must_use]
    fn descend(&self, segments: &[String]) -> Option<&Schema> {
        let mut current = self;
        for segment in segments {
            if let Some(properties) = &current.properties {
                if let Some(next) = properties.get(segment.as_str()) {
                    current = next;
                    continue;
                }
            }
            if segment_as_index(segment).is_some() {
                if let Some(items) = &current.items {
                    current = items;
                    continue;
                }
            }
            return None;
        }
        Some(current)
    }
}

/// Validates a value against a schema.
///
/// # Errors
///
/// Returns `Validation` describing the first violated constraint.
pub fn validate(value: &Value, schema: &Schema) -> CoreResult<()> {
    check(value, schema).map_err(CoreError::validation)
}

fn check(value: &Value, schema: &Schema) -> Result<(), String> {
    if let Some(expected) = schema.schema_type {
        if !expected.matches(value) {
            return Err(format!(
                "expected {}, found {}",
                expected.name(),
                value.type_name()
            ));
        }
    }

    if let Some(allowed) = &schema.allowed {
        if !allowed.contains(value) {
            return Err("value not in allowed enum".to_owned());
        }
    }

    match value {
        Value::String(s) => {
            if let Some(min) = schema.min_length {
                if s.len() < min {
                    return Err(format!("string too short: min length {min}"));
                }
            }
            if let Some(max) = schema.max_length {
                if s.len() > max {
                    return Err(format!("string too long: max length {max}"));
                }
            }
            if let Some(pattern) = &schema.pattern {
                let re = Regex::new(pattern)
                    .map_err(|e| format!("invalid pattern {pattern:?}: {e}"))?;
                if !re.is_match(s) {
                    return Err(format!("string does not match pattern {pattern:?}"));
                }
            }
        }
        Value::Number(n) => {
            if let Some(min) = schema.minimum {
                if *n < min {
                    return Err(format!("value too small: minimum {min}"));
                }
            }
            if let Some(max) = schema.maximum {
                if *n > max {
                    return Err(format!("value too large: maximum {max}"));
                }
            }
            if let Some(min) = schema.exclusive_minimum {
                if *n <= min {
                    return Err(format!("value too small: exclusive minimum {min}"));
                }
            }
            if let Some(max) = schema.exclusive_maximum {
                if *n >= max {
                    return Err(format!("value too large: exclusive maximum {max}"));
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.min_items {
                if items.len() < min {
                    return Err(format!("array too short: min items {min}"));
                }
            }
            if let Some(max) = schema.max_items {
                if items.len() > max {
                    return Err(format!("array too long: max items {max}"));
                }
            }
            if schema.unique_items == Some(true) {
                for (i, a) in items.iter().enumerate() {
                    if items[i + 1..].contains(a) {
                        return Err("array items must be unique".to_owned());
                    }
                }
            }
            if let Some(item_schema) = &schema.items {
                for (i, item) in items.iter().enumerate() {
                    check(item, item_schema).map_err(|e| format!("in item {i}: {e}"))?;
                }
            }
        }
        Value::Object(map) => {
            if let Some(required) = &schema.required {
                for key in required {
                    if !map.contains_key(key) {
                        return Err(format!("missing required property {key:?}"));
                    }
                }
            }
            if let Some(properties) = &schema.properties {
                for (key, property_schema) in properties {
                    if let Some(property) = map.get(key) {
                        check(property, property_schema)
                            .map_err(|e| format!("in property {key:?}: {e}"))?;
                    }
                }
            }
        }
        _ => {}
    }

    Ok(())
}

/// The set of schemas registered at open time.
#[derive(Debug, Default)]
pub struct SchemaSet {
    schemas: Vec<(Path, Schema)>,
}

impl SchemaSet {
    /// Builds a schema set from `(prefix, schema)` pairs.
    ///
    /// # Errors
    ///
    /// Returns a path error if a prefix is malformed.
    pub fn new(entries: Vec<(String, Schema)>) -> CoreResult<Self> {
        let mut schemas = Vec::with_capacity(entries.len());
        for (prefix, schema) in entries {
            let path = Path::parse(&prefix).map_err(|e| CoreError::path(e.to_string()))?;
            schemas.push((path, schema));
        }
        Ok(Self { schemas })
    }

    /// Validates an incoming `set` at `target` against every covering
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint as a validation error.
    pub fn check_set(&self, target: &Path, value: &Value) -> CoreResult<()> {
        for (prefix, schema) in &self.schemas {
            let Some(remainder) = target.strip_prefix(prefix) else {
                continue;
            };
            let Some(sub) = schema.descend(remainder) else {
                continue;
            };
            validate(value, sub).map_err(|e| match e {
                CoreError::Validation { message } => {
                    let location = if prefix.is_root() {
                        "<root>".to_owned()
                    } else {
                        prefix.as_dotted()
                    };
                    CoreError::validation(format!("at {location}: {message}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}
