//! Declarative input schemas and the validators derived from them.
//!
//! A [`SchemaNode`] is rendered verbatim into the tool manifest and is also
//! the only source the runtime [`Validator`] is built from, so the documented
//! contract and the enforced one come from the same value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Number, Value};

static DATE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:\d{2})?$")
        .expect("date-time pattern compiles")
});

/// One node of an input schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub kind: SchemaKind,
    pub description: Option<String>,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    /// No `type` given: anything is accepted.
    Any,
    Enum(Vec<Value>),
    String {
        format: Option<String>,
        min_length: Option<usize>,
        max_length: Option<usize>,
    },
    Number {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Integer {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Boolean,
    Array {
        items: Box<SchemaNode>,
        min_items: Option<usize>,
        max_items: Option<usize>,
    },
    Object(ObjectSchema),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectSchema {
    pub properties: BTreeMap<String, SchemaNode>,
    pub required: BTreeSet<String>,
    /// Accept properties not listed in `properties`.
    pub additional_properties: bool,
    pub min_properties: Option<usize>,
    pub max_properties: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid schema at {path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaNode {
    fn of(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
            default: None,
        }
    }

    /// Parse the JSON-Schema-like declarative form.
    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        parse_node(value, "$")
    }

    /// Render the declarative form, as returned in the tool manifest.
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        match &self.kind {
            SchemaKind::Any => {}
            SchemaKind::Enum(values) => {
                if values.iter().all(Value::is_string) {
                    out.insert("type".into(), json!("string"));
                }
                out.insert("enum".into(), Value::Array(values.clone()));
            }
            SchemaKind::String {
                format,
                min_length,
                max_length,
            } => {
                out.insert("type".into(), json!("string"));
                insert_opt(&mut out, "format", format.clone());
                insert_opt(&mut out, "minLength", *min_length);
                insert_opt(&mut out, "maxLength", *max_length);
            }
            SchemaKind::Number { minimum, maximum } | SchemaKind::Integer { minimum, maximum } => {
                let name = if matches!(self.kind, SchemaKind::Integer { .. }) {
                    "integer"
                } else {
                    "number"
                };
                out.insert("type".into(), json!(name));
                insert_opt(&mut out, "minimum", *minimum);
                insert_opt(&mut out, "maximum", *maximum);
            }
            SchemaKind::Boolean => {
                out.insert("type".into(), json!("boolean"));
            }
            SchemaKind::Array {
                items,
                min_items,
                max_items,
            } => {
                out.insert("type".into(), json!("array"));
                out.insert("items".into(), items.to_value());
                insert_opt(&mut out, "minItems", *min_items);
                insert_opt(&mut out, "maxItems", *max_items);
            }
            SchemaKind::Object(object) => {
                out.insert("type".into(), json!("object"));
                let properties: Map<String, Value> = object
                    .properties
                    .iter()
                    .map(|(name, node)| (name.clone(), node.to_value()))
                    .collect();
                out.insert("properties".into(), Value::Object(properties));
                if !object.required.is_empty() {
                    out.insert("required".into(), json!(object.required));
                }
                out.insert(
                    "additionalProperties".into(),
                    json!(object.additional_properties),
                );
                insert_opt(&mut out, "minProperties", object.min_properties);
                insert_opt(&mut out, "maxProperties", object.max_properties);
            }
        }
        insert_opt(&mut out, "description", self.description.clone());
        if let Some(default) = &self.default {
            out.insert("default".into(), default.clone());
        }
        Value::Object(out)
    }
}

impl serde::Serialize for SchemaNode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn insert_opt<T: Into<Value>>(out: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        out.insert(key.to_string(), value.into());
    }
}

fn parse_node(value: &Value, path: &str) -> Result<SchemaNode, SchemaError> {
    let err = |message: String| SchemaError {
        path: path.to_string(),
        message,
    };
    let map = value
        .as_object()
        .ok_or_else(|| err("schema node must be an object".to_string()))?;

    let usize_of = |key: &str| map.get(key).and_then(Value::as_u64).map(|n| n as usize);
    let f64_of = |key: &str| map.get(key).and_then(Value::as_f64);

    let kind = if let Some(values) = map.get("enum") {
        let values = values
            .as_array()
            .ok_or_else(|| err("enum must be an array".to_string()))?;
        SchemaKind::Enum(values.clone())
    } else {
        match map.get("type").and_then(Value::as_str) {
            None => SchemaKind::Any,
            Some("string") => SchemaKind::String {
                format: map.get("format").and_then(Value::as_str).map(str::to_string),
                min_length: usize_of("minLength"),
                max_length: usize_of("maxLength"),
            },
            Some("number") => SchemaKind::Number {
                minimum: f64_of("minimum"),
                maximum: f64_of("maximum"),
            },
            Some("integer") => SchemaKind::Integer {
                minimum: f64_of("minimum"),
                maximum: f64_of("maximum"),
            },
            Some("boolean") => SchemaKind::Boolean,
            Some("array") => {
                let items = match map.get("items") {
                    Some(items) => parse_node(items, &format!("{path}.items"))?,
                    None => SchemaNode::of(SchemaKind::Any),
                };
                SchemaKind::Array {
                    items: Box::new(items),
                    min_items: usize_of("minItems"),
                    max_items: usize_of("maxItems"),
                }
            }
            Some("object") => {
                let mut object = ObjectSchema {
                    additional_properties: map
                        .get("additionalProperties")
                        .map(|v| v.as_bool().unwrap_or(true))
                        .unwrap_or(false),
                    min_properties: usize_of("minProperties"),
                    max_properties: usize_of("maxProperties"),
                    ..ObjectSchema::default()
                };
                if let Some(properties) = map.get("properties").and_then(Value::as_object) {
                    for (name, node) in properties {
                        let node = parse_node(node, &format!("{path}.{name}"))?;
                        object.properties.insert(name.clone(), node);
                    }
                }
                if let Some(required) = map.get("required").and_then(Value::as_array) {
                    for name in required {
                        let name = name
                            .as_str()
                            .ok_or_else(|| err("required entries must be strings".to_string()))?;
                        object.required.insert(name.to_string());
                    }
                }
                SchemaKind::Object(object)
            }
            Some(other) => return Err(err(format!("unsupported type '{other}'"))),
        }
    };

    Ok(SchemaNode {
        kind,
        description: map
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        default: map.get("default").cloned(),
    })
}

/// A single rule an input broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolations(pub Vec<Violation>);

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for SchemaViolations {}

/// Runtime validator/normalizer built by [`convert`].
#[derive(Debug, Clone)]
pub struct Validator {
    check: Check,
    description: Option<String>,
    default: Option<Value>,
}

#[derive(Debug, Clone)]
enum Check {
    Any,
    /// Closed set of string literals.
    Choice(Vec<String>),
    /// Closed set of arbitrary JSON literals.
    Union(Vec<Value>),
    String {
        date_time: bool,
        min_length: Option<usize>,
        max_length: Option<usize>,
    },
    Number {
        integer: bool,
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Boolean,
    Array {
        items: Box<Validator>,
        min_items: Option<usize>,
        max_items: Option<usize>,
    },
    Object {
        fields: Vec<Field>,
        allow_unknown: bool,
        min_properties: Option<usize>,
        max_properties: Option<usize>,
    },
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    validator: Validator,
    required: bool,
}

fn violation(out: &mut Vec<Violation>, path: &str, message: impl Into<String>) {
    out.push(Violation {
        path: path.to_string(),
        message: message.into(),
    });
}

/// Build the runtime validator for a schema node.
pub fn convert(node: &SchemaNode) -> Validator {
    let check = match &node.kind {
        SchemaKind::Any => Check::Any,
        SchemaKind::Enum(values) => {
            let strings: Option<Vec<String>> = values
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect();
            match strings {
                Some(choices) => Check::Choice(choices),
                None => Check::Union(values.clone()),
            }
        }
        SchemaKind::String {
            format,
            min_length,
            max_length,
        } => Check::String {
            date_time: format.as_deref() == Some("date-time"),
            min_length: *min_length,
            max_length: *max_length,
        },
        SchemaKind::Number { minimum, maximum } => Check::Number {
            integer: false,
            minimum: *minimum,
            maximum: *maximum,
        },
        SchemaKind::Integer { minimum, maximum } => Check::Number {
            integer: true,
            minimum: *minimum,
            maximum: *maximum,
        },
        SchemaKind::Boolean => Check::Boolean,
        SchemaKind::Array {
            items,
            min_items,
            max_items,
        } => Check::Array {
            items: Box::new(convert(items)),
            min_items: *min_items,
            max_items: *max_items,
        },
        SchemaKind::Object(object) => Check::Object {
            fields: object
                .properties
                .iter()
                .map(|(name, node)| Field {
                    name: name.clone(),
                    validator: convert(node),
                    required: object.required.contains(name),
                })
                .collect(),
            allow_unknown: object.additional_properties,
            min_properties: object.min_properties,
            max_properties: object.max_properties,
        },
    };

    Validator {
        check,
        description: node.description.clone(),
        default: node.default.clone(),
    }
}

impl Validator {
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Validate `value`, returning it normalized (defaults filled in,
    /// integral numbers stored as integers).
    pub fn validate(&self, value: &Value) -> Result<Value, SchemaViolations> {
        let mut violations = Vec::new();
        let normalized = self.check_at(value, "$", &mut violations);
        if violations.is_empty() {
            Ok(normalized)
        } else {
            Err(SchemaViolations(violations))
        }
    }

    fn check_at(&self, value: &Value, path: &str, out: &mut Vec<Violation>) -> Value {
        if value.is_null() {
            if let Some(default) = self.default_value() {
                return default.clone();
            }
        }

        match &self.check {
            Check::Any => value.clone(),
            Check::Choice(choices) => {
                match value.as_str() {
                    Some(s) if choices.iter().any(|c| c == s) => {}
                    _ => violation(out, path, format!("expected one of: {}", choices.join(", "))),
                }
                value.clone()
            }
            Check::Union(values) => {
                if !values.contains(value) {
                    violation(out, path, format!("expected one of: {}", Value::Array(values.clone())));
                }
                value.clone()
            }
            Check::String {
                date_time,
                min_length,
                max_length,
            } => {
                let Some(s) = value.as_str() else {
                    violation(out, path, "expected string");
                    return value.clone();
                };
                let len = s.chars().count();
                if let Some(min) = min_length {
                    if len < *min {
                        violation(out, path, format!("must be at least {min} characters"));
                    }
                }
                if let Some(max) = max_length {
                    if len > *max {
                        violation(out, path, format!("must be at most {max} characters"));
                    }
                }
                if *date_time && !DATE_TIME.is_match(s) {
                    violation(out, path, format!("'{s}' is not an ISO 8601 date-time"));
                }
                value.clone()
            }
            Check::Number {
                integer,
                minimum,
                maximum,
            } => {
                let Some(n) = value.as_f64() else {
                    let expected = if *integer { "expected integer" } else { "expected number" };
                    violation(out, path, expected);
                    return value.clone();
                };
                if let Some(min) = minimum {
                    if n < *min {
                        violation(out, path, format!("must be >= {min}"));
                    }
                }
                if let Some(max) = maximum {
                    if n > *max {
                        violation(out, path, format!("must be <= {max}"));
                    }
                }
                if !*integer || value.is_i64() || value.is_u64() {
                    return value.clone();
                }
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Value::Number(Number::from(n as i64))
                } else {
                    violation(out, path, "expected integer");
                    value.clone()
                }
            }
            Check::Boolean => {
                if !value.is_boolean() {
                    violation(out, path, "expected boolean");
                }
                value.clone()
            }
            Check::Array {
                items,
                min_items,
                max_items,
            } => {
                let Some(elements) = value.as_array() else {
                    violation(out, path, "expected array");
                    return value.clone();
                };
                if let Some(min) = min_items {
                    if elements.len() < *min {
                        violation(out, path, format!("must contain at least {min} items"));
                    }
                }
                if let Some(max) = max_items {
                    if elements.len() > *max {
                        violation(out, path, format!("must contain at most {max} items"));
                    }
                }
                let normalized = elements
                    .iter()
                    .enumerate()
                    .map(|(i, item)| items.check_at(item, &format!("{path}[{i}]"), out))
                    .collect();
                Value::Array(normalized)
            }
            Check::Object {
                fields,
                allow_unknown,
                min_properties,
                max_properties,
            } => {
                let Some(input) = value.as_object() else {
                    violation(out, path, "expected object");
                    return value.clone();
                };
                let mut result = Map::new();
                for field in fields {
                    let field_path = format!("{path}.{}", field.name);
                    match input.get(&field.name).filter(|v| !v.is_null()) {
                        Some(v) => {
                            let normalized = field.validator.check_at(v, &field_path, out);
                            result.insert(field.name.clone(), normalized);
                        }
                        None => {
                            if let Some(default) = field.validator.default_value() {
                                result.insert(field.name.clone(), default.clone());
                            } else if field.required {
                                let message = match field.validator.description() {
                                    Some(hint) => format!("is required ({hint})"),
                                    None => "is required".to_string(),
                                };
                                out.push(Violation {
                                    path: field_path,
                                    message,
                                });
                            }
                        }
                    }
                }
                for (key, v) in input {
                    if fields.iter().any(|f| &f.name == key) {
                        continue;
                    }
                    if *allow_unknown {
                        result.insert(key.clone(), v.clone());
                    } else {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("unknown property '{key}'"),
                        });
                    }
                }

                // Count checks run after the per-property pass and only add
                // to the violation list.
                if let Some(min) = min_properties {
                    if input.len() < *min {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("minProperties: expected at least {min} properties"),
                        });
                    }
                }
                if let Some(max) = max_properties {
                    if input.len() > *max {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("maxProperties: expected at most {max} properties"),
                        });
                    }
                }
                Value::Object(result)
            }
        }
    }
}
