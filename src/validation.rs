//! Schema validation helpers.
//!
//! This module checks a `serde_json::Value` against a [`Schema`]: structural
//! type checks, per-attribute [`Validator`]s, nested block cardinality, and,
//! once every per-attribute check has run, the schema's cross-attribute
//! [`Constraint`]s. It also hosts the two ingress transforms the engine
//! applies before validating: [`coerce`] and [`apply_defaults`].
//!
//! # Example
//!
//! ```
//! use hemmer_provider_digitalocean::schema::{Schema, Attribute, Validator};
//! use hemmer_provider_digitalocean::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("name", Attribute::required_string())
//!     .with_attribute(
//!         "size",
//!         Attribute::required_int64().with_validator(Validator::int_between(50, 16384)),
//!     );
//!
//! let diagnostics = validate(&schema, &json!({"name": "share", "size": 50}));
//! assert!(diagnostics.is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"name": "share", "size": 10}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("size".to_string()));
//! ```

use crate::schema::{
    Attribute, AttributeType, Block, BlockNestingMode, Constraint, Diagnostic, DiagnosticSeverity,
    NestedBlock, Schema, Validator,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;

/// Validate a JSON value against a schema.
///
/// Returns a list of diagnostics for any validation errors found.
/// An empty list means the value is valid.
///
/// # Validation Rules
///
/// - Required attributes must be present and non-null
/// - Optional attributes may be absent or null
/// - Computed-only attributes and computed blocks are skipped (provider sets these)
/// - Attribute types must match the schema
/// - Attribute validators run on every configured value
/// - Nested blocks are validated recursively with min/max item constraints
/// - Cross-attribute constraints run last
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    if let Value::Object(obj) = value {
        for constraint in &schema.constraints {
            validate_constraint(constraint, obj, &mut diagnostics);
        }
    }
    diagnostics
}

/// Validate a JSON value against a schema, returning Ok if valid or Err with diagnostics.
///
/// Warnings alone do not make the result an error.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<Vec<Diagnostic>, Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.iter().any(Diagnostic::is_error) {
        Err(diagnostics)
    } else {
        Ok(diagnostics)
    }
}

/// Check if a JSON value is valid against a schema.
///
/// Returns `true` if valid, `false` otherwise.
/// Use [`validate`] to get detailed error information.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    !validate(schema, value).iter().any(Diagnostic::is_error)
}

/// Insert schema defaults for attributes that are absent or null.
///
/// Defaults are applied recursively inside nested blocks that are present.
pub fn apply_defaults(schema: &Schema, value: &mut Value) {
    apply_block_defaults(&schema.block, value);
}

fn apply_block_defaults(block: &Block, value: &mut Value) {
    let Value::Object(obj) = value else {
        return;
    };
    for (name, attr) in &block.attributes {
        if let Some(default) = &attr.default {
            let missing = matches!(obj.get(name), None | Some(Value::Null));
            if missing {
                obj.insert(name.clone(), default.clone());
            }
        }
    }
    for (name, nested) in &block.blocks {
        match obj.get_mut(name) {
            Some(Value::Array(items)) => {
                for item in items {
                    apply_block_defaults(&nested.block, item);
                }
            },
            Some(Value::Object(map)) if nested.nesting_mode == BlockNestingMode::Map => {
                for item in map.values_mut() {
                    apply_block_defaults(&nested.block, item);
                }
            },
            Some(item @ Value::Object(_)) => apply_block_defaults(&nested.block, item),
            _ => {},
        }
    }
}

/// Coerce loosely-typed configuration values into the schema's types.
///
/// Integral floats become integers, numeric strings become numbers and
/// `"true"`/`"false"` become booleans. Values that cannot be coerced are left
/// untouched so [`validate`] reports them.
pub fn coerce(schema: &Schema, value: &mut Value) {
    coerce_block(&schema.block, value);
}

fn coerce_block(block: &Block, value: &mut Value) {
    let Value::Object(obj) = value else {
        return;
    };
    for (name, attr) in &block.attributes {
        if let Some(v) = obj.get_mut(name) {
            coerce_value(&attr.attr_type, v);
        }
    }
    for (name, nested) in &block.blocks {
        match obj.get_mut(name) {
            Some(Value::Array(items)) => {
                for item in items {
                    coerce_block(&nested.block, item);
                }
            },
            Some(item @ Value::Object(_)) if nested.nesting_mode != BlockNestingMode::Map => {
                coerce_block(&nested.block, item)
            },
            Some(Value::Object(map)) => {
                for item in map.values_mut() {
                    coerce_block(&nested.block, item);
                }
            },
            _ => {},
        }
    }
}

fn coerce_value(attr_type: &AttributeType, value: &mut Value) {
    match attr_type {
        AttributeType::Int64 => match value {
            Value::Number(n) if n.as_i64().is_none() => {
                if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        *value = Value::from(f as i64);
                    }
                }
            },
            Value::String(s) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    *value = Value::from(i);
                }
            },
            _ => {},
        },
        AttributeType::Float64 => {
            if let Value::String(s) = value {
                if let Ok(f) = s.trim().parse::<f64>() {
                    *value = Value::from(f);
                }
            }
        },
        AttributeType::Bool => {
            if let Value::String(s) = value {
                match s.as_str() {
                    "true" => *value = Value::Bool(true),
                    "false" => *value = Value::Bool(false),
                    _ => {},
                }
            }
        },
        AttributeType::List(element_type) | AttributeType::Set(element_type) => {
            if let Value::Array(items) = value {
                for item in items {
                    coerce_value(element_type, item);
                }
            }
        },
        AttributeType::Map(element_type) => {
            if let Value::Object(map) = value {
                for item in map.values_mut() {
                    coerce_value(element_type, item);
                }
            }
        },
        AttributeType::Object(attrs) => {
            if let Value::Object(map) = value {
                for (name, attr_type) in attrs {
                    if let Some(item) = map.get_mut(name) {
                        coerce_value(attr_type, item);
                    }
                }
            }
        },
        AttributeType::String | AttributeType::Dynamic => {},
    }
}

/// Whether a configured value counts as "set" for cross-attribute rules.
pub fn is_set(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn validate_constraint(
    constraint: &Constraint,
    obj: &Map<String, Value>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (names, set): (&Vec<String>, Vec<&String>) = match constraint {
        Constraint::ExactlyOneOf(names)
        | Constraint::AtLeastOneOf(names)
        | Constraint::ConflictsWith(names) => (
            names,
            names.iter().filter(|n| is_set(obj.get(n.as_str()))).collect(),
        ),
    };
    let listed = format!("`{}`", names.join("`, `"));
    match constraint {
        Constraint::ExactlyOneOf(_) if set.len() != 1 => {
            let detail = if set.is_empty() {
                "none were specified".to_string()
            } else {
                format!("{} were specified", set.len())
            };
            diagnostics.push(
                Diagnostic::error(format!("Exactly one of {} must be specified", listed))
                    .with_detail(detail)
                    .with_attribute(names[0].clone()),
            );
        },
        Constraint::AtLeastOneOf(_) if set.is_empty() => {
            diagnostics.push(
                Diagnostic::error(format!("At least one of {} must be specified", listed))
                    .with_attribute(names[0].clone()),
            );
        },
        Constraint::ConflictsWith(_) if set.len() > 1 => {
            diagnostics.push(
                Diagnostic::error(format!("Only one of {} can be specified", listed))
                    .with_attribute(set[1].clone()),
            );
        },
        _ => {},
    }
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => {
            // Null is valid for optional blocks, but we can't validate further
            return;
        },
        _ => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", value_type_name(value)))
                    .with_attribute_if_not_empty(path),
            );
            return;
        },
    };

    for (name, attr) in &block.attributes {
        let attr_path = join_path(path, name);
        let attr_value = obj.get(name);
        validate_attribute(attr, attr_value, &attr_path, diagnostics);
    }

    for (name, nested_block) in &block.blocks {
        if nested_block.computed {
            continue;
        }
        let block_path = join_path(path, name);
        let block_value = obj.get(name);
        validate_nested_block(nested_block, block_value, &block_path, diagnostics);
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Skip computed-only attributes (provider sets these)
    if attr.flags.is_computed_only() {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => {
            let before = diagnostics.len();
            validate_attribute_type(&attr.attr_type, v, path, diagnostics);
            // Only run predicates on well-typed values
            if diagnostics.len() == before {
                for validator in &attr.validators {
                    run_validator(validator, v, path, diagnostics);
                }
            }
        },
    }
}

fn run_validator(validator: &Validator, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    if let Validator::NoZeroValues = validator {
        if is_zero_value(value) {
            diagnostics.push(
                Diagnostic::error(format!("Attribute '{}' must not be empty or zero", path))
                    .with_attribute(path),
            );
        }
        return;
    }
    // Scalar predicates apply element-wise to collections
    if let Value::Array(items) = value {
        for (i, item) in items.iter().enumerate() {
            run_validator(validator, item, &format!("{}.{}", path, i), diagnostics);
        }
        return;
    }

    let problem = match validator {
        Validator::NoZeroValues => None,
        Validator::IntBetween { min, max } => value.as_i64().and_then(|i| {
            (i < *min || i > *max)
                .then(|| format!("expected {} to be in the range ({} - {}), got {}", path, min, max, i))
        }),
        Validator::FloatBetween { min, max } => value.as_f64().and_then(|f| {
            (f < *min || f > *max)
                .then(|| format!("expected {} to be in the range ({} - {}), got {}", path, min, max, f))
        }),
        Validator::StringInSlice {
            values,
            ignore_case,
        } => value.as_str().and_then(|s| {
            let found = values.iter().any(|allowed| {
                if *ignore_case {
                    allowed.eq_ignore_ascii_case(s)
                } else {
                    allowed == s
                }
            });
            (!found).then(|| format!("expected {} to be one of {:?}, got {}", path, values, s))
        }),
        Validator::StringLenBetween { min, max } => value.as_str().and_then(|s| {
            let len = s.chars().count();
            (len < *min || len > *max).then(|| {
                format!(
                    "expected length of {} to be in the range ({} - {}), got {}",
                    path, min, max, s
                )
            })
        }),
        Validator::ValidRegexp => value.as_str().and_then(|s| {
            regex::Regex::new(s)
                .err()
                .map(|e| format!("{}: {:?} is not a valid regular expression: {}", path, s, e))
        }),
        Validator::IsCidr => value.as_str().and_then(|s| {
            (!is_cidr(s)).then(|| format!("expected {} to be a valid CIDR block, got {}", path, s))
        }),
    };

    if let Some(summary) = problem {
        diagnostics.push(Diagnostic::error(summary).with_attribute(path));
    }
}

fn is_zero_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn is_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Float64 => {
            if !value.is_number() {
                diagnostics.push(type_error(path, "float64", value));
            }
        },
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element_type) => {
            if let Some(arr) = value.as_array() {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            } else {
                diagnostics.push(type_error(path, "list", value));
            }
        },
        AttributeType::Set(element_type) => {
            // Sets are represented as arrays in JSON
            if let Some(arr) = value.as_array() {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
                let mut seen = std::collections::HashSet::new();
                for elem in arr {
                    if !seen.insert(elem.to_string()) {
                        diagnostics.push(
                            Diagnostic::error(format!("Duplicate set element in '{}'", path))
                                .with_detail(format!("{} appears more than once", elem))
                                .with_attribute(path),
                        );
                        break;
                    }
                }
            } else {
                diagnostics.push(type_error(path, "set", value));
            }
        },
        AttributeType::Map(value_type) => {
            if let Some(obj) = value.as_object() {
                for (key, val) in obj {
                    let key_path = format!("{}.{}", path, key);
                    validate_attribute_type(value_type, val, &key_path, diagnostics);
                }
            } else {
                diagnostics.push(type_error(path, "map", value));
            }
        },
        AttributeType::Object(attrs) => {
            if let Some(obj) = value.as_object() {
                validate_object_type(attrs, obj, path, diagnostics);
            } else {
                diagnostics.push(type_error(path, "object", value));
            }
        },
        AttributeType::Dynamic => {},
    }
}

fn validate_object_type(
    attrs: &HashMap<String, AttributeType>,
    obj: &Map<String, Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for (name, attr_type) in attrs {
        let attr_path = join_path(path, name);
        if let Some(value) = obj.get(name) {
            validate_attribute_type(attr_type, value, &attr_path, diagnostics);
        }
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match nested.nesting_mode {
        BlockNestingMode::Single => {
            validate_single_block(nested, value, path, diagnostics);
        },
        BlockNestingMode::List | BlockNestingMode::Set => {
            validate_list_block(nested, value, path, diagnostics);
        },
        BlockNestingMode::Map => {
            validate_map_block(nested, value, path, diagnostics);
        },
    }
}

fn validate_single_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required block '{}'", path))
                        .with_detail("At least one block is required")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => {
            validate_block(&nested.block, v, path, diagnostics);
        },
    }
}

fn check_item_count(nested: &NestedBlock, len: u32, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    if len < nested.min_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Block '{}' requires at least {} item(s), got {}",
                path, nested.min_items, len
            ))
            .with_attribute(path),
        );
    }

    // 0 means unlimited
    if nested.max_items > 0 && len > nested.max_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Block '{}' allows at most {} item(s), got {}",
                path, nested.max_items, len
            ))
            .with_attribute(path),
        );
    }
}

fn validate_list_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s)",
                        path, nested.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        Some(Value::Array(arr)) => {
            check_item_count(nested, arr.len() as u32, path, diagnostics);
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{}.{}", path, i);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        Some(v) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected list for block '{}'", path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

fn validate_map_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s)",
                        path, nested.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        Some(Value::Object(obj)) => {
            check_item_count(nested, obj.len() as u32, path, diagnostics);
            for (key, item) in obj {
                let item_path = format!("{}.{}", path, key);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        Some(v) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected map for block '{}'", path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            if n.as_i64().is_some() {
                true
            } else if let Some(f) = n.as_f64() {
                f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64
            } else {
                false
            }
        },
        _ => false,
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic {
        severity: DiagnosticSeverity::Error,
        summary: format!("Invalid type for attribute '{}'", path),
        detail: Some(format!("Expected {}, got {}", expected, value_type_name(got))),
        attribute: Some(path.to_string()),
    }
}

trait DiagnosticExt {
    fn with_attribute_if_not_empty(self, path: &str) -> Self;
}

impl DiagnosticExt for Diagnostic {
    fn with_attribute_if_not_empty(self, path: &str) -> Self {
        if path.is_empty() {
            self
        } else {
            self.with_attribute(path)
        }
    }
}
