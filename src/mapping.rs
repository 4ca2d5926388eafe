//! Conversions between API wire shapes, nested attribute values and flat
//! attribute paths.
//!
//! Nested blocks are stored as lists (a single `config` block is
//! `[{"min_instances": 1}]`), so every leaf has a flat path such as
//! `config.0.min_instances`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ProviderError;

/// Resolve a flat path such as `egresses.0.public_gateways.0.ipv4`.
///
/// Numeric segments index into arrays; a numeric segment applied to an object
/// is treated as a key. Explicit nulls resolve to `None`.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Resolve a flat path inside an attribute map.
pub fn get_path_in<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = map.get(head)?;
    match rest {
        Some(rest) => get_path(value, rest),
        None if value.is_null() => None,
        None => Some(value),
    }
}

/// Flatten a nested value into `path → leaf` pairs.
///
/// Empty arrays and objects are kept as leaves so that "cleared" differs from
/// "absent"; nulls are dropped.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    let child = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    };
    match value {
        Value::Null => {},
        Value::Object(map) if !map.is_empty() => {
            for (key, v) in map {
                flatten_into(&child(key), v, out);
            }
        },
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(&child(&i.to_string()), v, out);
            }
        },
        other => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), other.clone());
            }
        },
    }
}

/// Serialize a wire record as a single-element block list.
pub fn flatten_block<T: Serialize>(record: &T) -> Result<Value, ProviderError> {
    let value = serde_json::to_value(record)?;
    Ok(match value {
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![strip_nulls(other)]),
    })
}

/// Serialize a list of wire records as a block list.
pub fn flatten_blocks<T: Serialize>(records: &[T]) -> Result<Value, ProviderError> {
    let items = records
        .iter()
        .map(|r| serde_json::to_value(r).map(strip_nulls))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(items))
}

/// Deserialize the first element of a block list (or a bare object).
pub fn expand_block<T: DeserializeOwned>(value: Option<&Value>) -> Result<Option<T>, ProviderError> {
    let item = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => match items.first() {
            Some(first) => first,
            None => return Ok(None),
        },
        Some(other) => other,
    };
    Ok(Some(serde_json::from_value(strip_nulls(item.clone()))?))
}

/// Deserialize every element of a block list.
pub fn expand_blocks<T: DeserializeOwned>(value: Option<&Value>) -> Result<Vec<T>, ProviderError> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| serde_json::from_value(strip_nulls(item.clone())).map_err(Into::into))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

/// Collect strings from a list/set attribute value, skipping non-strings.
pub fn expand_strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Build a set attribute value: sorted and de-duplicated.
pub fn string_set<I, S>(values: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut items: Vec<String> = values.into_iter().map(Into::into).collect();
    items.sort();
    items.dedup();
    Value::Array(items.into_iter().map(Value::String).collect())
}

/// Build a list attribute value preserving order.
pub fn string_list<I, S>(values: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::Array(values.into_iter().map(|v| Value::String(v.into())).collect())
}

/// Remove null-valued keys recursively.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Normalize a region slug at ingress.
pub fn normalize_region(region: &str) -> String {
    region.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Config {
        min_instances: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_instances: Option<i64>,
    }

    #[test]
    fn test_get_path() {
        let value = json!({"egresses": [{"public_gateways": [{"ipv4": "203.0.113.1"}]}], "n": null});
        assert_eq!(
            get_path(&value, "egresses.0.public_gateways.0.ipv4"),
            Some(&json!("203.0.113.1"))
        );
        assert_eq!(get_path(&value, "egresses.1"), None);
        assert_eq!(get_path(&value, "n"), None);
        assert_eq!(get_path(&value, "missing.0"), None);
    }

    #[test]
    fn test_get_path_in() {
        let map = json!({"config": [{"min_instances": 2}], "name": "pool"});
        let map = map.as_object().unwrap();
        assert_eq!(get_path_in(map, "config.0.min_instances"), Some(&json!(2)));
        assert_eq!(get_path_in(map, "name"), Some(&json!("pool")));
        assert_eq!(get_path_in(map, "nope"), None);
    }

    #[test]
    fn test_flatten() {
        let flat = flatten(&json!({
            "name": "pool",
            "config": [{"min_instances": 1, "max_instances": 3}],
            "tags": [],
            "gone": null
        }));
        assert_eq!(flat.get("name"), Some(&json!("pool")));
        assert_eq!(flat.get("config.0.min_instances"), Some(&json!(1)));
        assert_eq!(flat.get("config.0.max_instances"), Some(&json!(3)));
        assert_eq!(flat.get("tags"), Some(&json!([])));
        assert!(!flat.contains_key("gone"));
    }

    #[test]
    fn test_block_helpers() {
        let block = flatten_block(&Config {
            min_instances: 1,
            max_instances: None,
        })
        .unwrap();
        assert_eq!(block, json!([{"min_instances": 1}]));

        let back: Option<Config> = expand_block(Some(&block)).unwrap();
        assert_eq!(
            back,
            Some(Config {
                min_instances: 1,
                max_instances: None
            })
        );

        let none: Option<Config> = expand_block(Some(&json!([]))).unwrap();
        assert!(none.is_none());

        let bare: Option<Config> = expand_block(Some(&json!({"min_instances": 4, "max_instances": null}))).unwrap();
        assert_eq!(bare.unwrap().min_instances, 4);
    }

    #[test]
    fn test_expand_blocks() {
        let configs: Vec<Config> = expand_blocks(Some(&json!([
            {"min_instances": 1},
            {"min_instances": 2, "max_instances": 5}
        ])))
        .unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].max_instances, Some(5));
        assert!(expand_blocks::<Config>(None).unwrap().is_empty());
    }

    #[test]
    fn test_string_collections() {
        assert_eq!(string_set(["b", "a", "b"]), json!(["a", "b"]));
        assert_eq!(string_list(["b", "a"]), json!(["b", "a"]));
        assert_eq!(
            expand_strings(Some(&json!(["x", 1, "y"]))),
            vec!["x".to_string(), "y".to_string()]
        );
        assert!(expand_strings(None).is_empty());
    }

    #[test]
    fn test_normalize_region() {
        assert_eq!(normalize_region(" NYC3 "), "nyc3");
    }
}
