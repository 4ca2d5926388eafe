//! Plan computation: what an apply would change.
//!
//! Works on whole attribute maps against a resource schema. Scalar attributes
//! and attribute-level sets are reported at their own path; nested blocks are
//! reported per leaf (`config.0.min_instances`). Sensitive values never reach
//! the change list.

use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::mapping::flatten;
use crate::schema::{Attribute, Block, NestedBlock, Schema};
use crate::state::{values_equivalent, ID_KEY};
use crate::types::{AttributeChange, PlanResult};

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn as_object(value: &Value, what: &str) -> Result<Map<String, Value>, ProviderError> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        other => Err(ProviderError::InvalidRequest(format!(
            "{} must be an object, got {}",
            what, other
        ))),
    }
}

/// Resolve a flat path to its attribute declaration, skipping list indices.
fn attribute_at<'a>(block: &'a Block, path: &str) -> Option<&'a Attribute> {
    let mut current = block;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if let Some(attr) = current.attributes.get(segment) {
            return Some(attr);
        }
        let nested = current.blocks.get(segment)?;
        current = &nested.block;
        if segments.peek().is_some_and(|s| s.parse::<usize>().is_ok()) {
            segments.next();
        }
    }
    None
}

fn is_sensitive(schema: &Schema, path: &str) -> bool {
    attribute_at(&schema.block, path).is_some_and(|a| a.flags.sensitive)
}

fn change(schema: &Schema, path: String, before: Option<&Value>, after: Option<&Value>) -> AttributeChange {
    let change = AttributeChange::new(path, before.cloned(), after.cloned());
    if is_sensitive(schema, &change.path) {
        change.redacted()
    } else {
        change
    }
}

fn leaf_changes(schema: &Schema, state: &Map<String, Value>, added: bool) -> Vec<AttributeChange> {
    flatten(&Value::Object(state.clone()))
        .into_iter()
        .map(|(path, value)| {
            if added {
                change(schema, path, None, Some(&value))
            } else {
                change(schema, path, Some(&value), None)
            }
        })
        .collect()
}

/// Diff one nested block leaf by leaf, under `name`.
fn block_changes(
    schema: &Schema,
    name: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Vec<AttributeChange> {
    let wrap = |v: Option<&Value>| {
        let mut map = Map::new();
        if let Some(v) = v {
            map.insert(name.to_string(), v.clone());
        }
        flatten(&Value::Object(map))
    };
    let old = wrap(before);
    let new = wrap(after);
    let mut paths: Vec<&String> = old.keys().chain(new.keys()).collect();
    paths.sort();
    paths.dedup();
    paths
        .into_iter()
        .filter(|p| !values_equivalent(old.get(*p), new.get(*p)))
        .map(|p| change(schema, p.clone(), old.get(p), new.get(p)))
        .collect()
}

/// Carry prior values of computed attributes inside a block list whose
/// elements the configuration only partly specifies.
fn fill_block_computed(nested: &NestedBlock, planned: &mut Value, prior: &Value) {
    let (Value::Array(new_items), Value::Array(old_items)) = (planned, prior) else {
        return;
    };
    if new_items.len() != old_items.len() {
        return;
    }
    for (new, old) in new_items.iter_mut().zip(old_items) {
        let (Value::Object(new), Value::Object(old)) = (new, old) else {
            continue;
        };
        for (name, attr) in &nested.block.attributes {
            if attr.flags.computed && present(new.get(name)).is_none() {
                if let Some(value) = present(old.get(name)) {
                    new.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

/// Compute the plan for one resource instance.
///
/// * `prior = None` (or null) plans a create: every configured leaf is added.
/// * `proposed = null` plans a delete: every prior leaf is removed.
/// * otherwise an update: unset computed attributes keep their prior values,
///   sets compare order-insensitively, and a changed force-new attribute or
///   block marks the plan as a replacement.
///
/// `proposed` is expected to have been coerced and defaulted already.
pub fn plan_resource(
    schema: &Schema,
    prior: Option<&Value>,
    proposed: &Value,
) -> Result<PlanResult, ProviderError> {
    let prior = present(prior);

    if proposed.is_null() {
        return Ok(match prior {
            Some(prior) => {
                let prior = as_object(prior, "prior state")?;
                PlanResult::with_changes(Value::Null, leaf_changes(schema, &prior, false), false)
            },
            None => PlanResult::no_change(Value::Null),
        });
    }

    let mut planned = as_object(proposed, "proposed state")?;

    let Some(prior) = prior else {
        let changes = leaf_changes(schema, &planned, true);
        return Ok(PlanResult::with_changes(Value::Object(planned), changes, false));
    };
    let prior = as_object(prior, "prior state")?;

    if present(planned.get(ID_KEY)).is_none() {
        if let Some(id) = prior.get(ID_KEY) {
            planned.insert(ID_KEY.to_string(), id.clone());
        }
    }
    for (name, attr) in &schema.block.attributes {
        if attr.flags.computed && present(planned.get(name)).is_none() {
            if let Some(old) = present(prior.get(name)) {
                planned.insert(name.clone(), old.clone());
            }
        }
    }
    for (name, nested) in &schema.block.blocks {
        let old = present(prior.get(name));
        if nested.computed && present(planned.get(name)).is_none() {
            if let Some(old) = old {
                planned.insert(name.clone(), old.clone());
            }
        } else if let (Some(new), Some(old)) = (planned.get_mut(name), old) {
            fill_block_computed(nested, new, old);
        }
    }

    let mut changes = Vec::new();
    let mut requires_replace = false;

    let mut names: Vec<&String> = schema.block.attributes.keys().collect();
    names.sort();
    for name in names {
        let attr = &schema.block.attributes[name];
        let before = present(prior.get(name));
        let after = present(planned.get(name));
        if values_equivalent(before, after) {
            continue;
        }
        requires_replace |= attr.force_new;
        changes.push(change(schema, name.clone(), before, after));
    }

    let mut blocks: Vec<&String> = schema.block.blocks.keys().collect();
    blocks.sort();
    for name in blocks {
        let nested = &schema.block.blocks[name];
        let before = present(prior.get(name));
        let after = present(planned.get(name));
        if values_equivalent(before, after) {
            continue;
        }
        let leaves = block_changes(schema, name, before, after);
        if leaves.is_empty() {
            continue;
        }
        requires_replace |= nested.force_new
            || leaves.iter().any(|c| {
                attribute_at(&schema.block, &c.path).is_some_and(|a| a.force_new)
            });
        changes.extend(leaves);
    }

    Ok(PlanResult::with_changes(
        Value::Object(planned),
        changes,
        requires_replace,
    ))
}

/// Names of force-new attributes and blocks whose values differ between
/// `prior` and `planned`.
pub fn replacing_changes(schema: &Schema, prior: &Value, planned: &Value) -> Vec<String> {
    let mut out: Vec<String> = schema
        .block
        .attributes
        .iter()
        .filter(|(_, attr)| attr.force_new)
        .map(|(name, _)| name)
        .chain(
            schema
                .block
                .blocks
                .iter()
                .filter(|(_, nested)| nested.force_new)
                .map(|(name, _)| name),
        )
        .filter(|name| {
            !values_equivalent(present(prior.get(name.as_str())), present(planned.get(name.as_str())))
        })
        .cloned()
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeFlags, NestedBlock};
    use crate::types::SENSITIVE_MARKER;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("region", Attribute::required_string().with_force_new())
            .with_attribute("size", Attribute::required_int64())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("tier", Attribute::optional_computed_string())
            .with_attribute("tags", Attribute::string_set(AttributeFlags::optional()))
            .with_attribute("api_key", Attribute::optional_string().sensitive())
            .with_block(
                "bgp",
                NestedBlock::list(
                    Block::new()
                        .with_attribute("local_asn", Attribute::optional_int64())
                        .with_attribute("auth_key", Attribute::optional_string().sensitive()),
                )
                .with_max_items(1),
            )
    }

    fn prior() -> Value {
        json!({
            "id": "x1",
            "name": "share",
            "region": "atl1",
            "size": 50,
            "status": "ACTIVE",
            "tier": "basic",
            "tags": ["a", "b"],
            "bgp": [{"local_asn": 64532, "auth_key": "hunter2"}]
        })
    }

    #[test]
    fn test_create_lists_configured_leaves() {
        let proposed = json!({"name": "share", "region": "atl1", "size": 50, "bgp": [{"local_asn": 1}]});
        let plan = plan_resource(&schema(), None, &proposed).unwrap();
        let paths: Vec<&str> = plan.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["bgp.0.local_asn", "name", "region", "size"]);
        assert!(!plan.requires_replace);
        assert_eq!(plan.planned_state, proposed);
    }

    #[test]
    fn test_identical_update_is_empty() {
        let plan = plan_resource(&schema(), Some(&prior()), &prior()).unwrap();
        assert!(plan.is_empty(), "{:?}", plan.changes);
    }

    #[test]
    fn test_unset_computed_attributes_keep_prior() {
        let proposed = json!({
            "name": "share",
            "region": "atl1",
            "size": 50,
            "tags": ["b", "a"],
            "bgp": [{"local_asn": 64532, "auth_key": "hunter2"}]
        });
        let plan = plan_resource(&schema(), Some(&prior()), &proposed).unwrap();
        assert!(plan.is_empty(), "{:?}", plan.changes);
        assert_eq!(plan.planned_state["id"], "x1");
        assert_eq!(plan.planned_state["status"], "ACTIVE");
        assert_eq!(plan.planned_state["tier"], "basic");
    }

    #[test]
    fn test_in_place_and_replacing_changes() {
        let mut proposed = prior();
        proposed["size"] = json!(60);
        let plan = plan_resource(&schema(), Some(&prior()), &proposed).unwrap();
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0], AttributeChange::modified("size", json!(50), json!(60)));
        assert!(!plan.requires_replace);

        proposed["region"] = json!("nyc3");
        let plan = plan_resource(&schema(), Some(&prior()), &proposed).unwrap();
        assert!(plan.requires_replace);
        assert_eq!(
            replacing_changes(&schema(), &prior(), &proposed),
            vec!["region".to_string()]
        );
    }

    #[test]
    fn test_sensitive_values_are_redacted() {
        let mut proposed = prior();
        proposed["bgp"] = json!([{"local_asn": 64532, "auth_key": "correct-horse"}]);
        proposed["api_key"] = json!("sk-secret");
        let plan = plan_resource(&schema(), Some(&prior()), &proposed).unwrap();

        let paths: Vec<&str> = plan.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["api_key", "bgp.0.auth_key"]);
        for change in &plan.changes {
            assert_eq!(change.after, Some(json!(SENSITIVE_MARKER)));
        }
        let rendered = serde_json::to_string(&plan.changes).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("correct-horse"));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn test_delete_removes_everything() {
        let plan = plan_resource(&schema(), Some(&prior()), &Value::Null).unwrap();
        assert_eq!(plan.planned_state, Value::Null);
        assert!(plan.changes.iter().all(|c| c.after.is_none()));
        assert!(plan.changes.iter().any(|c| c.path == "id"));
        let auth = plan.changes.iter().find(|c| c.path == "bgp.0.auth_key").unwrap();
        assert_eq!(auth.before, Some(json!(SENSITIVE_MARKER)));
    }

    #[test]
    fn test_non_object_state_is_rejected() {
        let err = plan_resource(&schema(), None, &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[test]
    fn test_computed_block_leaves_keep_prior() {
        let schema = Schema::v0().with_block(
            "vpcs",
            NestedBlock::list(
                Block::new()
                    .with_attribute("vpc_uuid", Attribute::required_string())
                    .with_attribute("gateway_ip", Attribute::computed_string()),
            ),
        );
        let prior = json!({"id": "gw", "vpcs": [{"vpc_uuid": "v1", "gateway_ip": "10.0.0.1"}]});
        let plan = plan_resource(&schema, Some(&prior), &json!({"vpcs": [{"vpc_uuid": "v1"}]})).unwrap();
        assert!(plan.is_empty(), "{:?}", plan.changes);
        assert_eq!(plan.planned_state["vpcs"][0]["gateway_ip"], "10.0.0.1");
    }
}
