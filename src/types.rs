//! Convenience types exchanged with the host runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder shown instead of a sensitive value in plans and logs.
pub const SENSITIVE_MARKER: &str = "(sensitive value)";

/// A change to a single attribute during a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The path to the attribute that changed.
    pub path: String,
    /// The value before the change (None if creating).
    pub before: Option<serde_json::Value>,
    /// The value after the change (None if deleting).
    pub after: Option<serde_json::Value>,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(
        path: impl Into<String>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// Create a change for a new attribute.
    pub fn added(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// Create a change for a removed attribute.
    pub fn removed(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// Create a change for a modified attribute.
    pub fn modified(
        path: impl Into<String>,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        Self::new(path, Some(before), Some(after))
    }

    /// Replace both sides with [`SENSITIVE_MARKER`].
    pub fn redacted(self) -> Self {
        let marker = || serde_json::Value::String(SENSITIVE_MARKER.to_string());
        Self {
            path: self.path,
            before: self.before.map(|_| marker()),
            after: self.after.map(|_| marker()),
        }
    }
}

/// The result of a plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The planned state after the operation.
    pub planned_state: serde_json::Value,
    /// The list of attribute changes.
    pub changes: Vec<AttributeChange>,
    /// Whether the resource requires replacement.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Create a plan result with no changes.
    pub fn no_change(state: serde_json::Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    /// Create a plan result with changes.
    pub fn with_changes(
        planned_state: serde_json::Value,
        changes: Vec<AttributeChange>,
        requires_replace: bool,
    ) -> Self {
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.requires_replace
    }
}

/// An imported resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// The resource type.
    pub resource_type: String,
    /// The imported state.
    pub state: serde_json::Value,
}

impl ImportedResource {
    /// Create a new imported resource.
    pub fn new(resource_type: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Provider metadata returned by `ProviderService::metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// List of resource type names.
    pub resources: Vec<String>,
    /// List of data source type names.
    pub data_sources: Vec<String>,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
}

/// Server capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Whether the provider supports planning destroy operations.
    pub plan_destroy: bool,
}

/// A value that must never reach logs or plan output.
///
/// `Debug` and `Display` print [`SENSITIVE_MARKER`]; use [`Sensitive::expose`]
/// at the one place the raw value is needed.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    /// Wrap a secret.
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the raw secret.
    pub fn expose(&self) -> &T {
        &self.0
    }

    /// Unwrap the raw secret.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SENSITIVE_MARKER)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SENSITIVE_MARKER)
    }
}

impl From<String> for Sensitive<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Sensitive<String> {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_change_constructors() {
        let added = AttributeChange::added("name", json!("test"));
        assert!(added.before.is_none());
        assert_eq!(added.after, Some(json!("test")));

        let removed = AttributeChange::removed("name", json!("old"));
        assert_eq!(removed.before, Some(json!("old")));
        assert!(removed.after.is_none());

        let modified = AttributeChange::modified("size", json!(50), json!(60));
        assert_eq!(modified.before, Some(json!(50)));
        assert_eq!(modified.after, Some(json!(60)));
    }

    #[test]
    fn test_attribute_change_redacted() {
        let change = AttributeChange::modified("docker_credentials", json!("old"), json!("new"))
            .redacted();
        assert_eq!(change.before, Some(json!(SENSITIVE_MARKER)));
        assert_eq!(change.after, Some(json!(SENSITIVE_MARKER)));

        let added = AttributeChange::added("api_key", json!("sk-123")).redacted();
        assert!(added.before.is_none());
        assert_eq!(added.after, Some(json!(SENSITIVE_MARKER)));
    }

    #[test]
    fn test_plan_result() {
        let no_change = PlanResult::no_change(json!({"id": "123"}));
        assert!(no_change.is_empty());

        let with_changes = PlanResult::with_changes(
            json!({"id": "123", "size": 60}),
            vec![AttributeChange::modified("size", json!(50), json!(60))],
            false,
        );
        assert_eq!(with_changes.changes.len(), 1);
        assert!(!with_changes.is_empty());
    }

    #[test]
    fn test_imported_resource() {
        let imported = ImportedResource::new("digitalocean_vpc", json!({"id": "vpc-1"}));
        assert_eq!(imported.resource_type, "digitalocean_vpc");
        assert_eq!(imported.state["id"], "vpc-1");
    }

    #[test]
    fn test_sensitive_never_formats_value() {
        let token = Sensitive::from("dop_v1_secret");
        assert_eq!(format!("{}", token), SENSITIVE_MARKER);
        assert_eq!(format!("{:?}", token), SENSITIVE_MARKER);
        assert_eq!(token.expose(), "dop_v1_secret");
    }
}
