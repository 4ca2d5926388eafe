//! Typed access to a resource instance's attributes.
//!
//! [`ResourceData`] is the in-memory form of one resource instance: the remote
//! identifier plus an attribute map conforming to the resource schema. During
//! an update it also carries the prior state so lifecycle code can ask which
//! fields changed. The identifier lives in the `id` attribute; an empty
//! identifier means the instance is absent.

use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::mapping::{expand_strings, get_path_in};

/// Attribute holding the remote identifier.
pub const ID_KEY: &str = "id";

/// One resource instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceData {
    attrs: Map<String, Value>,
    prior: Option<Map<String, Value>>,
}

impl ResourceData {
    /// An empty, absent instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// An instance holding only an identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut data = Self::new();
        data.set_id(id);
        data
    }

    /// Build from a state or configuration value. `null` yields an absent instance.
    pub fn from_value(value: Value) -> Result<Self, ProviderError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(attrs) => Ok(Self { attrs, prior: None }),
            other => Err(ProviderError::InvalidRequest(format!(
                "resource state must be an object, got {}",
                other
            ))),
        }
    }

    /// Attach the prior state used by [`ResourceData::has_change`].
    pub fn with_prior(mut self, prior: Value) -> Result<Self, ProviderError> {
        self.prior = Self::from_value(prior)?.attrs.into();
        Ok(self)
    }

    /// The remote identifier, or `""` when absent.
    pub fn id(&self) -> &str {
        self.attrs.get(ID_KEY).and_then(Value::as_str).unwrap_or("")
    }

    /// Set the remote identifier.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.attrs.insert(ID_KEY.to_string(), Value::String(id.into()));
    }

    /// Mark the instance absent (deleted out of band or destroyed).
    pub fn clear_id(&mut self) {
        self.attrs.insert(ID_KEY.to_string(), Value::String(String::new()));
    }

    /// Whether the instance is considered absent.
    pub fn is_absent(&self) -> bool {
        self.id().is_empty()
    }

    /// Read a flat attribute path. Nulls read as `None`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path_in(&self.attrs, path)
    }

    /// Read a string attribute.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Read a string attribute, defaulting to `""`.
    pub fn get_string(&self, path: &str) -> String {
        self.get_str(path).unwrap_or_default().to_string()
    }

    /// Read an integer attribute. Integral floats are accepted.
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        let value = self.get(path)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
    }

    /// Read a float attribute.
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    /// Read a boolean attribute.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Read a list or set of strings.
    pub fn get_strings(&self, path: &str) -> Vec<String> {
        expand_strings(self.get(path))
    }

    /// Read a string attribute that must be present and non-empty.
    pub fn require_str(&self, path: &str) -> Result<&str, ProviderError> {
        match self.get_str(path) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(ProviderError::Validation(format!(
                "Missing required attribute '{}'",
                path
            ))),
        }
    }

    /// Whether a top-level attribute is present and non-null.
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Write a top-level attribute.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.attrs.insert(key.to_string(), value.into());
    }

    /// Remove a top-level attribute.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attrs.remove(key)
    }

    /// Prior value of a flat path, if a prior state is attached.
    pub fn prior(&self, path: &str) -> Option<&Value> {
        self.prior.as_ref().and_then(|p| get_path_in(p, path))
    }

    /// `(prior, current)` values of a flat path.
    pub fn get_change(&self, path: &str) -> (Option<&Value>, Option<&Value>) {
        (self.prior(path), self.get(path))
    }

    /// Whether a flat path differs from the prior state.
    ///
    /// Without a prior state nothing has changed. Arrays of scalars compare
    /// order-insensitively so set attributes do not report spurious changes.
    pub fn has_change(&self, path: &str) -> bool {
        if self.prior.is_none() {
            return false;
        }
        let (old, new) = self.get_change(path);
        !values_equivalent(old, new)
    }

    /// Whether any of the given paths changed.
    pub fn has_changes(&self, paths: &[&str]) -> bool {
        paths.iter().any(|p| self.has_change(p))
    }

    /// Borrow the attribute map.
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attrs
    }

    /// The state value handed back to the host: `null` when absent.
    pub fn to_value(&self) -> Value {
        if self.is_absent() {
            Value::Null
        } else {
            Value::Object(self.attrs.clone())
        }
    }

    /// Consume into the state value handed back to the host.
    pub fn into_value(self) -> Value {
        if self.is_absent() {
            Value::Null
        } else {
            Value::Object(self.attrs)
        }
    }
}

/// Equality where null == missing and scalar arrays compare as sets.
pub fn values_equivalent(old: Option<&Value>, new: Option<&Value>) -> bool {
    match (old, new) {
        (None, None) => true,
        (Some(Value::Array(a)), None) | (None, Some(Value::Array(a))) => a.is_empty(),
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            if a.len() != b.len() {
                return false;
            }
            if a.iter().all(is_scalar) && b.iter().all(is_scalar) {
                let mut a: Vec<String> = a.iter().map(Value::to_string).collect();
                let mut b: Vec<String> = b.iter().map(Value::to_string).collect();
                a.sort();
                b.sort();
                a == b
            } else {
                a == b
            }
        },
        (Some(a), Some(b)) => numbers_equal(a, b).unwrap_or(a == b),
        _ => false,
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn numbers_equal(a: &Value, b: &Value) -> Option<bool> {
    Some(a.as_f64()? == b.as_f64()?)
}
