//! Resource and data-source definitions.
//!
//! Each DigitalOcean product implements [`Resource`] (and usually a matching
//! [`DataSource`]); the provider's lifecycle engine looks them up by name in
//! the [`ResourceRegistry`](crate::registry::ResourceRegistry) and drives them.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::context::OpContext;
use crate::error::ProviderError;
use crate::provider::ProviderMeta;
use crate::schema::Schema;
use crate::state::ResourceData;

/// Per-phase timeout bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Create budget, including provisioning waits.
    pub create: Duration,
    /// Read budget.
    pub read: Duration,
    /// Update budget, including waits.
    pub update: Duration,
    /// Delete budget, including disappearance waits.
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let twenty_minutes = Duration::from_secs(20 * 60);
        Self {
            create: twenty_minutes,
            read: Duration::from_secs(5 * 60),
            update: twenty_minutes,
            delete: twenty_minutes,
        }
    }
}

impl Timeouts {
    /// Override the create budget.
    pub fn with_create(mut self, timeout: Duration) -> Self {
        self.create = timeout;
        self
    }

    /// Override the update budget.
    pub fn with_update(mut self, timeout: Duration) -> Self {
        self.update = timeout;
        self
    }

    /// Override the delete budget.
    pub fn with_delete(mut self, timeout: Duration) -> Self {
        self.delete = timeout;
        self
    }
}

/// A declaratively managed DigitalOcean object.
///
/// Lifecycle methods receive the instance's attributes in `data` and leave it
/// reflecting the remote object. `read` clears the identifier when the object
/// is gone instead of failing.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Attribute schema.
    fn schema(&self) -> Schema;

    /// Per-phase timeouts.
    fn timeouts(&self) -> Timeouts {
        Timeouts::default()
    }

    /// Plan-time rule over the planned attributes and their prior values
    /// (see [`ResourceData::get_change`]); an error aborts the plan and the
    /// update before any API call.
    fn custom_diff(&self, _planned: &ResourceData) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Turn an import identifier into the minimal state `read` needs.
    fn import_state(&self, id: &str) -> Result<ResourceData, ProviderError> {
        if id.trim().is_empty() {
            return Err(ProviderError::Parse(
                "Empty import ID. Please verify the ID is correct".to_string(),
            ));
        }
        Ok(ResourceData::with_id(id.trim()))
    }

    /// Create the remote object and set the identifier.
    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError>;

    /// Refresh `data` from the remote object.
    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError>;

    /// Apply in-place changes. The default suits resources whose every
    /// attribute forces replacement.
    async fn update(
        &self,
        _ctx: &OpContext,
        _meta: &ProviderMeta,
        _data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Delete the remote object.
    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError>;
}

/// A read-only lookup.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Attribute schema.
    fn schema(&self) -> Schema;

    /// Resolve the lookup, filling `data` and setting its identifier.
    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError>;
}

/// Split a compound import ID such as `<id>,<region>` into `parts` fields.
///
/// Every field must be non-empty.
pub fn parse_compound_id(id: &str, parts: usize, format: &str) -> Result<Vec<String>, ProviderError> {
    let fields: Vec<String> = id.splitn(parts, ',').map(|s| s.trim().to_string()).collect();
    if fields.len() != parts || fields.iter().any(String::is_empty) {
        return Err(ProviderError::Parse(format!(
            "Unexpected format of ID ({}), expected {}. Please verify the ID is correct",
            id, format
        )));
    }
    Ok(fields)
}

/// Parse `<id>,<region>`, lower-casing the region.
pub fn parse_id_region(id: &str) -> Result<(String, String), ProviderError> {
    let mut fields = parse_compound_id(id, 2, "<id>,<region>")?;
    let region = fields.pop().unwrap_or_default().to_lowercase();
    let id = fields.pop().unwrap_or_default();
    Ok((id, region))
}

/// Drift handling for reads: a 404 clears the identifier, anything else fails.
pub fn clear_if_not_found(
    err: ProviderError,
    kind: &str,
    data: &mut ResourceData,
) -> Result<(), ProviderError> {
    if err.is_not_found() {
        warn!(id = data.id(), "{} not found, removing from state", kind);
        data.clear_id();
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_region() {
        let (id, region) = parse_id_region("share-1,ATL1").unwrap();
        assert_eq!(id, "share-1");
        assert_eq!(region, "atl1");
    }

    #[test]
    fn test_parse_compound_id_rejects_malformed() {
        for bad in ["123abc", ",atl1", "share-1,", ""] {
            let err = parse_id_region(bad).unwrap_err();
            assert!(
                err.message().contains("Please verify the ID is correct"),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn test_parse_three_part_id() {
        let fields = parse_compound_id("s1,v1,nyc3", 3, "<share_id>,<vpc_id>,<region>").unwrap();
        assert_eq!(fields, vec!["s1", "v1", "nyc3"]);
        assert!(parse_compound_id("s1,v1", 3, "<share_id>,<vpc_id>,<region>").is_err());
    }

    #[test]
    fn test_clear_if_not_found() {
        let mut data = ResourceData::with_id("gw-1");
        let gone = ProviderError::NotFound("gw-1".to_string());
        clear_if_not_found(gone, "NAT gateway", &mut data).unwrap();
        assert!(data.is_absent());

        let mut data = ResourceData::with_id("gw-1");
        let other = ProviderError::Transport("reset".to_string());
        assert!(clear_if_not_found(other, "NAT gateway", &mut data).is_err());
        assert_eq!(data.id(), "gw-1");
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default().with_delete(Duration::from_secs(120));
        assert_eq!(t.create, Duration::from_secs(1200));
        assert_eq!(t.delete, Duration::from_secs(120));
    }
}
