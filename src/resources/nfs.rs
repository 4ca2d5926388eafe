//! NFS shares.
//!
//! Shares are region-scoped: every request carries `?region=`, and imports
//! take `<id>,<region>`. A share is created inside a bootstrap VPC
//! (`vpc_id`); `digitalocean_nfs_attachment` may later move it, so the live
//! binding is reported separately in `vpc_ids`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::attachment::{STATUS_ACTIVE, STATUS_INACTIVE};
use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::lookup::{find_one, parse_timestamp, NameFilter, Named};
use crate::mapping::{normalize_region, string_set};
use crate::pagination::{list_all, ListRequest, LOOKUP_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, parse_id_region, DataSource, Resource};
use crate::resources::region_query;
use crate::schema::{Attribute, AttributeFlags, Constraint, Schema, Validator};
use crate::state::ResourceData;
use crate::waiter::{observe, wait_for_state, StateChangeConf};

pub(crate) const SHARES_PATH: &str = "/v2/nfs";

const STATUS_CREATING: &str = "CREATING";
const STATUS_RESIZING: &str = "RESIZING";

/// Smallest share the API provisions, in GiB.
pub const MIN_SIZE_GIB: i64 = 50;

/// An NFS share as the API returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct NfsShare {
    pub id: String,
    pub name: String,
    pub size_gib: i64,
    pub region: String,
    pub status: String,
    pub created_at: String,
    pub vpc_ids: Vec<String>,
    pub mount_path: String,
    pub host: String,
}

impl Named for NfsShare {
    fn name(&self) -> &str {
        &self.name
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(Some(&self.created_at))
    }
}

pub(crate) fn share_path(id: &str) -> String {
    format!("{}/{}", SHARES_PATH, id)
}

pub(crate) async fn get_share(
    ctx: &OpContext,
    client: &Client,
    id: &str,
    region: &str,
) -> Result<NfsShare, ProviderError> {
    let body = client.get(ctx, &share_path(id), &region_query(region)).await?;
    extract(&body, "share")
}

pub(crate) async fn list_shares(
    ctx: &OpContext,
    client: &Client,
    region: &str,
) -> Result<Vec<NfsShare>, ProviderError> {
    let request = ListRequest::new(SHARES_PATH, "shares")
        .with_query("region", region)
        .with_per_page(LOOKUP_PER_PAGE);
    list_all(client, ctx, &request, |s: &NfsShare| s.id.clone()).await
}

/// Submit a share action (`resize`, `attach`, `detach`, `snapshot`).
pub(crate) async fn share_action(
    ctx: &OpContext,
    client: &Client,
    id: &str,
    region: &str,
    action: &str,
    params: Value,
) -> Result<Value, ProviderError> {
    let body = json!({"type": action, "region": region, "params": params});
    client
        .post(ctx, &format!("{}/actions", share_path(id)), body)
        .await
}

fn set_state(data: &mut ResourceData, share: &NfsShare) {
    data.set_id(share.id.as_str());
    data.set("name", share.name.as_str());
    data.set("region", normalize_region(&share.region));
    data.set("size", share.size_gib);
    data.set("status", share.status.as_str());
    data.set("host", share.host.as_str());
    data.set("mount_path", share.mount_path.as_str());
    data.set("vpc_ids", string_set(share.vpc_ids.iter().cloned()));
    data.set("created_at", share.created_at.as_str());
}

/// `digitalocean_nfs`
#[derive(Debug, Clone, Copy, Default)]
pub struct NfsResource;

#[async_trait]
impl Resource for NfsResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A managed NFS share.")
            .with_attribute(
                "name",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "region",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "size",
                Attribute::required_int64()
                    .with_validator(Validator::int_between(MIN_SIZE_GIB, 16384))
                    .with_description("Size in GiB. Can only be increased."),
            )
            .with_attribute(
                "vpc_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("VPC the share is created in."),
            )
            .with_attribute(
                "vpc_ids",
                Attribute::string_set(AttributeFlags::computed())
                    .with_description("VPCs the share is currently attached to."),
            )
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("host", Attribute::computed_string())
            .with_attribute("mount_path", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
    }

    fn custom_diff(&self, planned: &ResourceData) -> Result<(), ProviderError> {
        let (old, new) = planned.get_change("size");
        let old = old.and_then(Value::as_i64);
        let new = new.and_then(Value::as_i64);
        if let (Some(old), Some(new)) = (old, new) {
            if new < old {
                return Err(ProviderError::FailedPrecondition(format!(
                    "share `size` can only be expanded and not shrunk ({} -> {})",
                    old, new
                )));
            }
        }
        Ok(())
    }

    fn import_state(&self, id: &str) -> Result<ResourceData, ProviderError> {
        let (id, region) = parse_id_region(id)?;
        let mut data = ResourceData::with_id(id);
        data.set("region", region);
        Ok(data)
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let region = normalize_region(data.require_str("region")?);
        let body = json!({
            "name": data.require_str("name")?,
            "size_gib": data.get_i64("size").unwrap_or(MIN_SIZE_GIB),
            "region": region.as_str(),
            "vpc_ids": [data.require_str("vpc_id")?],
        });
        let response = meta.client.post(ctx, SHARES_PATH, body).await?;
        let share: NfsShare = extract(&response, "share")?;
        info!(id = %share.id, region = %region, "NFS share created, waiting for it to become active");
        data.set_id(share.id.as_str());

        let client = &meta.client;
        let id = share.id.as_str();
        let region = region.as_str();
        let conf = StateChangeConf::new(&[STATUS_CREATING], &[STATUS_ACTIVE])
            .with_timeout(Duration::from_secs(5 * 60));
        wait_for_state(ctx, &conf, move || async move {
            observe(get_share(ctx, client, id, region).await, |s| s.status.clone())
        })
        .await?;
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let region = normalize_region(data.require_str("region")?);
        match get_share(ctx, &meta.client, data.id(), &region).await {
            Ok(share) => {
                set_state(data, &share);
                if !data.is_set("vpc_id") {
                    if let Some(vpc_id) = share.vpc_ids.first() {
                        data.set("vpc_id", vpc_id.as_str());
                    }
                }
                Ok(())
            },
            Err(err) => clear_if_not_found(err, "NFS share", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_change("size") {
            return Ok(());
        }
        let size = data
            .get_i64("size")
            .ok_or_else(|| ProviderError::Validation("Missing required attribute 'size'".to_string()))?;
        let region = normalize_region(data.require_str("region")?);
        let id = data.id().to_string();
        let client = &meta.client;

        share_action(ctx, client, &id, &region, "resize", json!({"size_gib": size})).await?;
        info!(id = %id, size, "NFS share resize requested");

        let (id, region) = (id.as_str(), region.as_str());
        let conf = StateChangeConf::new(&[STATUS_RESIZING], &[STATUS_ACTIVE])
            .with_timeout(Duration::from_secs(5 * 60));
        wait_for_state(ctx, &conf, move || async move {
            observe(get_share(ctx, client, id, region).await, |s| {
                if s.status == STATUS_ACTIVE && s.size_gib != size {
                    STATUS_RESIZING.to_string()
                } else {
                    s.status.clone()
                }
            })
        })
        .await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let region = normalize_region(data.require_str("region")?);
        let id = data.id().to_string();
        let client = &meta.client;

        if let Err(err) = client.delete(ctx, &share_path(&id), &region_query(&region)).await {
            return clear_if_not_found(err, "NFS share", data);
        }

        let (id_ref, region_ref) = (id.as_str(), region.as_str());
        let conf = StateChangeConf::until_gone(&[STATUS_ACTIVE, STATUS_INACTIVE, "DELETING"]);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_share(ctx, client, id_ref, region_ref).await, |s| s.status.clone())
        })
        .await?;
        info!(id = %id, "NFS share deleted");
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_nfs` data source: by id or by name within a region.
#[derive(Debug, Clone, Copy, Default)]
pub struct NfsDataSource;

#[async_trait]
impl DataSource for NfsDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::optional_computed_string())
            .with_attribute("name", Attribute::optional_computed_string())
            .with_attribute("region", Attribute::required_string())
            .with_attribute("size", Attribute::computed_int64())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("host", Attribute::computed_string())
            .with_attribute("mount_path", Attribute::computed_string())
            .with_attribute("vpc_ids", Attribute::string_set(AttributeFlags::computed()))
            .with_attribute("created_at", Attribute::computed_string())
            .with_constraint(Constraint::exactly_one_of(["id", "name"]))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let region = normalize_region(data.require_str("region")?);
        let share = match data.get_str("id").filter(|s| !s.is_empty()) {
            Some(id) => get_share(ctx, &meta.client, id, &region).await?,
            None => {
                let filter = NameFilter::Exact(data.require_str("name")?.to_string());
                let shares = list_shares(ctx, &meta.client, &region).await?;
                find_one(shares, "NFS share", &filter, false)?
            },
        };
        set_state(data, &share);
        Ok(())
    }
}
