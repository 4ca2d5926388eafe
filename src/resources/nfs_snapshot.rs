//! NFS share snapshots.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::lookup::{find_one, parse_timestamp, NameFilter, Named};
use crate::mapping::normalize_region;
use crate::pagination::{list_all, ListRequest, LOOKUP_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, parse_id_region, DataSource, Resource};
use crate::resources::nfs::share_action;
use crate::resources::region_query;
use crate::schema::{Attribute, Constraint, Schema, Validator};
use crate::state::ResourceData;
use crate::waiter::{observe, wait_for_state, StateChangeConf, NOT_FOUND_STATE};

const SNAPSHOTS_PATH: &str = "/v2/nfs/snapshots";

const STATUS_CREATING: &str = "SNAPSHOT_CREATING";
const STATUS_AVAILABLE: &str = "SNAPSHOT_AVAILABLE";
const STATUS_DELETING: &str = "SNAPSHOT_DELETING";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct NfsSnapshot {
    id: String,
    name: String,
    size_gib: i64,
    region: String,
    status: String,
    created_at: String,
    share_id: String,
}

impl Named for NfsSnapshot {
    fn name(&self) -> &str {
        &self.name
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(Some(&self.created_at))
    }
}

fn snapshot_path(id: &str) -> String {
    format!("{}/{}", SNAPSHOTS_PATH, id)
}

async fn get_snapshot(
    ctx: &OpContext,
    client: &Client,
    id: &str,
    region: &str,
) -> Result<NfsSnapshot, ProviderError> {
    let body = client.get(ctx, &snapshot_path(id), &region_query(region)).await?;
    extract(&body, "snapshot")
}

async fn list_snapshots(
    ctx: &OpContext,
    client: &Client,
    region: &str,
    share_id: Option<&str>,
) -> Result<Vec<NfsSnapshot>, ProviderError> {
    let mut request = ListRequest::new(SNAPSHOTS_PATH, "snapshots")
        .with_query("region", region)
        .with_per_page(LOOKUP_PER_PAGE);
    if let Some(share_id) = share_id {
        request = request.with_query("share_id", share_id);
    }
    list_all(client, ctx, &request, |s: &NfsSnapshot| s.id.clone()).await
}

fn set_state(data: &mut ResourceData, snapshot: &NfsSnapshot) {
    data.set_id(snapshot.id.as_str());
    data.set("name", snapshot.name.as_str());
    data.set("share_id", snapshot.share_id.as_str());
    data.set("region", normalize_region(&snapshot.region));
    data.set("size", snapshot.size_gib);
    data.set("status", snapshot.status.as_str());
    data.set("created_at", snapshot.created_at.as_str());
}

/// `digitalocean_nfs_snapshot`
#[derive(Debug, Clone, Copy, Default)]
pub struct NfsSnapshotResource;

#[async_trait]
impl Resource for NfsSnapshotResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A point-in-time snapshot of an NFS share.")
            .with_attribute(
                "name",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "share_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute("region", Attribute::required_string().with_force_new())
            .with_attribute("size", Attribute::computed_int64())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
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
        let name = data.require_str("name")?.to_string();
        let share_id = data.require_str("share_id")?.to_string();
        let region = normalize_region(data.require_str("region")?);
        let client = &meta.client;

        share_action(ctx, client, &share_id, &region, "snapshot", json!({"name": name})).await?;
        info!(share_id = %share_id, name = %name, "NFS snapshot requested");

        // The action does not return the snapshot; it shows up in the share's listing.
        let (name, share_id, region) = (name.as_str(), share_id.as_str(), region.as_str());
        let conf = StateChangeConf::new(&[STATUS_CREATING], &[STATUS_AVAILABLE])
            .with_timeout(Duration::from_secs(5 * 60));
        let (snapshot, _) = wait_for_state(ctx, &conf, move || async move {
            list_snapshots(ctx, client, region, Some(share_id)).await.map(|snapshots| {
                match snapshots.into_iter().find(|s| s.name == name) {
                    Some(snapshot) => {
                        let status = snapshot.status.clone();
                        (Some(snapshot), status)
                    },
                    None => (None, NOT_FOUND_STATE.to_string()),
                }
            })
        })
        .await?;

        let snapshot = snapshot.ok_or_else(|| {
            ProviderError::NotFound(format!("snapshot {} of share {} not found", name, share_id))
        })?;
        data.set_id(snapshot.id);
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let region = normalize_region(data.require_str("region")?);
        match get_snapshot(ctx, &meta.client, data.id(), &region).await {
            Ok(snapshot) => {
                set_state(data, &snapshot);
                Ok(())
            },
            Err(err) => clear_if_not_found(err, "NFS snapshot", data),
        }
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

        if let Err(err) = client.delete(ctx, &snapshot_path(&id), &region_query(&region)).await {
            return clear_if_not_found(err, "NFS snapshot", data);
        }

        let (id_ref, region_ref) = (id.as_str(), region.as_str());
        let conf = StateChangeConf::until_gone(&[STATUS_AVAILABLE, STATUS_DELETING]);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_snapshot(ctx, client, id_ref, region_ref).await, |s| s.status.clone())
        })
        .await?;
        info!(id = %id, "NFS snapshot deleted");
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_nfs_snapshot` data source: by id, exact name or name regex.
#[derive(Debug, Clone, Copy, Default)]
pub struct NfsSnapshotDataSource;

#[async_trait]
impl DataSource for NfsSnapshotDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::optional_computed_string())
            .with_attribute("name", Attribute::optional_computed_string())
            .with_attribute(
                "name_regex",
                Attribute::optional_string().with_validator(Validator::ValidRegexp),
            )
            .with_attribute(
                "most_recent",
                Attribute::optional_bool().with_default(json!(false)),
            )
            .with_attribute("share_id", Attribute::optional_computed_string())
            .with_attribute("region", Attribute::required_string())
            .with_attribute("size", Attribute::computed_int64())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_constraint(Constraint::exactly_one_of(["id", "name", "name_regex"]))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let region = normalize_region(data.require_str("region")?);
        let snapshot = if let Some(id) = data.get_str("id").filter(|s| !s.is_empty()) {
            get_snapshot(ctx, &meta.client, id, &region).await?
        } else {
            let filter = match data.get_str("name_regex") {
                Some(pattern) => NameFilter::regex(pattern)?,
                None => NameFilter::Exact(data.require_str("name")?.to_string()),
            };
            let share_id = data.get_str("share_id").filter(|s| !s.is_empty());
            let snapshots = list_snapshots(ctx, &meta.client, &region, share_id).await?;
            let most_recent = data.get_bool("most_recent").unwrap_or(false);
            find_one(snapshots, "NFS snapshot", &filter, most_recent)?
        };
        set_state(data, &snapshot);
        Ok(())
    }
}
