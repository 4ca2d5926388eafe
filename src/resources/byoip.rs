//! Bring-your-own-IP prefixes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::mapping::{flatten_blocks, normalize_region};
use crate::pagination::{list_all, ListRequest, DEFAULT_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, DataSource, Resource};
use crate::resources::set_optional_str;
use crate::schema::{Attribute, Block, NestedBlock, Schema, Validator};
use crate::state::ResourceData;
use crate::waiter::{observe, wait_for_state, StateChangeConf};

const PREFIXES_PATH: &str = "/v2/byoip_prefixes";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Prefix {
    uuid: String,
    prefix: String,
    region: String,
    status: String,
    advertised: bool,
    failure_reason: String,
}

/// An address allocated out of a prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct PrefixAddress {
    id: i64,
    ip_address: String,
    region: String,
    resource: String,
    assigned_at: String,
}

fn prefix_path(uuid: &str) -> String {
    format!("{}/{}", PREFIXES_PATH, uuid)
}

async fn get_prefix(ctx: &OpContext, client: &Client, uuid: &str) -> Result<Prefix, ProviderError> {
    let body = client.get(ctx, &prefix_path(uuid), &[]).await?;
    extract(&body, "byoip_prefix")
}

async fn set_advertised(
    ctx: &OpContext,
    client: &Client,
    uuid: &str,
    advertise: bool,
) -> Result<(), ProviderError> {
    debug!(uuid, advertise, "updating prefix advertisement");
    client
        .patch(ctx, &prefix_path(uuid), json!({"advertise": advertise}))
        .await
        .map(|_| ())
}

fn set_state(data: &mut ResourceData, prefix: &Prefix) {
    data.set_id(prefix.uuid.as_str());
    data.set("uuid", prefix.uuid.as_str());
    data.set("prefix", prefix.prefix.as_str());
    data.set("region", normalize_region(&prefix.region));
    data.set("status", prefix.status.as_str());
    data.set("advertised", prefix.advertised);
    set_optional_str(data, "failure_reason", &prefix.failure_reason);
}

/// `digitalocean_byoip_prefix`
#[derive(Debug, Clone, Copy, Default)]
pub struct ByoipPrefixResource;

#[async_trait]
impl Resource for ByoipPrefixResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("An IP prefix owned by the account and announced from DigitalOcean.")
            .with_attribute(
                "prefix",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::IsCidr),
            )
            .with_attribute(
                "signature",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute("region", Attribute::required_string().with_force_new())
            .with_attribute("advertised", Attribute::optional_computed_bool())
            .with_attribute("uuid", Attribute::computed_string())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("failure_reason", Attribute::computed_string())
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let client = &meta.client;
        let body = json!({
            "prefix": data.require_str("prefix")?,
            "signature": data.require_str("signature")?,
            "region": normalize_region(data.require_str("region")?),
        });
        // The create response is not enveloped.
        let response = client.post(ctx, PREFIXES_PATH, body).await?;
        let created: Prefix = serde_json::from_value(response)?;
        if created.uuid.is_empty() {
            return Err(ProviderError::Sdk("prefix created without a uuid".to_string()));
        }
        info!(uuid = %created.uuid, "BYOIP prefix created, waiting for validation");
        data.set_id(created.uuid.as_str());

        let uuid = created.uuid.as_str();
        let conf = StateChangeConf::new(&["pending", "verified"], &["active"])
            .with_timeout(self.timeouts().create);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_prefix(ctx, client, uuid).await, |p| p.status.clone())
        })
        .await?;

        if data.get_bool("advertised") == Some(true) {
            set_advertised(ctx, client, uuid, true).await?;
        }
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        match get_prefix(ctx, &meta.client, data.id()).await {
            Ok(prefix) => {
                set_state(data, &prefix);
                Ok(())
            },
            Err(err) => clear_if_not_found(err, "BYOIP prefix", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_change("advertised") {
            return Ok(());
        }
        let advertise = data.get_bool("advertised").unwrap_or(false);
        set_advertised(ctx, &meta.client, data.id(), advertise).await
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let uuid = data.id().to_string();
        let client = &meta.client;
        if let Err(err) = client.delete(ctx, &prefix_path(&uuid), &[]).await {
            return clear_if_not_found(err, "BYOIP prefix", data);
        }

        let uuid_ref = uuid.as_str();
        let conf = StateChangeConf::until_gone(&["active", "deleting", "pending", "verified"])
            .with_timeout(self.timeouts().delete);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_prefix(ctx, client, uuid_ref).await, |p| p.status.clone())
        })
        .await?;
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_byoip_prefix` data source.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByoipPrefixDataSource;

#[async_trait]
impl DataSource for ByoipPrefixDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "uuid",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute("prefix", Attribute::computed_string())
            .with_attribute("region", Attribute::computed_string())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("advertised", Attribute::computed_bool())
            .with_attribute("failure_reason", Attribute::computed_string())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let prefix = get_prefix(ctx, &meta.client, data.require_str("uuid")?).await?;
        set_state(data, &prefix);
        Ok(())
    }
}

/// `digitalocean_byoip_prefix_resources`: addresses handed out from a prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByoipPrefixResourcesDataSource;

#[async_trait]
impl DataSource for ByoipPrefixResourcesDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "byoip_prefix_uuid",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_block(
                "addresses",
                NestedBlock::list(
                    Block::new()
                        .with_attribute("id", Attribute::computed_int64())
                        .with_attribute("ip_address", Attribute::computed_string())
                        .with_attribute("region", Attribute::computed_string())
                        .with_attribute("resource", Attribute::computed_string())
                        .with_attribute("assigned_at", Attribute::computed_string()),
                )
                .computed(),
            )
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let uuid = data.require_str("byoip_prefix_uuid")?.to_string();
        let path = format!("{}/ips", prefix_path(&uuid));
        let request = ListRequest::new(&path, "ips").with_per_page(DEFAULT_PER_PAGE);
        let addresses =
            list_all(&meta.client, ctx, &request, |a: &PrefixAddress| a.id.to_string()).await?;
        data.set("addresses", flatten_blocks(&addresses)?);
        data.set_id(uuid);
        Ok(())
    }
}
