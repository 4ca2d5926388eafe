//! The account's container registry.
//!
//! An account owns at most one registry, so the registry's name doubles as
//! its identifier and every endpoint is a singleton.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::mapping::normalize_region;
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, DataSource, Resource};
use crate::schema::{Attribute, Schema, Validator};
use crate::state::ResourceData;

pub(crate) const REGISTRY_PATH: &str = "/v2/registry";
const SUBSCRIPTION_PATH: &str = "/v2/registry/subscription";

/// Host serving every DigitalOcean registry.
pub const REGISTRY_SERVER: &str = "registry.digitalocean.com";

const TIERS: [&str; 3] = ["starter", "basic", "professional"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Registry {
    pub name: String,
    pub region: String,
    pub storage_usage_bytes: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Tier {
    slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Subscription {
    tier: Tier,
}

pub(crate) async fn get_registry(ctx: &OpContext, client: &Client) -> Result<Registry, ProviderError> {
    let body = client.get(ctx, REGISTRY_PATH, &[]).await?;
    extract(&body, "registry")
}

async fn get_tier(ctx: &OpContext, client: &Client) -> Result<String, ProviderError> {
    let body = client.get(ctx, SUBSCRIPTION_PATH, &[]).await?;
    let subscription: Subscription = extract(&body, "subscription")?;
    Ok(subscription.tier.slug)
}

fn set_state(data: &mut ResourceData, registry: &Registry, tier: &str) {
    data.set_id(registry.name.as_str());
    data.set("name", registry.name.as_str());
    data.set("region", normalize_region(&registry.region));
    data.set("subscription_tier_slug", tier);
    data.set("endpoint", format!("{}/{}", REGISTRY_SERVER, registry.name));
    data.set("server_url", REGISTRY_SERVER);
    data.set("storage_usage_bytes", registry.storage_usage_bytes);
    data.set("created_at", registry.created_at.as_str());
}

/// `digitalocean_container_registry`
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerRegistryResource;

#[async_trait]
impl Resource for ContainerRegistryResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("The account's container registry.")
            .with_attribute(
                "name",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::string_len_between(1, 63)),
            )
            .with_attribute(
                "subscription_tier_slug",
                Attribute::required_string().with_validator(Validator::string_in(TIERS)),
            )
            .with_attribute("region", Attribute::optional_computed_string().with_force_new())
            .with_attribute("endpoint", Attribute::computed_string())
            .with_attribute("server_url", Attribute::computed_string())
            .with_attribute("storage_usage_bytes", Attribute::computed_int64())
            .with_attribute("created_at", Attribute::computed_string())
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let name = data.require_str("name")?.to_string();
        let mut body = json!({
            "name": name,
            "subscription_tier_slug": data.require_str("subscription_tier_slug")?,
        });
        if let Some(region) = data.get_str("region").filter(|r| !r.is_empty()) {
            body["region"] = json!(normalize_region(region));
        }
        meta.client.post(ctx, REGISTRY_PATH, body).await?;
        info!(name = %name, "container registry created");
        data.set_id(name);
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let registry = match get_registry(ctx, &meta.client).await {
            Ok(registry) => registry,
            Err(err) => return clear_if_not_found(err, "container registry", data),
        };
        if registry.name != data.id() {
            debug!(id = data.id(), found = %registry.name, "account registry was replaced");
            data.clear_id();
            return Ok(());
        }
        let tier = get_tier(ctx, &meta.client).await?;
        set_state(data, &registry, &tier);
        Ok(())
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_change("subscription_tier_slug") {
            return Ok(());
        }
        let tier = data.require_str("subscription_tier_slug")?;
        info!(tier, "changing registry subscription tier");
        meta.client
            .post(ctx, SUBSCRIPTION_PATH, json!({"tier_slug": tier}))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if let Err(err) = meta.client.delete(ctx, REGISTRY_PATH, &[]).await {
            return clear_if_not_found(err, "container registry", data);
        }
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_container_registry` data source.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerRegistryDataSource;

#[async_trait]
impl DataSource for ContainerRegistryDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute("subscription_tier_slug", Attribute::computed_string())
            .with_attribute("region", Attribute::computed_string())
            .with_attribute("endpoint", Attribute::computed_string())
            .with_attribute("server_url", Attribute::computed_string())
            .with_attribute("storage_usage_bytes", Attribute::computed_int64())
            .with_attribute("created_at", Attribute::computed_string())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let name = data.require_str("name")?.to_string();
        let registry = get_registry(ctx, &meta.client).await?;
        if registry.name != name {
            return Err(ProviderError::NotFound(format!(
                "no container registry found with name {}",
                name
            )));
        }
        let tier = get_tier(ctx, &meta.client).await?;
        set_state(data, &registry, &tier);
        Ok(())
    }
}
