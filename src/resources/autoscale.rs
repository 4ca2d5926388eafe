//! Droplet autoscale pools.
//!
//! A pool is either static (`target_number_instances`) or dynamic
//! (`min_instances`/`max_instances` with utilization targets). The pool's
//! Droplets are created from `droplet_template`; deleting the pool destroys
//! them through the API's dangerous-delete endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::client::{extract, ApiRequest, Client, Method};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::lookup::{find_one, parse_timestamp, NameFilter, Named};
use crate::mapping::{expand_block, flatten_block, normalize_region};
use crate::pagination::{list_all, ListRequest, LOOKUP_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, DataSource, Resource, Timeouts};
use crate::schema::{
    Attribute, AttributeFlags, AttributeType, Block, Constraint, NestedBlock, Schema, Validator,
};
use crate::state::ResourceData;
use crate::waiter::{observe, wait_for_state, StateChangeConf};

const POOLS_PATH: &str = "/v2/droplets/autoscale";

/// Header the API requires before destroying a pool together with its Droplets.
const DANGEROUS_HEADER: &str = "X-Dangerous";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct PoolConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    min_instances: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_instances: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_cpu_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_memory_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cooldown_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_number_instances: Option<i64>,
}

impl PoolConfig {
    /// Reject a configuration that is neither purely static nor purely dynamic.
    fn check(&self) -> Result<(), ProviderError> {
        let dynamic = self.min_instances.is_some() || self.max_instances.is_some();
        match (self.target_number_instances, dynamic) {
            (Some(_), true) => Err(ProviderError::Validation(
                "`target_number_instances` cannot be combined with `min_instances`/`max_instances`"
                    .to_string(),
            )),
            (None, false) => Err(ProviderError::Validation(
                "either `target_number_instances` or `min_instances` and `max_instances` must be set"
                    .to_string(),
            )),
            (None, true) => match (self.min_instances, self.max_instances) {
                (Some(min), Some(max)) if min <= max => Ok(()),
                (Some(min), Some(max)) => Err(ProviderError::Validation(format!(
                    "`min_instances` ({}) must not exceed `max_instances` ({})",
                    min, max
                ))),
                _ => Err(ProviderError::Validation(
                    "`min_instances` and `max_instances` must be set together".to_string(),
                )),
            },
            (Some(_), false) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct DropletTemplate {
    size: String,
    region: String,
    image: String,
    tags: Vec<String>,
    ssh_keys: Vec<String>,
    vpc_uuid: String,
    with_droplet_agent: bool,
    project_id: String,
    ipv6: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    user_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Utilization {
    memory: f64,
    cpu: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Pool {
    id: String,
    name: String,
    config: PoolConfig,
    droplet_template: DropletTemplate,
    current_utilization: Option<Utilization>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl Named for Pool {
    fn name(&self) -> &str {
        &self.name
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(Some(&self.created_at))
    }
}

fn pool_path(id: &str) -> String {
    format!("{}/{}", POOLS_PATH, id)
}

async fn get_pool(ctx: &OpContext, client: &Client, id: &str) -> Result<Pool, ProviderError> {
    let body = client.get(ctx, &pool_path(id), &[]).await?;
    extract(&body, "autoscale_pool")
}

/// Request body shared by create and update.
fn pool_request(data: &ResourceData) -> Result<Value, ProviderError> {
    let config: PoolConfig = expand_block(data.get("config"))?.unwrap_or_default();
    config.check()?;
    let mut template: DropletTemplate = expand_block(data.get("droplet_template"))?
        .ok_or_else(|| ProviderError::Validation("`droplet_template` is required".to_string()))?;
    template.region = normalize_region(&template.region);
    Ok(json!({
        "name": data.require_str("name")?,
        "config": config,
        "droplet_template": template,
    }))
}

fn set_state(data: &mut ResourceData, pool: &Pool) -> Result<(), ProviderError> {
    let mut config = pool.config.clone();
    // Dynamic pools report a zero fixed size.
    config.target_number_instances = config.target_number_instances.filter(|n| *n > 0);
    let mut template = pool.droplet_template.clone();
    template.region = normalize_region(&template.region);
    // The API never echoes user data back.
    if template.user_data.is_empty() {
        if let Some(user_data) = data.get_str("droplet_template.0.user_data") {
            template.user_data = user_data.to_string();
        }
    }

    data.set_id(pool.id.as_str());
    data.set("name", pool.name.as_str());
    data.set("config", flatten_block(&config)?);
    data.set("droplet_template", flatten_block(&template)?);
    match &pool.current_utilization {
        Some(utilization) => data.set("current_utilization", flatten_block(utilization)?),
        None => {
            data.remove("current_utilization");
        },
    }
    data.set("status", pool.status.as_str());
    data.set("created_at", pool.created_at.as_str());
    data.set("updated_at", pool.updated_at.as_str());
    Ok(())
}

fn config_block(flags: AttributeFlags) -> Block {
    let int = || Attribute::new(AttributeType::Int64, flags);
    let float = || Attribute::new(AttributeType::Float64, flags);
    Block::new()
        .with_attribute("min_instances", int().with_validator(Validator::int_between(0, 1000)))
        .with_attribute("max_instances", int().with_validator(Validator::int_between(1, 1000)))
        .with_attribute(
            "target_cpu_utilization",
            float().with_validator(Validator::float_between(0.05, 1.0)),
        )
        .with_attribute(
            "target_memory_utilization",
            float().with_validator(Validator::float_between(0.05, 1.0)),
        )
        .with_attribute("cooldown_minutes", int().with_validator(Validator::int_between(0, 1440)))
        .with_attribute(
            "target_number_instances",
            int().with_validator(Validator::int_between(1, 1000)),
        )
}

fn template_block() -> Block {
    Block::new()
        .with_attribute("size", Attribute::required_string())
        .with_attribute("region", Attribute::required_string())
        .with_attribute("image", Attribute::required_string())
        .with_attribute(
            "ssh_keys",
            Attribute::string_set(AttributeFlags::required()),
        )
        .with_attribute("tags", Attribute::string_set(AttributeFlags::optional_computed()))
        .with_attribute("vpc_uuid", Attribute::optional_computed_string())
        .with_attribute("with_droplet_agent", Attribute::optional_computed_bool())
        .with_attribute("project_id", Attribute::optional_computed_string())
        .with_attribute("ipv6", Attribute::optional_computed_bool())
        .with_attribute("user_data", Attribute::optional_string())
}

fn utilization_block() -> NestedBlock {
    NestedBlock::list(
        Block::new()
            .with_attribute("memory", Attribute::computed_float64())
            .with_attribute("cpu", Attribute::computed_float64()),
    )
    .computed()
}

/// `digitalocean_droplet_autoscale`
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoscaleResource;

#[async_trait]
impl Resource for AutoscaleResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A pool of Droplets scaled on utilization or to a fixed size.")
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
            .with_block(
                "config",
                NestedBlock::list(config_block(AttributeFlags::optional_computed()))
                    .with_min_items(1)
                    .with_max_items(1),
            )
            .with_block(
                "droplet_template",
                NestedBlock::list(template_block())
                    .with_min_items(1)
                    .with_max_items(1),
            )
            .with_block("current_utilization", utilization_block())
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::default()
            .with_create(Duration::from_secs(10 * 60))
            .with_update(Duration::from_secs(10 * 60))
            .with_delete(Duration::from_secs(10 * 60))
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let body = pool_request(data)?;
        let client = &meta.client;
        let response = client.post(ctx, POOLS_PATH, body).await?;
        let pool: Pool = extract(&response, "autoscale_pool")?;
        info!(id = %pool.id, "autoscale pool created, waiting for it to become active");
        data.set_id(pool.id.as_str());

        let id = pool.id.as_str();
        let conf = StateChangeConf::new(&["creating", "updating"], &["active"])
            .with_timeout(self.timeouts().create);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_pool(ctx, client, id).await, |p| p.status.clone())
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
        match get_pool(ctx, &meta.client, data.id()).await {
            Ok(pool) => set_state(data, &pool),
            Err(err) => clear_if_not_found(err, "autoscale pool", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_changes(&["name", "config", "droplet_template"]) {
            return Ok(());
        }
        let body = pool_request(data)?;
        let client = &meta.client;
        let id = data.id();
        client.put(ctx, &pool_path(id), body).await?;

        let conf = StateChangeConf::new(&["creating", "updating"], &["active"])
            .with_timeout(self.timeouts().update);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_pool(ctx, client, id).await, |p| p.status.clone())
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
        let id = data.id().to_string();
        let client = &meta.client;
        let request = ApiRequest::new(Method::Delete, format!("{}/dangerous", pool_path(&id)))
            .with_header(DANGEROUS_HEADER, "true");
        if let Err(err) = client.execute(ctx, request).await {
            return clear_if_not_found(err, "autoscale pool", data);
        }

        let id_ref = id.as_str();
        let conf = StateChangeConf::until_gone(&["active", "deleting", "error"])
            .with_timeout(self.timeouts().delete);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_pool(ctx, client, id_ref).await, |p| p.status.clone())
        })
        .await?;
        info!(id = %id, "autoscale pool deleted");
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_droplet_autoscale` data source: by id or name.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoscaleDataSource;

#[async_trait]
impl DataSource for AutoscaleDataSource {
    fn schema(&self) -> Schema {
        let template = Block::new()
            .with_attribute("size", Attribute::computed_string())
            .with_attribute("region", Attribute::computed_string())
            .with_attribute("image", Attribute::computed_string())
            .with_attribute("ssh_keys", Attribute::string_set(AttributeFlags::computed()))
            .with_attribute("tags", Attribute::string_set(AttributeFlags::computed()))
            .with_attribute("vpc_uuid", Attribute::computed_string())
            .with_attribute("with_droplet_agent", Attribute::computed_bool())
            .with_attribute("project_id", Attribute::computed_string())
            .with_attribute("ipv6", Attribute::computed_bool())
            .with_attribute("user_data", Attribute::computed_string());
        Schema::v0()
            .with_attribute("id", Attribute::optional_computed_string())
            .with_attribute("name", Attribute::optional_computed_string())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
            .with_block(
                "config",
                NestedBlock::list(config_block(AttributeFlags::computed())).computed(),
            )
            .with_block("droplet_template", NestedBlock::list(template).computed())
            .with_block("current_utilization", utilization_block())
            .with_constraint(Constraint::exactly_one_of(["id", "name"]))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let pool = match data.get_str("id").filter(|s| !s.is_empty()) {
            Some(id) => get_pool(ctx, &meta.client, id).await?,
            None => {
                let filter = NameFilter::Exact(data.require_str("name")?.to_string());
                let request =
                    ListRequest::new(POOLS_PATH, "autoscale_pools").with_per_page(LOOKUP_PER_PAGE);
                let pools = list_all(&meta.client, ctx, &request, |p: &Pool| p.id.clone()).await?;
                find_one(pools, "autoscale pool", &filter, false)?
            },
        };
        set_state(data, &pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_plan_no_changes, not_found_body, MockTransport, ProviderTester};
    use crate::DigitalOceanProvider;

    const POOL: &str = "/v2/droplets/autoscale/pool-1";

    fn pool(status: &str, max: i64) -> Value {
        json!({"autoscale_pool": {
            "id": "pool-1",
            "name": "web",
            "status": status,
            "config": {
                "min_instances": 1,
                "max_instances": max,
                "target_cpu_utilization": 0.6,
                "cooldown_minutes": 5
            },
            "droplet_template": {
                "size": "s-1vcpu-1gb",
                "region": "NYC3",
                "image": "ubuntu-24-04-x64",
                "ssh_keys": ["1234"],
                "tags": ["web"],
                "vpc_uuid": "vpc-1",
                "with_droplet_agent": true,
                "project_id": "proj-1",
                "ipv6": false
            },
            "current_utilization": {"memory": 0.25, "cpu": 0.5},
            "created_at": "2024-05-01T12:00:00Z",
            "updated_at": "2024-05-01T12:00:00Z"
        }})
    }

    fn config() -> Value {
        json!({
            "name": "web",
            "config": [{
                "min_instances": 1,
                "max_instances": 3,
                "target_cpu_utilization": 0.6,
                "cooldown_minutes": 5
            }],
            "droplet_template": [{
                "size": "s-1vcpu-1gb",
                "region": "nyc3",
                "image": "ubuntu-24-04-x64",
                "ssh_keys": ["1234"],
                "tags": ["web"],
                "user_data": "#cloud-config"
            }]
        })
    }

    async fn configured(mock: &MockTransport) -> ProviderTester<DigitalOceanProvider> {
        let tester = ProviderTester::new(mock.provider().unwrap());
        tester
            .configure(json!({"token": MockTransport::TOKEN}))
            .await
            .unwrap();
        tester
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_for_active() {
        let mock = MockTransport::new()
            .on(Method::Post, POOLS_PATH, 202, pool("creating", 3))
            .on(Method::Get, POOL, 200, pool("creating", 3))
            .on(Method::Get, POOL, 200, pool("active", 3));
        let tester = configured(&mock).await;

        let state = tester.create("digitalocean_droplet_autoscale", config()).await.unwrap();
        assert_eq!(state["status"], "active");
        assert_eq!(state["config"][0]["max_instances"], 3);
        assert_eq!(state["droplet_template"][0]["region"], "nyc3");
        assert_eq!(state["droplet_template"][0]["user_data"], "#cloud-config");
        assert_eq!(state["current_utilization"][0]["cpu"], 0.5);

        let body = mock.requests_to(Method::Post, POOLS_PATH)[0].json().cloned().unwrap();
        assert_eq!(body["config"]["min_instances"], 1);
        assert!(body["config"].get("target_number_instances").is_none());

        let mut planned = config();
        planned["id"] = state["id"].clone();
        let plan = tester
            .plan_update("digitalocean_droplet_autoscale", state, planned)
            .await
            .unwrap();
        assert_plan_no_changes(&plan);
    }

    #[tokio::test]
    async fn test_mixed_static_and_dynamic_config_is_rejected() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let mut config = config();
        config["config"][0]["target_number_instances"] = json!(2);

        let err = tester
            .create("digitalocean_droplet_autoscale", config)
            .await
            .unwrap_err();
        assert!(err.message().contains("target_number_instances"));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_puts_whole_pool_and_waits_for_active() {
        let mock = MockTransport::new()
            .on(Method::Put, POOL, 200, pool("updating", 5))
            .on(Method::Get, POOL, 200, pool("active", 3))
            .on(Method::Get, POOL, 200, pool("updating", 5))
            .on(Method::Get, POOL, 200, pool("active", 5));
        let tester = configured(&mock).await;
        let prior = tester
            .read("digitalocean_droplet_autoscale", json!({"id": "pool-1"}))
            .await
            .unwrap();
        let mut planned = prior.clone();
        planned["config"][0]["max_instances"] = json!(5);

        let state = tester
            .update("digitalocean_droplet_autoscale", prior, planned)
            .await
            .unwrap();
        assert_eq!(state["config"][0]["max_instances"], 5);
        assert_eq!(state["status"], "active");
        // Initial read, two waiter polls, then the refresh.
        assert_eq!(mock.count(Method::Get, POOL), 4);
        let body = mock.requests_to(Method::Put, POOL)[0].json().cloned().unwrap();
        assert_eq!(body["config"]["max_instances"], 5);
        assert_eq!(body["droplet_template"]["image"], "ubuntu-24-04-x64");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_sends_dangerous_header() {
        let dangerous = "/v2/droplets/autoscale/pool-1/dangerous";
        let mock = MockTransport::new()
            .on(Method::Delete, dangerous, 202, Value::Null)
            .on(Method::Get, POOL, 200, pool("deleting", 3))
            .on(Method::Get, POOL, 404, not_found_body());
        let tester = configured(&mock).await;

        tester
            .delete("digitalocean_droplet_autoscale", json!({"id": "pool-1"}))
            .await
            .unwrap();
        let request = &mock.requests_to(Method::Delete, dangerous)[0];
        assert_eq!(request.header(DANGEROUS_HEADER), Some("true"));
    }

    #[tokio::test]
    async fn test_data_source_by_name() {
        let listed = pool("active", 3)["autoscale_pool"].clone();
        let mock = MockTransport::new().on(
            Method::Get,
            POOLS_PATH,
            200,
            json!({"autoscale_pools": [listed]}),
        );
        let tester = configured(&mock).await;

        let state = tester
            .read_data_source("digitalocean_droplet_autoscale", json!({"name": "web"}))
            .await
            .unwrap();
        assert_eq!(state["id"], "pool-1");
        assert_eq!(state["droplet_template"][0]["tags"], json!(["web"]));
    }

    #[test]
    fn test_config_shapes() {
        let fixed = PoolConfig {
            target_number_instances: Some(2),
            ..Default::default()
        };
        assert!(fixed.check().is_ok());
        let inverted = PoolConfig {
            min_instances: Some(4),
            max_instances: Some(2),
            ..Default::default()
        };
        assert!(inverted.check().is_err());
        assert!(PoolConfig::default().check().is_err());
    }
}
