//! VPC NAT gateways.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::lookup::{find_one, parse_timestamp, NameFilter, Named};
use crate::mapping::{expand_blocks, flatten_block, flatten_blocks, normalize_region};
use crate::pagination::{list_all, ListRequest, LOOKUP_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, DataSource, Resource, Timeouts};
use crate::schema::{Attribute, Block, Constraint, NestedBlock, Schema, Validator};
use crate::state::ResourceData;
use crate::waiter::{observe, wait_for_state, StateChangeConf};

const GATEWAYS_PATH: &str = "/v2/vpc_nat_gateways";

const TIMEOUT_ATTRIBUTES: [&str; 3] = [
    "udp_timeout_seconds",
    "icmp_timeout_seconds",
    "tcp_timeout_seconds",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct GatewayVpc {
    vpc_uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    gateway_ip: String,
    default_gateway: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct PublicGateway {
    ipv4: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Egresses {
    public_gateways: Vec<PublicGateway>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct NatGateway {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    state: String,
    region: String,
    size: i64,
    vpcs: Vec<GatewayVpc>,
    egresses: Egresses,
    udp_timeout_seconds: i64,
    icmp_timeout_seconds: i64,
    tcp_timeout_seconds: i64,
    project_id: String,
    created_at: String,
    updated_at: String,
}

impl Named for NatGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        parse_timestamp(Some(&self.created_at))
    }
}

fn gateway_path(id: &str) -> String {
    format!("{}/{}", GATEWAYS_PATH, id)
}

async fn get_gateway(ctx: &OpContext, client: &Client, id: &str) -> Result<NatGateway, ProviderError> {
    let body = client.get(ctx, &gateway_path(id), &[]).await?;
    extract(&body, "vpc_nat_gateway")
}

fn set_state(data: &mut ResourceData, gateway: &NatGateway) -> Result<(), ProviderError> {
    data.set_id(gateway.id.as_str());
    data.set("name", gateway.name.as_str());
    data.set("type", gateway.kind.as_str());
    data.set("region", normalize_region(&gateway.region));
    data.set("size", gateway.size);
    data.set("state", gateway.state.as_str());
    data.set("vpcs", flatten_blocks(&gateway.vpcs)?);
    data.set("egresses", flatten_block(&gateway.egresses)?);
    data.set("udp_timeout_seconds", gateway.udp_timeout_seconds);
    data.set("icmp_timeout_seconds", gateway.icmp_timeout_seconds);
    data.set("tcp_timeout_seconds", gateway.tcp_timeout_seconds);
    data.set("project_id", gateway.project_id.as_str());
    data.set("created_at", gateway.created_at.as_str());
    data.set("updated_at", gateway.updated_at.as_str());
    Ok(())
}

fn egresses_block() -> NestedBlock {
    NestedBlock::list(Block::new().with_block(
        "public_gateways",
        NestedBlock::list(Block::new().with_attribute("ipv4", Attribute::computed_string())),
    ))
}

/// Mutable settings shared by create and update bodies.
fn settings(data: &ResourceData) -> Result<Map<String, Value>, ProviderError> {
    let mut body = Map::new();
    body.insert("name".to_string(), json!(data.require_str("name")?));
    body.insert("size".to_string(), json!(data.get_i64("size").unwrap_or(1)));
    for key in TIMEOUT_ATTRIBUTES {
        if let Some(seconds) = data.get_i64(key) {
            body.insert(key.to_string(), json!(seconds));
        }
    }
    Ok(body)
}

/// `digitalocean_vpc_nat_gateway`
#[derive(Debug, Clone, Copy, Default)]
pub struct NatGatewayResource;

#[async_trait]
impl Resource for NatGatewayResource {
    fn schema(&self) -> Schema {
        let timeout = || {
            Attribute::optional_computed_int64().with_validator(Validator::int_between(1, 3600))
        };
        Schema::v0()
            .with_description("A NAT gateway giving a VPC's resources outbound connectivity.")
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "type",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::string_in_ignore_case(["PUBLIC"])),
            )
            .with_attribute("region", Attribute::required_string().with_force_new())
            .with_attribute(
                "size",
                Attribute::optional_int64()
                    .with_default(json!(1))
                    .with_validator(Validator::int_between(1, 64)),
            )
            .with_attribute("udp_timeout_seconds", timeout())
            .with_attribute("icmp_timeout_seconds", timeout())
            .with_attribute("tcp_timeout_seconds", timeout())
            .with_attribute("project_id", Attribute::optional_computed_string().with_force_new())
            .with_attribute("state", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
            .with_block(
                "vpcs",
                NestedBlock::list(
                    Block::new()
                        .with_attribute("vpc_uuid", Attribute::required_string())
                        .with_attribute("gateway_ip", Attribute::computed_string())
                        .with_attribute("default_gateway", Attribute::optional_computed_bool()),
                )
                .with_min_items(1)
                .with_max_items(1)
                .with_force_new(),
            )
            .with_block("egresses", egresses_block().computed())
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::default()
            .with_create(Duration::from_secs(15 * 60))
            .with_update(Duration::from_secs(15 * 60))
            .with_delete(Duration::from_secs(2 * 60))
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let mut body = settings(data)?;
        body.insert("type".to_string(), json!(data.require_str("type")?.to_uppercase()));
        body.insert("region".to_string(), json!(normalize_region(data.require_str("region")?)));
        let vpcs: Vec<Value> = expand_blocks::<GatewayVpc>(data.get("vpcs"))?
            .into_iter()
            .map(|v| json!({"vpc_uuid": v.vpc_uuid, "default_gateway": v.default_gateway}))
            .collect();
        body.insert("vpcs".to_string(), Value::Array(vpcs));
        if let Some(project_id) = data.get_str("project_id").filter(|s| !s.is_empty()) {
            body.insert("project_id".to_string(), json!(project_id));
        }

        let client = &meta.client;
        let response = client.post(ctx, GATEWAYS_PATH, Value::Object(body)).await?;
        let gateway: NatGateway = extract(&response, "vpc_nat_gateway")?;
        info!(id = %gateway.id, "NAT gateway created, waiting for it to become active");
        data.set_id(gateway.id.as_str());

        let id = gateway.id.as_str();
        let conf = StateChangeConf::new(&["NEW", "UPDATING"], &["ACTIVE"])
            .with_timeout(self.timeouts().create);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_gateway(ctx, client, id).await, |g| g.state.clone())
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
        match get_gateway(ctx, &meta.client, data.id()).await {
            Ok(gateway) => set_state(data, &gateway),
            Err(err) => clear_if_not_found(err, "NAT gateway", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let mut changed = vec!["name", "size"];
        changed.extend(TIMEOUT_ATTRIBUTES);
        if !data.has_changes(&changed) {
            return Ok(());
        }
        let body = settings(data)?;
        let client = &meta.client;
        let id = data.id();
        client.put(ctx, &gateway_path(id), Value::Object(body)).await?;

        let conf = StateChangeConf::new(&["NEW", "UPDATING"], &["ACTIVE"])
            .with_timeout(self.timeouts().update);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_gateway(ctx, client, id).await, |g| g.state.clone())
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
        if let Err(err) = client.delete(ctx, &gateway_path(&id), &[]).await {
            return clear_if_not_found(err, "NAT gateway", data);
        }

        let id_ref = id.as_str();
        let conf = StateChangeConf::until_gone(&["ACTIVE", "DELETING"])
            .with_timeout(self.timeouts().delete);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_gateway(ctx, client, id_ref).await, |g| g.state.clone())
        })
        .await?;
        info!(id = %id, "NAT gateway deleted");
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_vpc_nat_gateway` data source: by id or name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatGatewayDataSource;

#[async_trait]
impl DataSource for NatGatewayDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::optional_computed_string())
            .with_attribute("name", Attribute::optional_computed_string())
            .with_attribute("type", Attribute::computed_string())
            .with_attribute("region", Attribute::computed_string())
            .with_attribute("size", Attribute::computed_int64())
            .with_attribute("state", Attribute::computed_string())
            .with_attribute("udp_timeout_seconds", Attribute::computed_int64())
            .with_attribute("icmp_timeout_seconds", Attribute::computed_int64())
            .with_attribute("tcp_timeout_seconds", Attribute::computed_int64())
            .with_attribute("project_id", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
            .with_block(
                "vpcs",
                NestedBlock::list(
                    Block::new()
                        .with_attribute("vpc_uuid", Attribute::computed_string())
                        .with_attribute("gateway_ip", Attribute::computed_string())
                        .with_attribute("default_gateway", Attribute::computed_bool()),
                )
                .computed(),
            )
            .with_block("egresses", egresses_block().computed())
            .with_constraint(Constraint::exactly_one_of(["id", "name"]))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let gateway = match data.get_str("id").filter(|s| !s.is_empty()) {
            Some(id) => get_gateway(ctx, &meta.client, id).await?,
            None => {
                let filter = NameFilter::Exact(data.require_str("name")?.to_string());
                let request = ListRequest::new(GATEWAYS_PATH, "vpc_nat_gateways")
                    .with_per_page(LOOKUP_PER_PAGE);
                let gateways = list_all(&meta.client, ctx, &request, |g: &NatGateway| g.id.clone()).await?;
                find_one(gateways, "VPC NAT gateway", &filter, false)?
            },
        };
        set_state(data, &gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Method;
    use crate::testing::{
        assert_plan_no_changes, assert_plan_replaces, not_found_body, MockTransport, ProviderTester,
    };
    use crate::DigitalOceanProvider;

    fn gateway(state: &str, with_egress: bool) -> Value {
        let egresses = if with_egress {
            json!({"public_gateways": [{"ipv4": "174.138.113.197"}]})
        } else {
            json!({})
        };
        json!({"vpc_nat_gateway": {
            "id": "gw-1",
            "name": "tf-xyz",
            "type": "PUBLIC",
            "state": state,
            "region": "nyc3",
            "size": 1,
            "vpcs": [{"vpc_uuid": "vpc-1", "gateway_ip": "10.118.0.35", "default_gateway": false}],
            "egresses": egresses,
            "udp_timeout_seconds": 30,
            "icmp_timeout_seconds": 30,
            "tcp_timeout_seconds": 30,
            "project_id": "proj-1",
            "created_at": "2024-05-01T12:00:00Z",
            "updated_at": "2024-05-01T12:00:00Z"
        }})
    }

    async fn configured(mock: &MockTransport) -> ProviderTester<DigitalOceanProvider> {
        let tester = ProviderTester::new(mock.provider().unwrap());
        tester
            .configure(json!({"token": MockTransport::TOKEN}))
            .await
            .unwrap();
        tester
    }

    fn config() -> Value {
        json!({
            "name": "tf-xyz",
            "type": "PUBLIC",
            "region": "nyc3",
            "size": 1,
            "vpcs": [{"vpc_uuid": "vpc-1"}]
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_for_active_and_reads_egress() {
        let mock = MockTransport::new()
            .on(Method::Post, GATEWAYS_PATH, 202, gateway("NEW", false))
            .on(Method::Get, "/v2/vpc_nat_gateways/gw-1", 200, gateway("NEW", false))
            .on(Method::Get, "/v2/vpc_nat_gateways/gw-1", 200, gateway("ACTIVE", true));
        let tester = configured(&mock).await;

        let state = tester
            .create("digitalocean_vpc_nat_gateway", config())
            .await
            .unwrap();
        assert_eq!(state["state"], "ACTIVE");
        assert_eq!(state["egresses"][0]["public_gateways"][0]["ipv4"], "174.138.113.197");
        assert_eq!(state["vpcs"][0]["gateway_ip"], "10.118.0.35");

        let body = mock.requests_to(Method::Post, GATEWAYS_PATH)[0].json().cloned().unwrap();
        assert_eq!(body["vpcs"], json!([{"vpc_uuid": "vpc-1", "default_gateway": false}]));
        assert!(body.get("udp_timeout_seconds").is_none());

        let mut planned = config();
        planned["id"] = state["id"].clone();
        let plan = tester
            .plan_update("digitalocean_vpc_nat_gateway", state.clone(), planned)
            .await
            .unwrap();
        assert_plan_no_changes(&plan);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_waits_until_active_again() {
        let mock = MockTransport::new()
            .on(Method::Put, "/v2/vpc_nat_gateways/gw-1", 202, gateway("UPDATING", true))
            .on(Method::Get, "/v2/vpc_nat_gateways/gw-1", 200, gateway("UPDATING", true))
            .on(Method::Get, "/v2/vpc_nat_gateways/gw-1", 200, gateway("ACTIVE", true));
        let tester = configured(&mock).await;
        let mut prior = config();
        prior["id"] = json!("gw-1");
        prior["state"] = json!("ACTIVE");
        let mut planned = prior.clone();
        planned["size"] = json!(2);

        let state = tester
            .update("digitalocean_vpc_nat_gateway", prior, planned)
            .await
            .unwrap();
        assert_eq!(state["state"], "ACTIVE");
        assert_eq!(mock.count(Method::Put, "/v2/vpc_nat_gateways/gw-1"), 1);
        // Two waiter polls, then the refresh.
        assert_eq!(mock.count(Method::Get, "/v2/vpc_nat_gateways/gw-1"), 3);
        let body = mock.requests_to(Method::Put, "/v2/vpc_nat_gateways/gw-1")[0].json().cloned().unwrap();
        assert_eq!(body["size"], 2);
    }

    #[tokio::test]
    async fn test_moving_to_another_vpc_replaces() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let prior = gateway("ACTIVE", true)["vpc_nat_gateway"].clone();
        let mut planned = config();
        planned["vpcs"] = json!([{"vpc_uuid": "vpc-2"}]);

        let plan = tester
            .plan_update("digitalocean_vpc_nat_gateway", prior, planned)
            .await
            .unwrap();
        assert_plan_replaces(&plan);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_waits_for_disappearance() {
        let mock = MockTransport::new()
            .on(Method::Delete, "/v2/vpc_nat_gateways/gw-1", 202, Value::Null)
            .on(Method::Get, "/v2/vpc_nat_gateways/gw-1", 200, gateway("DELETING", true))
            .on(Method::Get, "/v2/vpc_nat_gateways/gw-1", 404, not_found_body());
        let tester = configured(&mock).await;

        tester
            .delete("digitalocean_vpc_nat_gateway", json!({"id": "gw-1", "name": "tf-xyz"}))
            .await
            .unwrap();
        assert_eq!(mock.count(Method::Get, "/v2/vpc_nat_gateways/gw-1"), 2);
    }

    #[tokio::test]
    async fn test_data_source_by_name() {
        let list = json!({"vpc_nat_gateways": [gateway("ACTIVE", true)["vpc_nat_gateway"].clone()]});
        let mock = MockTransport::new().on(Method::Get, GATEWAYS_PATH, 200, list);
        let tester = configured(&mock).await;

        let state = tester
            .read_data_source("digitalocean_vpc_nat_gateway", json!({"name": "tf-xyz"}))
            .await
            .unwrap();
        assert_eq!(state["id"], "gw-1");
        assert_eq!(state["vpcs"][0]["vpc_uuid"], "vpc-1");
    }
}
