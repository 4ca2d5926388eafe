//! VPC networks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::client::extract;
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::lookup::{find_one, parse_timestamp, NameFilter, Named};
use crate::mapping::normalize_region;
use crate::pagination::{list_all, ListRequest, LOOKUP_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, DataSource, Resource, Timeouts};
use crate::resources::set_optional_str;
use crate::retry::{classify_delete, retry, Backoff};
use crate::schema::{Attribute, Constraint, Schema, Validator};
use crate::state::ResourceData;

const VPCS_PATH: &str = "/v2/vpcs";

/// A VPC as the API returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Vpc {
    pub id: String,
    pub urn: String,
    pub name: String,
    pub description: String,
    pub region: String,
    pub ip_range: String,
    pub default: bool,
    pub created_at: String,
}

impl Named for Vpc {
    fn name(&self) -> &str {
        &self.name
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(Some(&self.created_at))
    }
}

fn vpc_path(id: &str) -> String {
    format!("{}/{}", VPCS_PATH, id)
}

async fn get_vpc(ctx: &OpContext, meta: &ProviderMeta, id: &str) -> Result<Vpc, ProviderError> {
    let body = meta.client.get(ctx, &vpc_path(id), &[]).await?;
    extract(&body, "vpc")
}

async fn list_vpcs(ctx: &OpContext, meta: &ProviderMeta) -> Result<Vec<Vpc>, ProviderError> {
    let request = ListRequest::new(VPCS_PATH, "vpcs").with_per_page(LOOKUP_PER_PAGE);
    list_all(&meta.client, ctx, &request, |v: &Vpc| v.id.clone()).await
}

fn set_state(data: &mut ResourceData, vpc: &Vpc) {
    data.set_id(vpc.id.as_str());
    data.set("name", vpc.name.as_str());
    data.set("region", normalize_region(&vpc.region));
    set_optional_str(data, "description", &vpc.description);
    set_optional_str(data, "ip_range", &vpc.ip_range);
    data.set("urn", vpc.urn.as_str());
    data.set("default", vpc.default);
    data.set("created_at", vpc.created_at.as_str());
}

/// `digitalocean_vpc`
#[derive(Debug, Clone, Copy, Default)]
pub struct VpcResource;

#[async_trait]
impl Resource for VpcResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A VPC network.")
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "region",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "description",
                Attribute::optional_string().with_validator(Validator::string_len_between(0, 255)),
            )
            .with_attribute(
                "ip_range",
                Attribute::optional_computed_string()
                    .with_force_new()
                    .with_validator(Validator::IsCidr),
            )
            .with_attribute("urn", Attribute::computed_string())
            .with_attribute("default", Attribute::computed_bool())
            .with_attribute("created_at", Attribute::computed_string())
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::default().with_delete(Duration::from_secs(2 * 60))
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let mut body = json!({
            "name": data.require_str("name")?,
            "region": normalize_region(data.require_str("region")?),
        });
        if let Some(description) = data.get_str("description") {
            body["description"] = json!(description);
        }
        if let Some(ip_range) = data.get_str("ip_range") {
            body["ip_range"] = json!(ip_range);
        }

        let response = meta.client.post(ctx, VPCS_PATH, body).await?;
        let vpc: Vpc = extract(&response, "vpc")?;
        info!(id = %vpc.id, "VPC created");
        data.set_id(vpc.id);
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        match get_vpc(ctx, meta, data.id()).await {
            Ok(vpc) => {
                set_state(data, &vpc);
                Ok(())
            },
            Err(err) => clear_if_not_found(err, "VPC", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_changes(&["name", "description"]) {
            return Ok(());
        }
        let body = json!({
            "name": data.require_str("name")?,
            "description": data.get_string("description"),
        });
        meta.client.patch(ctx, &vpc_path(data.id()), body).await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let path = vpc_path(data.id());
        let client = &meta.client;
        // Members (droplets, load balancers) may still be draining out of the VPC.
        let result = retry(ctx, self.timeouts().delete, Backoff::default(), || {
            let path = path.as_str();
            async move { client.delete(ctx, path, &[]).await.map_err(classify_delete) }
        })
        .await;
        match result {
            Ok(()) => {
                data.clear_id();
                Ok(())
            },
            Err(err) if err.is_not_found() => {
                data.clear_id();
                Ok(())
            },
            Err(err) => Err(err),
        }
    }
}

/// `digitalocean_vpc` data source: by id, by name, or the region's default VPC.
#[derive(Debug, Clone, Copy, Default)]
pub struct VpcDataSource;

#[async_trait]
impl DataSource for VpcDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::optional_computed_string())
            .with_attribute("name", Attribute::optional_computed_string())
            .with_attribute("region", Attribute::optional_computed_string())
            .with_attribute("description", Attribute::computed_string())
            .with_attribute("ip_range", Attribute::computed_string())
            .with_attribute("urn", Attribute::computed_string())
            .with_attribute("default", Attribute::computed_bool())
            .with_attribute("created_at", Attribute::computed_string())
            .with_constraint(Constraint::exactly_one_of(["id", "name", "region"]))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let vpc = if let Some(id) = data.get_str("id").filter(|s| !s.is_empty()) {
            get_vpc(ctx, meta, id).await?
        } else if let Some(name) = data.get_str("name") {
            let filter = NameFilter::Exact(name.to_string());
            find_one(list_vpcs(ctx, meta).await?, "VPC", &filter, false)?
        } else {
            let region = normalize_region(data.require_str("region")?);
            list_vpcs(ctx, meta)
                .await?
                .into_iter()
                .find(|v| v.default && normalize_region(&v.region) == region)
                .ok_or_else(|| {
                    ProviderError::NotFound(format!("unable to find default VPC in {}", region))
                })?
        };

        set_state(data, &vpc);
        data.set("description", vpc.description.as_str());
        data.set("ip_range", vpc.ip_range.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Method;
    use crate::testing::{assert_plan_updates_in_place, MockTransport, ProviderTester};
    use crate::DigitalOceanProvider;
    use crate::ProviderService;
    use serde_json::Value;

    fn vpc(id: &str, name: &str, region: &str, default: bool) -> Value {
        json!({
            "id": id,
            "urn": format!("do:vpc:{}", id),
            "name": name,
            "region": region,
            "description": "",
            "ip_range": "10.10.10.0/24",
            "default": default,
            "created_at": "2024-01-01T00:00:00Z"
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

    #[tokio::test]
    async fn test_create_sends_normalized_region() {
        let mock = MockTransport::new()
            .on(Method::Post, VPCS_PATH, 201, json!({"vpc": vpc("vpc-1", "net", "nyc3", false)}))
            .on(Method::Get, "/v2/vpcs/vpc-1", 200, json!({"vpc": vpc("vpc-1", "net", "nyc3", false)}));
        let tester = configured(&mock).await;

        let state = tester
            .create("digitalocean_vpc", json!({"name": "net", "region": "NYC3"}))
            .await
            .unwrap();
        assert_eq!(state["id"], "vpc-1");
        assert_eq!(state["region"], "nyc3");
        assert_eq!(state["urn"], "do:vpc:vpc-1");
        assert!(state.get("description").is_none());

        let post = &mock.requests_to(Method::Post, VPCS_PATH)[0];
        assert_eq!(post.json().unwrap()["region"], "nyc3");
        assert!(post.json().unwrap().get("ip_range").is_none());
    }

    #[tokio::test]
    async fn test_rename_patches_in_place() {
        let mock = MockTransport::new()
            .on(Method::Patch, "/v2/vpcs/vpc-1", 200, json!({"vpc": vpc("vpc-1", "renamed", "nyc3", false)}))
            .on(Method::Get, "/v2/vpcs/vpc-1", 200, json!({"vpc": vpc("vpc-1", "renamed", "nyc3", false)}));
        let tester = configured(&mock).await;
        let prior = json!({
            "id": "vpc-1", "name": "net", "region": "nyc3", "ip_range": "10.10.10.0/24",
            "urn": "do:vpc:vpc-1", "default": false, "created_at": "2024-01-01T00:00:00Z"
        });
        let mut planned = prior.clone();
        planned["name"] = json!("renamed");

        let plan = tester
            .plan_update("digitalocean_vpc", prior.clone(), planned)
            .await
            .unwrap();
        assert_plan_updates_in_place(&plan);

        let state = tester
            .update("digitalocean_vpc", prior, plan.planned_state)
            .await
            .unwrap();
        assert_eq!(state["name"], "renamed");
        let patch = &mock.requests_to(Method::Patch, "/v2/vpcs/vpc-1")[0];
        assert_eq!(patch.json().unwrap()["name"], "renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_retries_member_conflicts() {
        let mock = MockTransport::new()
            .on(Method::Delete, "/v2/vpcs/vpc-1", 409, json!({"id": "conflict", "message": "VPC has members"}))
            .on(Method::Delete, "/v2/vpcs/vpc-1", 204, Value::Null);
        let tester = configured(&mock).await;
        tester
            .delete("digitalocean_vpc", json!({"id": "vpc-1", "name": "net"}))
            .await
            .unwrap();
        assert_eq!(mock.count(Method::Delete, "/v2/vpcs/vpc-1"), 2);
    }

    #[tokio::test]
    async fn test_delete_of_missing_vpc_succeeds() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        tester
            .delete("digitalocean_vpc", json!({"id": "vpc-1", "name": "net"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_data_source_lookups() {
        let list = json!({"vpcs": [
            vpc("vpc-1", "net", "nyc3", false),
            vpc("vpc-2", "default-nyc3", "nyc3", true),
            vpc("vpc-3", "default-sfo3", "sfo3", true)
        ]});
        let mock = MockTransport::new().on(Method::Get, VPCS_PATH, 200, list);
        let tester = configured(&mock).await;

        let by_name = tester
            .read_data_source("digitalocean_vpc", json!({"name": "net"}))
            .await
            .unwrap();
        assert_eq!(by_name["id"], "vpc-1");
        assert_eq!(by_name["ip_range"], "10.10.10.0/24");

        let by_region = tester
            .read_data_source("digitalocean_vpc", json!({"region": "SFO3"}))
            .await
            .unwrap();
        assert_eq!(by_region["id"], "vpc-3");

        let err = tester
            .read_data_source("digitalocean_vpc", json!({"name": "missing"}))
            .await
            .unwrap_err();
        assert!(err.message().contains("no VPC found with name missing"));
    }

    #[tokio::test]
    async fn test_data_source_requires_exactly_one_selector() {
        let mock = MockTransport::new();
        let provider = mock.provider().unwrap();
        let diagnostics = provider
            .validate_data_source_config("digitalocean_vpc", json!({"name": "a", "region": "nyc3"}))
            .await
            .unwrap();
        assert!(diagnostics.iter().any(|d| d.is_error()));
    }
}
