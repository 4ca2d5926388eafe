//! Partner network connect attachments: interconnects between VPCs and a
//! network-as-a-service provider.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::lookup::{find_one, parse_timestamp, NameFilter, Named};
use crate::mapping::{expand_block, flatten_block, normalize_region, string_set};
use crate::pagination::{list_all, ListRequest, LOOKUP_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, DataSource, Resource, Timeouts};
use crate::resources::set_optional_str;
use crate::retry::{classify_delete, retry, Backoff};
use crate::schema::{
    Attribute, AttributeFlags, AttributeType, Block, Constraint, NestedBlock, Schema, Validator,
};
use crate::state::ResourceData;
use crate::waiter::{observe, wait_for_state, StateChangeConf};

const ATTACHMENTS_PATH: &str = "/v2/partner_network_connect/attachments";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Bgp {
    #[serde(skip_serializing_if = "Option::is_none")]
    local_asn: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    local_router_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer_asn: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    peer_router_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    auth_key: String,
}

impl Bgp {
    fn is_empty(&self) -> bool {
        *self == Bgp::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct PartnerAttachment {
    id: String,
    name: String,
    state: String,
    connection_bandwidth_in_mbps: i64,
    region: String,
    naas_provider: String,
    vpc_ids: Vec<String>,
    bgp: Bgp,
    redundancy_zone: String,
    parent_uuid: String,
    children: Vec<String>,
    created_at: String,
}

impl Named for PartnerAttachment {
    fn name(&self) -> &str {
        &self.name
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(Some(&self.created_at))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ServiceKey {
    value: String,
    state: String,
    created_at: String,
}

fn attachment_path(id: &str) -> String {
    format!("{}/{}", ATTACHMENTS_PATH, id)
}

async fn get_attachment(
    ctx: &OpContext,
    client: &Client,
    id: &str,
) -> Result<PartnerAttachment, ProviderError> {
    let body = client.get(ctx, &attachment_path(id), &[]).await?;
    extract(&body, "partner_attachment")
}

fn set_state(data: &mut ResourceData, attachment: &PartnerAttachment) -> Result<(), ProviderError> {
    let mut bgp = attachment.bgp.clone();
    // The API never returns the BGP secret.
    if bgp.auth_key.is_empty() {
        bgp.auth_key = data.get_string("bgp.0.auth_key");
    }

    data.set_id(attachment.id.as_str());
    data.set("name", attachment.name.as_str());
    data.set("state", attachment.state.as_str());
    data.set("connection_bandwidth_in_mbps", attachment.connection_bandwidth_in_mbps);
    data.set("region", normalize_region(&attachment.region));
    data.set("naas_provider", attachment.naas_provider.as_str());
    data.set("vpc_ids", string_set(&attachment.vpc_ids));
    if bgp.is_empty() {
        data.remove("bgp");
    } else {
        data.set("bgp", flatten_block(&bgp)?);
    }
    set_optional_str(data, "redundancy_zone", &attachment.redundancy_zone);
    set_optional_str(data, "parent_uuid", &attachment.parent_uuid);
    data.set("children", string_set(&attachment.children));
    data.set("created_at", attachment.created_at.as_str());
    Ok(())
}

fn bgp_block(flags: AttributeFlags) -> Block {
    let computed_only = flags.is_computed_only();
    let string = || Attribute::new(AttributeType::String, flags);
    let auth_key = if computed_only {
        Attribute::computed_string()
    } else {
        Attribute::optional_string()
    };
    Block::new()
        .with_attribute("local_asn", Attribute::computed_int64())
        .with_attribute("local_router_ip", string())
        .with_attribute("peer_asn", Attribute::new(AttributeType::Int64, flags))
        .with_attribute("peer_router_ip", string())
        .with_attribute("auth_key", auth_key.sensitive())
}

/// `digitalocean_partner_attachment`
#[derive(Debug, Clone, Copy, Default)]
pub struct PartnerAttachmentResource;

#[async_trait]
impl Resource for PartnerAttachmentResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("An interconnect between VPCs and a partner network.")
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "connection_bandwidth_in_mbps",
                Attribute::required_int64()
                    .with_force_new()
                    .with_validator(Validator::int_between(50, 10000)),
            )
            .with_attribute("region", Attribute::required_string().with_force_new())
            .with_attribute("naas_provider", Attribute::required_string().with_force_new())
            .with_attribute(
                "vpc_ids",
                Attribute::string_set(AttributeFlags::required())
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "redundancy_zone",
                Attribute::optional_computed_string()
                    .with_force_new()
                    .with_validator(Validator::string_in(["MEGAPORT_BLUE", "MEGAPORT_RED"])),
            )
            .with_attribute("parent_uuid", Attribute::optional_computed_string().with_force_new())
            .with_attribute("children", Attribute::string_set(AttributeFlags::computed()))
            .with_attribute("state", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_block(
                "bgp",
                NestedBlock::list(bgp_block(AttributeFlags::optional_computed()))
                    .with_max_items(1)
                    .with_force_new(),
            )
    }

    fn timeouts(&self) -> Timeouts {
        let two_minutes = Duration::from_secs(2 * 60);
        Timeouts::default()
            .with_create(two_minutes)
            .with_delete(two_minutes)
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let mut body = json!({
            "name": data.require_str("name")?,
            "connection_bandwidth_in_mbps": data.get_i64("connection_bandwidth_in_mbps"),
            "region": normalize_region(data.require_str("region")?),
            "naas_provider": data.require_str("naas_provider")?,
            "vpc_ids": data.get_strings("vpc_ids"),
        });
        for key in ["redundancy_zone", "parent_uuid"] {
            if let Some(value) = data.get_str(key).filter(|s| !s.is_empty()) {
                body[key] = json!(value);
            }
        }
        if let Some(bgp) = expand_block::<Bgp>(data.get("bgp"))? {
            body["bgp"] = serde_json::to_value(&bgp)?;
        }

        let client = &meta.client;
        let response = client.post(ctx, ATTACHMENTS_PATH, body).await?;
        let attachment: PartnerAttachment = extract(&response, "partner_attachment")?;
        info!(id = %attachment.id, "partner attachment created, waiting for it to become ready");
        data.set_id(attachment.id.as_str());

        let id = attachment.id.as_str();
        let conf = StateChangeConf::new(&["CREATING"], &["CREATED"]).with_timeout(self.timeouts().create);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_attachment(ctx, client, id).await, |a| a.state.clone())
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
        match get_attachment(ctx, &meta.client, data.id()).await {
            Ok(attachment) => set_state(data, &attachment),
            Err(err) => clear_if_not_found(err, "partner attachment", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let mut body = serde_json::Map::new();
        if data.has_change("name") {
            body.insert("name".to_string(), json!(data.require_str("name")?));
        }
        if data.has_change("vpc_ids") {
            body.insert("vpc_ids".to_string(), json!(data.get_strings("vpc_ids")));
        }
        if body.is_empty() {
            return Ok(());
        }
        meta.client
            .patch(ctx, &attachment_path(data.id()), Value::Object(body))
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
        let path = attachment_path(&id);
        // Attachments refuse deletion while BGP sessions or VPC routes still reference them.
        let result = retry(ctx, self.timeouts().delete, Backoff::default(), || {
            let path = path.as_str();
            async move { client.delete(ctx, path, &[]).await.map_err(classify_delete) }
        })
        .await;
        if let Err(err) = result {
            return clear_if_not_found(err, "partner attachment", data);
        }

        let id_ref = id.as_str();
        let conf = StateChangeConf::until_gone(&["DELETING", "CREATED"]).with_timeout(self.timeouts().delete);
        wait_for_state(ctx, &conf, move || async move {
            observe(get_attachment(ctx, client, id_ref).await, |a| a.state.clone())
        })
        .await?;
        info!(id = %id, "partner attachment deleted");
        data.clear_id();
        Ok(())
    }
}

fn lookup_schema() -> Schema {
    Schema::v0()
        .with_attribute("connection_bandwidth_in_mbps", Attribute::computed_int64())
        .with_attribute("region", Attribute::computed_string())
        .with_attribute("naas_provider", Attribute::computed_string())
        .with_attribute("vpc_ids", Attribute::string_set(AttributeFlags::computed()))
        .with_attribute("redundancy_zone", Attribute::computed_string())
        .with_attribute("parent_uuid", Attribute::computed_string())
        .with_attribute("children", Attribute::string_set(AttributeFlags::computed()))
        .with_attribute("state", Attribute::computed_string())
        .with_attribute("created_at", Attribute::computed_string())
        .with_block(
            "bgp",
            NestedBlock::list(bgp_block(AttributeFlags::computed())).computed(),
        )
}

/// `digitalocean_partner_attachment` data source: by id or name.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartnerAttachmentDataSource;

#[async_trait]
impl DataSource for PartnerAttachmentDataSource {
    fn schema(&self) -> Schema {
        lookup_schema()
            .with_attribute("id", Attribute::optional_computed_string())
            .with_attribute("name", Attribute::optional_computed_string())
            .with_constraint(Constraint::exactly_one_of(["id", "name"]))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let attachment = match data.get_str("id").filter(|s| !s.is_empty()) {
            Some(id) => get_attachment(ctx, &meta.client, id).await?,
            None => {
                let filter = NameFilter::Exact(data.require_str("name")?.to_string());
                let request = ListRequest::new(ATTACHMENTS_PATH, "partner_attachments")
                    .with_per_page(LOOKUP_PER_PAGE);
                let attachments =
                    list_all(&meta.client, ctx, &request, |a: &PartnerAttachment| a.id.clone()).await?;
                find_one(attachments, "partner attachment", &filter, false)?
            },
        };
        set_state(data, &attachment)
    }
}

/// `digitalocean_partner_attachment_service_key`: the key handed to the
/// partner to complete the interconnect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceKeyDataSource;

#[async_trait]
impl DataSource for ServiceKeyDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "attachment_id",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute("value", Attribute::computed_string().sensitive())
            .with_attribute("state", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let attachment_id = data.require_str("attachment_id")?.to_string();
        let path = format!("{}/service_key", attachment_path(&attachment_id));
        let body = meta.client.get(ctx, &path, &[]).await?;
        let key: ServiceKey = extract(&body, "service_key")?;
        data.set("value", key.value.as_str());
        data.set("state", key.state.as_str());
        data.set("created_at", key.created_at.as_str());
        data.set_id(attachment_id);
        Ok(())
    }
}
