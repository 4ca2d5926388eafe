//! Routes from a parent GenAI agent to a child agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::OpContext;
use crate::error::ProviderError;
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, parse_compound_id, Resource};
use crate::resources::genai_agent::agent_path;
use crate::resources::set_optional_str;
use crate::schema::{Attribute, Schema, Validator};
use crate::state::ResourceData;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Child {
    uuid: String,
    name: String,
    route_uuid: String,
    route_name: String,
    if_case: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Children {
    children: Vec<Child>,
}

fn children_path(parent: &str) -> String {
    format!("{}/child_agents", agent_path(parent))
}

fn route_path(parent: &str, child: &str) -> String {
    format!("{}/{}", children_path(parent), child)
}

fn route_id(parent: &str, child: &str) -> String {
    format!("{}:{}", parent, child)
}

fn route_request(data: &ResourceData) -> Result<Value, ProviderError> {
    let mut body = json!({
        "parent_agent_uuid": data.require_str("parent_agent_uuid")?,
        "child_agent_uuid": data.require_str("child_agent_uuid")?,
    });
    for key in ["route_name", "if_case"] {
        if let Some(value) = data.get_str(key).filter(|s| !s.is_empty()) {
            body[key] = json!(value);
        }
    }
    Ok(body)
}

/// `digitalocean_genai_agent_route`
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentRouteResource;

#[async_trait]
impl Resource for AgentRouteResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("Routes requests from a parent agent to a child agent.")
            .with_attribute(
                "parent_agent_uuid",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "child_agent_uuid",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute("route_name", Attribute::optional_computed_string())
            .with_attribute("if_case", Attribute::optional_string())
            .with_attribute("route_uuid", Attribute::computed_string())
            .with_attribute("child_agent_name", Attribute::computed_string())
    }

    fn import_state(&self, id: &str) -> Result<ResourceData, ProviderError> {
        let fields = parse_compound_id(id, 2, "<parent_agent_uuid>,<child_agent_uuid>")?;
        let mut data = ResourceData::with_id(route_id(&fields[0], &fields[1]));
        data.set("parent_agent_uuid", fields[0].as_str());
        data.set("child_agent_uuid", fields[1].as_str());
        Ok(data)
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let parent = data.require_str("parent_agent_uuid")?.to_string();
        let child = data.require_str("child_agent_uuid")?.to_string();
        meta.client
            .post(ctx, &route_path(&parent, &child), route_request(data)?)
            .await?;
        info!(parent = %parent, child = %child, "agent route created");
        data.set_id(route_id(&parent, &child));
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let parent = data.require_str("parent_agent_uuid")?.to_string();
        let child = data.require_str("child_agent_uuid")?.to_string();
        let body = match meta.client.get(ctx, &children_path(&parent), &[]).await {
            Ok(body) => body,
            Err(err) => return clear_if_not_found(err, "GenAI agent", data),
        };
        let listed: Children = serde_json::from_value(body)?;
        let Some(found) = listed.children.into_iter().find(|c| c.uuid == child) else {
            warn!(id = data.id(), "agent route not found, removing from state");
            data.clear_id();
            return Ok(());
        };
        data.set("child_agent_name", found.name.as_str());
        data.set("route_uuid", found.route_uuid.as_str());
        set_optional_str(data, "route_name", &found.route_name);
        set_optional_str(data, "if_case", &found.if_case);
        Ok(())
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_changes(&["route_name", "if_case"]) {
            return Ok(());
        }
        let path = route_path(
            data.require_str("parent_agent_uuid")?,
            data.require_str("child_agent_uuid")?,
        );
        let mut body = route_request(data)?;
        let route_uuid = data.get_string("route_uuid");
        if !route_uuid.is_empty() {
            body["uuid"] = json!(route_uuid);
        }
        meta.client.put(ctx, &path, body).await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let path = route_path(
            data.require_str("parent_agent_uuid")?,
            data.require_str("child_agent_uuid")?,
        );
        if let Err(err) = meta.client.delete(ctx, &path, &[]).await {
            return clear_if_not_found(err, "agent route", data);
        }
        data.clear_id();
        Ok(())
    }
}
