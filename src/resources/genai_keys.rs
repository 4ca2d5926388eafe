//! GenAI API keys: per-agent access keys and account OpenAI keys.
//!
//! Both kinds hold a secret the API returns at most once. Agent keys echo
//! `secret_key` in the create response only; OpenAI keys never echo the
//! configured `api_key`. Either way the value in state comes from a previous
//! write and is never overwritten by a read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::pagination::{list_all, ListRequest, DEFAULT_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, parse_compound_id, DataSource, Resource};
use crate::resources::genai_agent::agent_path;
use crate::schema::{Attribute, Schema, Validator};
use crate::state::ResourceData;

const OPENAI_KEYS_PATH: &str = "/v2/gen-ai/openai/keys";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ApiKeyInfo {
    uuid: String,
    name: String,
    secret_key: String,
    created_by: String,
    created_at: String,
    deleted_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct OpenAiKey {
    uuid: String,
    name: String,
    created_by: String,
    created_at: String,
    updated_at: String,
}

fn agent_keys_path(agent_uuid: &str) -> String {
    format!("{}/api_keys", agent_path(agent_uuid))
}

fn agent_key_path(agent_uuid: &str, key_uuid: &str) -> String {
    format!("{}/{}", agent_keys_path(agent_uuid), key_uuid)
}

/// The agent API has no single-key GET; the key is found in the agent's list.
async fn find_agent_key(
    ctx: &OpContext,
    client: &Client,
    agent_uuid: &str,
    key_uuid: &str,
) -> Result<Option<ApiKeyInfo>, ProviderError> {
    let path = agent_keys_path(agent_uuid);
    let request = ListRequest::new(&path, "api_key_infos").with_per_page(DEFAULT_PER_PAGE);
    let keys = list_all(client, ctx, &request, |k: &ApiKeyInfo| k.uuid.clone()).await?;
    Ok(keys
        .into_iter()
        .find(|k| k.uuid == key_uuid && k.deleted_at.is_empty()))
}

/// `digitalocean_genai_agent_api_key`
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentApiKeyResource;

#[async_trait]
impl Resource for AgentApiKeyResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("An API key for calling a GenAI agent's endpoint.")
            .with_attribute(
                "agent_uuid",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute("api_key", Attribute::computed_string().sensitive())
            .with_attribute("created_by", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
    }

    fn import_state(&self, id: &str) -> Result<ResourceData, ProviderError> {
        let fields = parse_compound_id(id, 2, "<agent_uuid>,<api_key_uuid>")?;
        let mut data = ResourceData::with_id(fields[1].as_str());
        data.set("agent_uuid", fields[0].as_str());
        Ok(data)
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let agent_uuid = data.require_str("agent_uuid")?.to_string();
        let body = json!({"agent_uuid": agent_uuid, "name": data.require_str("name")?});
        let response = meta.client.post(ctx, &agent_keys_path(&agent_uuid), body).await?;
        let key: ApiKeyInfo = extract(&response, "api_key_info")?;
        if key.uuid.is_empty() {
            return Err(ProviderError::Sdk("agent API key response carried no uuid".to_string()));
        }
        info!(agent = %agent_uuid, uuid = %key.uuid, "agent API key created");
        data.set_id(key.uuid.as_str());
        data.set("api_key", key.secret_key.as_str());
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let agent_uuid = data.require_str("agent_uuid")?.to_string();
        let found = match find_agent_key(ctx, &meta.client, &agent_uuid, data.id()).await {
            Ok(found) => found,
            Err(err) => return clear_if_not_found(err, "GenAI agent", data),
        };
        let Some(key) = found else {
            warn!(id = data.id(), agent = %agent_uuid, "agent API key not found, removing from state");
            data.clear_id();
            return Ok(());
        };
        data.set("name", key.name.as_str());
        data.set("created_by", key.created_by.as_str());
        data.set("created_at", key.created_at.as_str());
        Ok(())
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_change("name") {
            return Ok(());
        }
        let agent_uuid = data.require_str("agent_uuid")?;
        let body = json!({
            "agent_uuid": agent_uuid,
            "api_key_uuid": data.id(),
            "name": data.require_str("name")?,
        });
        meta.client
            .put(ctx, &agent_key_path(agent_uuid, data.id()), body)
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let path = agent_key_path(data.require_str("agent_uuid")?, data.id());
        if let Err(err) = meta.client.delete(ctx, &path, &[]).await {
            return clear_if_not_found(err, "agent API key", data);
        }
        data.clear_id();
        Ok(())
    }
}

fn openai_key_path(uuid: &str) -> String {
    format!("{}/{}", OPENAI_KEYS_PATH, uuid)
}

async fn get_openai_key(ctx: &OpContext, client: &Client, uuid: &str) -> Result<OpenAiKey, ProviderError> {
    let body = client.get(ctx, &openai_key_path(uuid), &[]).await?;
    extract(&body, "api_key_info")
}

fn set_openai_state(data: &mut ResourceData, key: &OpenAiKey) {
    data.set_id(key.uuid.as_str());
    data.set("uuid", key.uuid.as_str());
    data.set("name", key.name.as_str());
    data.set("created_by", key.created_by.as_str());
    data.set("created_at", key.created_at.as_str());
    data.set("updated_at", key.updated_at.as_str());
}

/// `digitalocean_genai_openai_api_key`
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiKeyResource;

#[async_trait]
impl Resource for OpenAiKeyResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("An OpenAI API key agents can use for OpenAI models.")
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "api_key",
                Attribute::required_string()
                    .sensitive()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute("uuid", Attribute::computed_string())
            .with_attribute("created_by", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let body = json!({
            "name": data.require_str("name")?,
            "api_key": data.require_str("api_key")?,
        });
        let response = meta.client.post(ctx, OPENAI_KEYS_PATH, body).await?;
        let key: OpenAiKey = extract(&response, "api_key_info")?;
        info!(uuid = %key.uuid, "OpenAI API key registered");
        data.set_id(key.uuid.as_str());
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        match get_openai_key(ctx, &meta.client, data.id()).await {
            Ok(key) => {
                set_openai_state(data, &key);
                Ok(())
            },
            Err(err) => clear_if_not_found(err, "OpenAI API key", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_changes(&["name", "api_key"]) {
            return Ok(());
        }
        let mut body = json!({"api_key_uuid": data.id(), "name": data.require_str("name")?});
        if data.has_change("api_key") {
            body["api_key"] = Value::from(data.require_str("api_key")?);
        }
        meta.client.put(ctx, &openai_key_path(data.id()), body).await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if let Err(err) = meta.client.delete(ctx, &openai_key_path(data.id()), &[]).await {
            return clear_if_not_found(err, "OpenAI API key", data);
        }
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_genai_openai_api_key` data source.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiKeyDataSource;

#[async_trait]
impl DataSource for OpenAiKeyDataSource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "uuid",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute("name", Attribute::computed_string())
            .with_attribute("created_by", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let key = get_openai_key(ctx, &meta.client, data.require_str("uuid")?).await?;
        set_openai_state(data, &key);
        Ok(())
    }
}
