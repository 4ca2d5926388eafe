//! GenAI agents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::lookup::{filter_by_name, NameFilter, Named};
use crate::mapping::{flatten_blocks, normalize_region, string_set};
use crate::pagination::{list_all, ListRequest, LOOKUP_PER_PAGE};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, DataSource, Resource};
use crate::resources::set_optional_str;
use crate::schema::{Attribute, AttributeFlags, Block, NestedBlock, Schema, Validator};
use crate::state::ResourceData;

pub(crate) const AGENTS_PATH: &str = "/v2/gen-ai/agents";

const VISIBILITIES: [&str; 2] = ["VISIBILITY_PRIVATE", "VISIBILITY_PUBLIC"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Model {
    uuid: String,
    name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Deployment {
    url: String,
    visibility: String,
    status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Agent {
    uuid: String,
    name: String,
    description: String,
    instruction: String,
    model: Model,
    project_id: String,
    region: String,
    tags: Vec<String>,
    k: i64,
    temperature: f64,
    top_p: f64,
    max_tokens: i64,
    deployment: Deployment,
    created_at: String,
    updated_at: String,
}

impl Named for Agent {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Row of the `agents` list data source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct AgentSummary {
    id: String,
    name: String,
    region: String,
    project_id: String,
    model_uuid: String,
    url: String,
    visibility: String,
}

impl From<&Agent> for AgentSummary {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.uuid.clone(),
            name: agent.name.clone(),
            region: normalize_region(&agent.region),
            project_id: agent.project_id.clone(),
            model_uuid: agent.model.uuid.clone(),
            url: agent.deployment.url.clone(),
            visibility: agent.deployment.visibility.clone(),
        }
    }
}

pub(crate) fn agent_path(uuid: &str) -> String {
    format!("{}/{}", AGENTS_PATH, uuid)
}

async fn get_agent(ctx: &OpContext, client: &Client, uuid: &str) -> Result<Agent, ProviderError> {
    let body = client.get(ctx, &agent_path(uuid), &[]).await?;
    extract(&body, "agent")
}

async fn set_visibility(
    ctx: &OpContext,
    client: &Client,
    uuid: &str,
    visibility: &str,
) -> Result<(), ProviderError> {
    debug!(uuid, visibility, "changing agent visibility");
    client
        .put(
            ctx,
            &format!("{}/deployment_visibility", agent_path(uuid)),
            json!({"uuid": uuid, "visibility": visibility}),
        )
        .await
        .map(|_| ())
}

fn set_state(data: &mut ResourceData, agent: &Agent) {
    data.set_id(agent.uuid.as_str());
    data.set("agent_id", agent.uuid.as_str());
    data.set("name", agent.name.as_str());
    set_optional_str(data, "description", &agent.description);
    data.set("instruction", agent.instruction.as_str());
    data.set("model_uuid", agent.model.uuid.as_str());
    data.set("model_name", agent.model.name.as_str());
    data.set("project_id", agent.project_id.as_str());
    data.set("region", normalize_region(&agent.region));
    data.set("tags", string_set(&agent.tags));
    data.set("k", agent.k);
    data.set("temperature", agent.temperature);
    data.set("top_p", agent.top_p);
    data.set("max_tokens", agent.max_tokens);
    data.set("url", agent.deployment.url.as_str());
    set_optional_str(data, "visibility", &agent.deployment.visibility);
    data.set("deployment_status", agent.deployment.status.as_str());
    data.set("created_at", agent.created_at.as_str());
    data.set("updated_at", agent.updated_at.as_str());
}

/// Tunables sent on create and update when configured.
const TUNABLES: [&str; 4] = ["k", "temperature", "top_p", "max_tokens"];

fn agent_request(data: &ResourceData) -> Result<Map<String, Value>, ProviderError> {
    let mut body = Map::new();
    body.insert("name".to_string(), json!(data.require_str("name")?));
    body.insert("instruction".to_string(), json!(data.require_str("instruction")?));
    body.insert("model_uuid".to_string(), json!(data.require_str("model_uuid")?));
    body.insert("description".to_string(), json!(data.get_string("description")));
    body.insert("tags".to_string(), json!(data.get_strings("tags")));
    for key in TUNABLES {
        if let Some(value) = data.get(key) {
            body.insert(key.to_string(), value.clone());
        }
    }
    Ok(body)
}

/// `digitalocean_genai_agent`
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentResource;

#[async_trait]
impl Resource for AgentResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A GenAI agent backed by a foundation model.")
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "instruction",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute("model_uuid", Attribute::required_string())
            .with_attribute("project_id", Attribute::required_string().with_force_new())
            .with_attribute("region", Attribute::required_string().with_force_new())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute("tags", Attribute::string_set(AttributeFlags::optional()))
            .with_attribute(
                "k",
                Attribute::optional_computed_int64().with_validator(Validator::int_between(1, 10)),
            )
            .with_attribute(
                "temperature",
                Attribute::optional_computed_float64()
                    .with_validator(Validator::float_between(0.0, 1.0)),
            )
            .with_attribute(
                "top_p",
                Attribute::optional_computed_float64()
                    .with_validator(Validator::float_between(0.0, 1.0)),
            )
            .with_attribute("max_tokens", Attribute::optional_computed_int64())
            .with_attribute(
                "visibility",
                Attribute::optional_computed_string().with_validator(Validator::string_in(VISIBILITIES)),
            )
            .with_attribute("open_ai_key_uuid", Attribute::optional_string().with_force_new())
            .with_attribute("anthropic_key_uuid", Attribute::optional_string().with_force_new())
            .with_attribute("agent_id", Attribute::computed_string())
            .with_attribute("model_name", Attribute::computed_string())
            .with_attribute("url", Attribute::computed_string())
            .with_attribute("deployment_status", Attribute::computed_string())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let mut body = agent_request(data)?;
        body.insert("project_id".to_string(), json!(data.require_str("project_id")?));
        body.insert("region".to_string(), json!(normalize_region(data.require_str("region")?)));
        for key in ["open_ai_key_uuid", "anthropic_key_uuid"] {
            if let Some(value) = data.get_str(key).filter(|s| !s.is_empty()) {
                body.insert(key.to_string(), json!(value));
            }
        }

        let client = &meta.client;
        let response = client.post(ctx, AGENTS_PATH, Value::Object(body)).await?;
        let agent: Agent = extract(&response, "agent")?;
        info!(uuid = %agent.uuid, "GenAI agent created");
        data.set_id(agent.uuid.as_str());

        if let Some(visibility) = data.get_str("visibility").filter(|v| !v.is_empty()) {
            if visibility != agent.deployment.visibility {
                set_visibility(ctx, client, &agent.uuid, visibility).await?;
            }
        }
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        match get_agent(ctx, &meta.client, data.id()).await {
            Ok(agent) => {
                set_state(data, &agent);
                Ok(())
            },
            Err(err) => clear_if_not_found(err, "GenAI agent", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let client = &meta.client;
        let uuid = data.id().to_string();
        let mut fields = vec!["name", "instruction", "model_uuid", "description", "tags"];
        fields.extend(TUNABLES);
        if data.has_changes(&fields) {
            let mut body = agent_request(data)?;
            body.insert("uuid".to_string(), json!(uuid));
            client.put(ctx, &agent_path(&uuid), Value::Object(body)).await?;
        }
        if data.has_change("visibility") {
            if let Some(visibility) = data.get_str("visibility").filter(|v| !v.is_empty()) {
                set_visibility(ctx, client, &uuid, visibility).await?;
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if let Err(err) = meta.client.delete(ctx, &agent_path(data.id()), &[]).await {
            return clear_if_not_found(err, "GenAI agent", data);
        }
        data.clear_id();
        Ok(())
    }
}

/// `digitalocean_genai_agent` data source.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentDataSource;

#[async_trait]
impl DataSource for AgentDataSource {
    fn schema(&self) -> Schema {
        let computed = |name: &str| (name.to_string(), Attribute::computed_string());
        let mut schema = Schema::v0().with_attribute(
            "agent_id",
            Attribute::required_string().with_validator(Validator::NoZeroValues),
        );
        for (name, attr) in [
            "name",
            "description",
            "instruction",
            "model_uuid",
            "model_name",
            "project_id",
            "region",
            "url",
            "visibility",
            "deployment_status",
            "created_at",
            "updated_at",
        ]
        .map(computed)
        {
            schema = schema.with_attribute(name, attr);
        }
        schema
            .with_attribute("tags", Attribute::string_set(AttributeFlags::computed()))
            .with_attribute("k", Attribute::computed_int64())
            .with_attribute("temperature", Attribute::computed_float64())
            .with_attribute("top_p", Attribute::computed_float64())
            .with_attribute("max_tokens", Attribute::computed_int64())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let agent = get_agent(ctx, &meta.client, data.require_str("agent_id")?).await?;
        set_state(data, &agent);
        Ok(())
    }
}

/// `digitalocean_genai_agents`: every agent, optionally filtered by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentsDataSource;

#[async_trait]
impl DataSource for AgentsDataSource {
    fn schema(&self) -> Schema {
        let row = Block::new()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("name", Attribute::computed_string())
            .with_attribute("region", Attribute::computed_string())
            .with_attribute("project_id", Attribute::computed_string())
            .with_attribute("model_uuid", Attribute::computed_string())
            .with_attribute("url", Attribute::computed_string())
            .with_attribute("visibility", Attribute::computed_string());
        Schema::v0()
            .with_attribute(
                "name_regex",
                Attribute::optional_string().with_validator(Validator::ValidRegexp),
            )
            .with_block("agents", NestedBlock::list(row).computed())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let filter = match data.get_str("name_regex").filter(|s| !s.is_empty()) {
            Some(pattern) => Some(NameFilter::regex(pattern)?),
            None => None,
        };
        let request = ListRequest::new(AGENTS_PATH, "agents").with_per_page(LOOKUP_PER_PAGE);
        let agents = list_all(&meta.client, ctx, &request, |a: &Agent| a.uuid.clone()).await?;
        let rows: Vec<AgentSummary> = filter_by_name(agents, filter.as_ref())
            .iter()
            .map(AgentSummary::from)
            .collect();
        debug!(count = rows.len(), "listed GenAI agents");

        data.set("agents", flatten_blocks(&rows)?);
        let id = match data.get_str("name_regex") {
            Some(pattern) if !pattern.is_empty() => format!("agents/{}", pattern),
            _ => "agents".to_string(),
        };
        data.set_id(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Method;
    use crate::testing::{assert_plan_no_changes, MockTransport, ProviderTester};
    use crate::DigitalOceanProvider;

    const AGENT: &str = "/v2/gen-ai/agents/ag-1";

    fn agent(name: &str, visibility: &str) -> Value {
        json!({
            "uuid": "ag-1",
            "name": name,
            "instruction": "Answer billing questions.",
            "model": {"uuid": "model-1", "name": "Llama 3.3 Instruct (70B)"},
            "project_id": "proj-1",
            "region": "TOR1",
            "tags": ["support"],
            "k": 5,
            "temperature": 0.7,
            "top_p": 0.9,
            "max_tokens": 512,
            "deployment": {"url": "https://agent-1.ondigitalocean.app", "visibility": visibility, "status": "STATUS_RUNNING"},
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        })
    }

    fn config() -> Value {
        json!({
            "name": "billing",
            "instruction": "Answer billing questions.",
            "model_uuid": "model-1",
            "project_id": "proj-1",
            "region": "tor1",
            "tags": ["support"],
            "visibility": "VISIBILITY_PUBLIC"
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
    async fn test_create_then_publish() {
        let mock = MockTransport::new()
            .on(Method::Post, AGENTS_PATH, 200, json!({"agent": agent("billing", "VISIBILITY_PRIVATE")}))
            .on(Method::Put, "/v2/gen-ai/agents/ag-1/deployment_visibility", 200, json!({}))
            .on(Method::Get, AGENT, 200, json!({"agent": agent("billing", "VISIBILITY_PUBLIC")}));
        let tester = configured(&mock).await;

        let state = tester.create("digitalocean_genai_agent", config()).await.unwrap();
        assert_eq!(state["id"], "ag-1");
        assert_eq!(state["region"], "tor1");
        assert_eq!(state["url"], "https://agent-1.ondigitalocean.app");

        let visibility = mock.requests_to(Method::Put, "/v2/gen-ai/agents/ag-1/deployment_visibility");
        assert_eq!(
            visibility[0].json().cloned().unwrap(),
            json!({"uuid": "ag-1", "visibility": "VISIBILITY_PUBLIC"})
        );

        let mut planned = config();
        planned["id"] = json!("ag-1");
        let plan = tester
            .plan_update("digitalocean_genai_agent", state, planned)
            .await
            .unwrap();
        assert_plan_no_changes(&plan);
    }

    #[tokio::test]
    async fn test_rename_puts_agent_only() {
        let mock = MockTransport::new()
            .on(Method::Put, AGENT, 200, json!({"agent": agent("billing-v2", "VISIBILITY_PUBLIC")}))
            .on(Method::Get, AGENT, 200, json!({"agent": agent("billing-v2", "VISIBILITY_PUBLIC")}));
        let tester = configured(&mock).await;
        let mut prior = config();
        prior["id"] = json!("ag-1");
        let mut planned = prior.clone();
        planned["name"] = json!("billing-v2");

        let state = tester
            .lifecycle_update("digitalocean_genai_agent", prior, planned)
            .await
            .unwrap();
        assert_eq!(state["name"], "billing-v2");
        let body = mock.requests_to(Method::Put, AGENT)[0].json().cloned().unwrap();
        assert_eq!(body["uuid"], "ag-1");
        assert_eq!(body["name"], "billing-v2");
        assert_eq!(
            mock.count(Method::Put, "/v2/gen-ai/agents/ag-1/deployment_visibility"),
            0
        );
    }

    #[tokio::test]
    async fn test_agents_filtered_by_regex() {
        let mut other = agent("sales", "VISIBILITY_PRIVATE");
        other["uuid"] = json!("ag-2");
        let mock = MockTransport::new().on(
            Method::Get,
            AGENTS_PATH,
            200,
            json!({"agents": [agent("billing", "VISIBILITY_PUBLIC"), other]}),
        );
        let tester = configured(&mock).await;

        let all = tester
            .read_data_source("digitalocean_genai_agents", json!({}))
            .await
            .unwrap();
        assert_eq!(all["agents"].as_array().map(Vec::len), Some(2));

        let filtered = tester
            .read_data_source("digitalocean_genai_agents", json!({"name_regex": "^bill"}))
            .await
            .unwrap();
        assert_eq!(filtered["agents"].as_array().map(Vec::len), Some(1));
        assert_eq!(filtered["agents"][0]["id"], "ag-1");
        assert_eq!(filtered["agents"][0]["model_uuid"], "model-1");
    }

    #[tokio::test]
    async fn test_agent_data_source() {
        let mock = MockTransport::new().on(Method::Get, AGENT, 200, json!({"agent": agent("billing", "VISIBILITY_PUBLIC")}));
        let tester = configured(&mock).await;

        let state = tester
            .read_data_source("digitalocean_genai_agent", json!({"agent_id": "ag-1"}))
            .await
            .unwrap();
        assert_eq!(state["name"], "billing");
        assert_eq!(state["model_name"], "Llama 3.3 Instruct (70B)");
        assert_eq!(state["k"], 5);
    }
}
