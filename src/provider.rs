//! The DigitalOcean provider: registry plus lifecycle engine.
//!
//! [`DigitalOceanProvider`] implements [`ProviderService`] by looking up the
//! named [`Resource`] or [`DataSource`] and running the shared lifecycle rules
//! around it: validation and defaults before any API call, a read after every
//! mutation, delete-then-create for force-new changes, and import
//! verification.

use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use crate::client::{Client, HttpTransport, Transport};
use crate::config::ProviderConfig;
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::plan::{plan_resource, replacing_changes};
use crate::registry::ResourceRegistry;
use crate::resource::{DataSource, Resource};
use crate::resources;
use crate::schema::{Diagnostic, ProviderSchema, Schema};
use crate::service::ProviderService;
use crate::state::{ResourceData, ID_KEY};
use crate::types::{ImportedResource, PlanResult};
use crate::validation::{apply_defaults, coerce, validate};

/// Dependencies shared by every lifecycle call once the provider is configured.
#[derive(Debug, Clone)]
pub struct ProviderMeta {
    /// Authenticated API client.
    pub client: Client,
    /// Resolved provider configuration.
    pub config: Arc<ProviderConfig>,
}

impl ProviderMeta {
    /// Bundle a client with its configuration.
    pub fn new(client: Client, config: ProviderConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }
}

/// DigitalOcean implementation of [`ProviderService`].
pub struct DigitalOceanProvider {
    registry: ResourceRegistry,
    meta: OnceLock<ProviderMeta>,
    transport: Option<Arc<dyn Transport>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DigitalOceanProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanProvider")
            .field("registry", &self.registry)
            .field("configured", &self.meta.get().is_some())
            .finish()
    }
}

impl DigitalOceanProvider {
    /// A provider that talks to the API over HTTPS once configured.
    pub fn new() -> Result<Self, ProviderError> {
        Ok(Self::from_parts(resources::registry()?, None))
    }

    /// A provider whose `configure` installs `transport` instead of HTTPS.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Result<Self, ProviderError> {
        Ok(Self::from_parts(resources::registry()?, Some(transport)))
    }

    fn from_parts(registry: ResourceRegistry, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            registry,
            meta: OnceLock::new(),
            transport,
            cancel: CancellationToken::new(),
        }
    }

    /// The registry backing this provider.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    fn meta(&self) -> Result<&ProviderMeta, ProviderError> {
        self.meta.get().ok_or_else(|| {
            ProviderError::Configuration("provider is not configured; call configure first".to_string())
        })
    }

    fn resource(&self, resource_type: &str) -> Result<Arc<dyn Resource>, ProviderError> {
        self.registry.resource(resource_type).ok_or_else(|| {
            ProviderError::UnknownResource(format!("Unknown resource type: {}", resource_type))
        })
    }

    fn data_source(&self, data_source_type: &str) -> Result<Arc<dyn DataSource>, ProviderError> {
        self.registry.data_source(data_source_type).ok_or_else(|| {
            ProviderError::UnknownResource(format!("Unknown data source type: {}", data_source_type))
        })
    }

    fn op_context(&self, timeout: std::time::Duration) -> OpContext {
        OpContext::with_cancel(&self.cancel).child_with_timeout(timeout)
    }

    async fn create_and_read(
        &self,
        resource: &dyn Resource,
        meta: &ProviderMeta,
        mut data: ResourceData,
    ) -> Result<Value, ProviderError> {
        let timeouts = resource.timeouts();
        resource
            .create(&self.op_context(timeouts.create), meta, &mut data)
            .await?;
        if data.is_absent() {
            return Err(ProviderError::Sdk(
                "create finished without setting an identifier".to_string(),
            ));
        }
        let id = data.id().to_string();
        Span::current().record("id", id.as_str());

        resource
            .read(&self.op_context(timeouts.read), meta, &mut data)
            .await?;
        if data.is_absent() {
            return Err(ProviderError::NotFound(format!(
                "{} disappeared right after it was created",
                id
            )));
        }
        Ok(data.into_value())
    }
}

/// Coerce, default and validate a configuration; error diagnostics abort.
fn prepare(schema: &Schema, value: Value) -> Result<Value, ProviderError> {
    let mut value = value;
    coerce(schema, &mut value);
    apply_defaults(schema, &mut value);
    match ProviderError::from_diagnostics(&validate(schema, &value)) {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

/// Drop computed-only attributes and computed blocks carried over from a
/// replaced instance.
fn without_computed(schema: &Schema, value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    for (name, attr) in &schema.block.attributes {
        if attr.flags.is_computed_only() {
            map.remove(name);
        }
    }
    for (name, nested) in &schema.block.blocks {
        if nested.computed {
            map.remove(name);
        }
    }
    Value::Object(map)
}

fn check(schema: &Schema, value: Value) -> Vec<Diagnostic> {
    let mut value = value;
    coerce(schema, &mut value);
    validate(schema, &value)
}

#[async_trait::async_trait]
impl ProviderService for DigitalOceanProvider {
    fn schema(&self) -> ProviderSchema {
        self.registry
            .provider_schema()
            .with_provider_config(ProviderConfig::schema())
    }

    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(check(&ProviderConfig::schema(), config))
    }

    #[instrument(name = "lifecycle.configure", skip_all)]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = check(&ProviderConfig::schema(), config.clone());
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(diagnostics);
        }
        let config = match ProviderConfig::from_value(&config) {
            Ok(config) => config,
            Err(err) => return Ok(vec![err.to_diagnostic()]),
        };

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let client = Client::new(transport, config.token.clone());
        let endpoint = config.api_endpoint.to_string();

        if self.meta.set(ProviderMeta::new(client, config)).is_err() {
            warn!("configure called more than once, keeping the first configuration");
            return Ok(vec![Diagnostic::warning("Provider is already configured")
                .with_detail("The first configuration stays in effect for this process")]);
        }
        info!(endpoint = %endpoint, "provider configured");
        Ok(diagnostics)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        info!("stop requested, cancelling in-flight operations");
        self.cancel.cancel();
        Ok(())
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(check(&self.resource(resource_type)?.schema(), config))
    }

    #[instrument(name = "lifecycle.plan", skip_all, fields(resource_type = %resource_type))]
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        let schema = resource.schema();

        if proposed_state.is_null() {
            return plan_resource(&schema, prior_state.as_ref(), &Value::Null);
        }
        let proposed = prepare(&schema, proposed_state)?;
        let plan = plan_resource(&schema, prior_state.as_ref(), &proposed)?;

        if let Some(prior) = prior_state.filter(|p| !p.is_null()) {
            let planned = ResourceData::from_value(plan.planned_state.clone())?.with_prior(prior)?;
            resource.custom_diff(&planned)?;
        }
        debug!(changes = plan.changes.len(), requires_replace = plan.requires_replace, "planned");
        Ok(plan)
    }

    #[instrument(name = "lifecycle.create", skip_all, fields(resource_type = %resource_type, id))]
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        let meta = self.meta()?;
        let resource = self.resource(resource_type)?;
        let planned = prepare(&resource.schema(), planned_state)?;
        let mut data = ResourceData::from_value(planned)?;
        data.clear_id();

        let state = self.create_and_read(resource.as_ref(), meta, data).await?;
        info!("created");
        Ok(state)
    }

    #[instrument(name = "lifecycle.read", skip_all, fields(resource_type = %resource_type, id))]
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        let meta = self.meta()?;
        let resource = self.resource(resource_type)?;
        let mut data = ResourceData::from_value(current_state)?;
        if data.is_absent() {
            return Ok(Value::Null);
        }
        Span::current().record("id", data.id());

        resource
            .read(&self.op_context(resource.timeouts().read), meta, &mut data)
            .await?;
        Ok(data.into_value())
    }

    #[instrument(name = "lifecycle.update", skip_all, fields(resource_type = %resource_type, id))]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let meta = self.meta()?;
        let resource = self.resource(resource_type)?;
        let schema = resource.schema();
        let planned = prepare(&schema, planned_state)?;

        let mut data = ResourceData::from_value(planned.clone())?.with_prior(prior_state.clone())?;
        if data.is_absent() {
            if let Some(id) = prior_state.get(ID_KEY).and_then(Value::as_str) {
                data.set_id(id);
            }
        }
        Span::current().record("id", data.id());
        resource.custom_diff(&data)?;

        let replacing = replacing_changes(&schema, &prior_state, &planned);
        let timeouts = resource.timeouts();
        if !replacing.is_empty() {
            info!(attributes = ?replacing, "force-new change, replacing");
            let mut old = ResourceData::from_value(prior_state)?;
            resource
                .delete(&self.op_context(timeouts.delete), meta, &mut old)
                .await?;
            let mut fresh = ResourceData::from_value(without_computed(&schema, planned))?;
            fresh.clear_id();
            return self.create_and_read(resource.as_ref(), meta, fresh).await;
        }

        resource
            .update(&self.op_context(timeouts.update), meta, &mut data)
            .await?;
        resource
            .read(&self.op_context(timeouts.read), meta, &mut data)
            .await?;
        if data.is_absent() {
            return Err(ProviderError::NotFound(format!(
                "{} disappeared during update",
                resource_type
            )));
        }
        info!("updated");
        Ok(data.into_value())
    }

    #[instrument(name = "lifecycle.delete", skip_all, fields(resource_type = %resource_type, id))]
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let meta = self.meta()?;
        let resource = self.resource(resource_type)?;
        let mut data = ResourceData::from_value(current_state)?;
        if data.is_absent() {
            return Ok(());
        }
        Span::current().record("id", data.id());

        resource
            .delete(&self.op_context(resource.timeouts().delete), meta, &mut data)
            .await?;
        info!("deleted");
        Ok(())
    }

    #[instrument(name = "lifecycle.import", skip_all, fields(resource_type = %resource_type, id = %id))]
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let meta = self.meta()?;
        let resource = self.resource(resource_type)?;
        let mut data = resource.import_state(id)?;

        let read = resource
            .read(&self.op_context(resource.timeouts().read), meta, &mut data)
            .await;
        match read {
            Ok(()) if !data.is_absent() => {},
            Ok(()) => return Err(import_not_found(id)),
            Err(err) if err.is_not_found() => return Err(import_not_found(id)),
            Err(err) => return Err(err),
        }
        info!("imported");
        Ok(vec![ImportedResource::new(resource_type, data.into_value())])
    }

    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(check(&self.data_source(data_source_type)?.schema(), config))
    }

    #[instrument(name = "lifecycle.read_data_source", skip_all, fields(data_source_type = %data_source_type, id))]
    async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let meta = self.meta()?;
        let data_source = self.data_source(data_source_type)?;
        let config = prepare(&data_source.schema(), config)?;
        let mut data = ResourceData::from_value(config)?;

        data_source
            .read(&OpContext::with_cancel(&self.cancel), meta, &mut data)
            .await?;
        Span::current().record("id", data.id());
        Ok(Value::Object(data.attributes().clone()))
    }
}

fn import_not_found(id: &str) -> ProviderError {
    ProviderError::NotFound(format!(
        "Cannot import non-existent remote object ({}). Please verify the ID is correct",
        id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Method;
    use crate::testing::{assert_plan_no_changes, MockTransport, ProviderTester};
    use serde_json::json;

    fn vpc(name: &str) -> Value {
        json!({"vpc": {
            "id": "vpc-1",
            "urn": "do:vpc:vpc-1",
            "name": name,
            "region": "nyc3",
            "description": "",
            "ip_range": "10.10.10.0/24",
            "default": false,
            "created_at": "2024-01-01T00:00:00Z"
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

    #[tokio::test]
    async fn test_operations_require_configure() {
        let mock = MockTransport::new();
        let tester = ProviderTester::new(mock.provider().unwrap());
        let err = tester
            .read("digitalocean_vpc", json!({"id": "vpc-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_second_configure_warns() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let diagnostics = tester
            .provider()
            .configure(json!({"token": "another"}))
            .await
            .unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics[0].is_error());
    }

    #[tokio::test]
    async fn test_configure_reports_missing_token() {
        let mock = MockTransport::new();
        let provider = mock.provider().unwrap();
        let diagnostics = provider
            .configure(json!({"api_endpoint": "https://api.example.com"}))
            .await
            .unwrap();
        // The token may still come from the environment.
        if std::env::var("DIGITALOCEAN_TOKEN").is_err()
            && std::env::var("DIGITALOCEAN_ACCESS_TOKEN").is_err()
        {
            assert!(diagnostics.iter().any(Diagnostic::is_error));
        }
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let err = tester
            .plan_create("digitalocean_nope", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(_)));
    }

    #[tokio::test]
    async fn test_plan_aborts_on_validation_errors() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let err = tester
            .plan_create("digitalocean_vpc", json!({"region": "nyc3"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_read_gone_returns_null() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let state = tester
            .read("digitalocean_vpc", json!({"id": "vpc-1", "name": "net"}))
            .await
            .unwrap();
        assert_eq!(state, Value::Null);
    }

    #[tokio::test]
    async fn test_create_that_reads_absent_fails() {
        let mock = MockTransport::new().on(Method::Post, "/v2/vpcs", 201, vpc("net"));
        let tester = configured(&mock).await;
        let err = tester
            .create("digitalocean_vpc", json!({"name": "net", "region": "nyc3"}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_import_then_plan_is_empty() {
        let mock = MockTransport::new().on(Method::Get, "/v2/vpcs/vpc-1", 200, vpc("net"));
        let tester = configured(&mock).await;
        let (state, plan) = tester
            .lifecycle_import("digitalocean_vpc", "vpc-1")
            .await
            .unwrap();
        assert_eq!(state["name"], "net");
        assert_plan_no_changes(&plan);
    }

    #[tokio::test]
    async fn test_import_missing_object() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let err = tester
            .import_resource("digitalocean_vpc", "123abc")
            .await
            .unwrap_err();
        assert!(err.message().contains("Cannot import non-existent remote object"));
        assert!(err.message().contains("Please verify the ID is correct"));
    }

    #[tokio::test]
    async fn test_force_new_change_replaces() {
        let mock = MockTransport::new()
            .on(Method::Delete, "/v2/vpcs/vpc-1", 204, Value::Null)
            .on(Method::Post, "/v2/vpcs", 201, json!({"vpc": {"id": "vpc-2", "name": "net", "region": "sfo3"}}))
            .on(Method::Get, "/v2/vpcs/vpc-2", 200, json!({"vpc": {"id": "vpc-2", "name": "net", "region": "sfo3"}}));
        let tester = configured(&mock).await;
        let prior = vpc("net")["vpc"].clone();
        let mut planned = prior.clone();
        planned["region"] = json!("sfo3");

        let plan = tester
            .plan_update("digitalocean_vpc", prior.clone(), planned.clone())
            .await
            .unwrap();
        assert!(plan.requires_replace);

        let state = tester
            .update("digitalocean_vpc", prior, plan.planned_state)
            .await
            .unwrap();
        assert_eq!(state["id"], "vpc-2");
        assert_eq!(mock.count(Method::Delete, "/v2/vpcs/vpc-1"), 1);
        assert_eq!(mock.count(Method::Post, "/v2/vpcs"), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_operations() {
        let mock = MockTransport::new().on(Method::Get, "/v2/vpcs/vpc-1", 200, vpc("net"));
        let tester = configured(&mock).await;
        tester.stop().await.unwrap();
        let err = tester
            .read("digitalocean_vpc", json!({"id": "vpc-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled(_)));
    }
}
