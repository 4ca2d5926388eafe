//! Testing utilities for the provider.
//!
//! [`MockTransport`] stands in for the DigitalOcean API: responses are
//! scripted per `(method, path)` route, every request is recorded, and
//! unscripted routes answer with the API's 404 document. [`ProviderTester`]
//! drives any [`ProviderService`] through plan/create/read/update/delete/import
//! without a host runtime.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_digitalocean::client::Method;
//! use hemmer_provider_digitalocean::testing::{MockTransport, ProviderTester};
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create_vpc() {
//!     let mock = MockTransport::new()
//!         .on(Method::Post, "/v2/vpcs", 201, json!({"vpc": {"id": "v1", "name": "net", "region": "nyc3"}}))
//!         .on(Method::Get, "/v2/vpcs/v1", 200, json!({"vpc": {"id": "v1", "name": "net", "region": "nyc3"}}));
//!     let tester = ProviderTester::new(mock.provider().unwrap());
//!     tester.configure(json!({"token": MockTransport::TOKEN})).await.unwrap();
//!
//!     let state = tester.create("digitalocean_vpc", json!({"name": "net", "region": "nyc3"})).await.unwrap();
//!     assert_eq!(state["id"], "v1");
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::{ApiRequest, ApiResponse, Client, Method, Transport};
use crate::error::ProviderError;
use crate::provider::DigitalOceanProvider;
use crate::schema::{Diagnostic, DiagnosticSeverity, ProviderSchema};
use crate::service::ProviderService;
use crate::types::{ImportedResource, PlanResult, Sensitive};

// =========================================================================
// Mock transport
// =========================================================================

#[derive(Default)]
struct MockState {
    routes: HashMap<(Method, String), VecDeque<ApiResponse>>,
    requests: Vec<ApiRequest>,
}

/// A scripted stand-in for the DigitalOcean API.
///
/// Each route holds a queue of responses; the last response of a queue is
/// sticky and answers every further request. Clones share the same script
/// and request log.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockTransport")
            .field("routes", &state.routes.len())
            .field("requests", &state.requests.len())
            .finish()
    }
}

impl MockTransport {
    /// Token configured by [`MockTransport::client`].
    pub const TOKEN: &'static str = "test-token";

    /// An empty script.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a response for `method path` (path without query string).
    pub fn on(self, method: Method, path: &str, status: u16, body: Value) -> Self {
        self.push(method, path, ApiResponse::new(status, body));
        self
    }

    /// Queue a fully built response.
    pub fn on_response(self, method: Method, path: &str, response: ApiResponse) -> Self {
        self.push(method, path, response);
        self
    }

    /// Queue a response on a shared handle.
    pub fn push(&self, method: Method, path: &str, response: ApiResponse) {
        self.lock()
            .routes
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Replace a route's script with a single response.
    pub fn replace(&self, method: Method, path: &str, status: u16, body: Value) {
        let mut state = self.lock();
        let queue = state.routes.entry((method, path.to_string())).or_default();
        queue.clear();
        queue.push_back(ApiResponse::new(status, body));
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.lock().requests.clone()
    }

    /// Requests received for one route.
    pub fn requests_to(&self, method: Method, path: &str) -> Vec<ApiRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method == method && route_path(&r.path) == path)
            .cloned()
            .collect()
    }

    /// Number of requests received for one route.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.requests_to(method, path).len()
    }

    /// A client over this transport authenticated with [`MockTransport::TOKEN`].
    pub fn client(&self) -> Client {
        Client::new(
            Arc::new(self.clone()),
            Sensitive::new(Self::TOKEN.to_string()),
        )
    }

    /// An unconfigured provider whose `configure` installs this transport.
    pub fn provider(&self) -> Result<DigitalOceanProvider, ProviderError> {
        DigitalOceanProvider::with_transport(Arc::new(self.clone()))
    }
}

fn route_path(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// The API's answer for an unknown object.
pub fn not_found_body() -> Value {
    json!({
        "id": "not_found",
        "message": "The resource you were accessing could not be found."
    })
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ProviderError> {
        let mut state = self.lock();
        let key = (request.method, route_path(&request.path).to_string());
        state.requests.push(request);
        let response = match state.routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| ApiResponse::new(404, not_found_body())))
    }
}

// =========================================================================
// Provider tester
// =========================================================================

/// A test harness for provider implementations.
///
/// Wraps a `ProviderService` and exposes simplified methods for tests.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Get a reference to the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    // =========================================================================
    // Schema & Metadata
    // =========================================================================

    /// Get the provider's schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Get the list of resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    /// Get the list of data source type names.
    pub fn data_source_types(&self) -> Vec<String> {
        self.provider.metadata().data_sources
    }

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Validate provider configuration.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.validate_provider_config(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Configure the provider.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Stop the provider.
    pub async fn stop(&self) -> Result<(), ProviderError> {
        self.provider.stop().await
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate a resource configuration.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .provider
            .validate_resource_config(resource_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Plan a resource creation (no prior state).
    pub async fn plan_create(
        &self,
        resource_type: &str,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed_state.clone(), proposed_state)
            .await
    }

    /// Plan a resource update.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(
                resource_type,
                Some(prior_state),
                proposed_state.clone(),
                proposed_state,
            )
            .await
    }

    /// Plan a resource deletion.
    pub async fn plan_delete(
        &self,
        resource_type: &str,
        prior_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior_state), Value::Null, Value::Null)
            .await
    }

    /// Create a new resource.
    pub async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned_state).await
    }

    /// Read the current state of a resource.
    pub async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, current_state).await
    }

    /// Update an existing resource.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    /// Delete a resource.
    pub async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current_state).await
    }

    /// Import an existing resource.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    // =========================================================================
    // Data Source Operations
    // =========================================================================

    /// Validate a data source configuration.
    pub async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .provider
            .validate_data_source_config(data_source_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Read data from a data source.
    pub async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .read_data_source(data_source_type, config)
            .await
    }

    // =========================================================================
    // Lifecycle Helpers
    // =========================================================================

    /// Run a full create lifecycle: plan → create → read.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan_result = self.plan_create(resource_type, config).await?;
        let created_state = self
            .create(resource_type, plan_result.planned_state)
            .await?;
        self.read(resource_type, created_state).await
    }

    /// Run a full update lifecycle: plan → update → read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan_result = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;
        let updated_state = self
            .update(resource_type, prior_state, plan_result.planned_state)
            .await?;
        self.read(resource_type, updated_state).await
    }

    /// Run a full delete lifecycle: plan → delete.
    pub async fn lifecycle_delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.plan_delete(resource_type, current_state.clone())
            .await?;
        self.delete(resource_type, current_state).await
    }

    /// Import then plan the imported state against itself.
    ///
    /// Returns the imported state and the follow-up plan, which must be empty
    /// for a well-behaved resource.
    pub async fn lifecycle_import(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<(Value, PlanResult), ProviderError> {
        let imported = self.import_resource(resource_type, id).await?;
        let state = imported
            .into_iter()
            .next()
            .map(|r| r.state)
            .ok_or_else(|| ProviderError::NotFound(format!("nothing imported for {}", id)))?;
        let state = self.read(resource_type, state).await?;
        let plan = self
            .plan_update(resource_type, state.clone(), state.clone())
            .await?;
        Ok((state, plan))
    }
}

/// Error type for test operations that may fail with diagnostics.
#[derive(Debug)]
pub enum TestError {
    /// The operation failed with diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a provider error.
    Provider(ProviderError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  [{:?}] {}", diag.severity, diag.summary)?;
                    if let Some(detail) = &diag.detail {
                        write!(f, ": {}", detail)?;
                    }
                    if let Some(attr) = &diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            },
            TestError::Provider(e) => write!(f, "Provider error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Provider(e)
    }
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics
        .into_iter()
        .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a plan result indicates no changes.
///
/// # Panics
///
/// Panics if the plan has any changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "Expected no changes, but got {} change(s): {:?}",
        plan.changes.len(),
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that a plan requires resource replacement.
///
/// # Panics
///
/// Panics if the plan does not require replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "Expected plan to require replacement, but it does not"
    );
}

/// Assert that a plan does not require resource replacement.
///
/// # Panics
///
/// Panics if the plan requires replacement.
pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(
        !plan.requires_replace,
        "Expected plan to update in place, but it requires replacement"
    );
}

/// Assert that a plan has a change for a specific attribute path.
///
/// # Panics
///
/// Panics if the plan does not have a change for the given path.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    let has_change = plan.changes.iter().any(|c| c.path == path);
    assert!(
        has_change,
        "Expected plan to change attribute '{}', but it was not changed. Changed attributes: {:?}",
        path,
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that no change in the plan exposes `secret`.
///
/// # Panics
///
/// Panics if any before/after value of any change contains `secret`.
pub fn assert_plan_redacts(plan: &PlanResult, secret: &str) {
    for change in &plan.changes {
        for value in [&change.before, &change.after].into_iter().flatten() {
            assert!(
                !value.to_string().contains(secret),
                "Expected plan to redact '{}', but attribute '{}' exposes it",
                secret,
                change.path
            );
        }
    }
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
        .collect();

    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain an error with the given summary substring.
///
/// # Panics
///
/// Panics if no error diagnostic contains the given substring.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    let has_matching_error = diagnostics
        .iter()
        .any(|d| matches!(d.severity, DiagnosticSeverity::Error) && d.summary.contains(substring));

    assert!(
        has_matching_error,
        "Expected an error containing '{}', but no matching error found. Errors: {:?}",
        substring,
        diagnostics
            .iter()
            .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
            .map(|d| &d.summary)
            .collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OpContext;
    use crate::types::AttributeChange;

    fn vpc_body(name: &str) -> Value {
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
    async fn test_mock_queue_last_response_is_sticky() {
        let mock = MockTransport::new()
            .on(Method::Get, "/v2/nfs/s1", 200, json!({"n": 1}))
            .on(Method::Get, "/v2/nfs/s1", 200, json!({"n": 2}));
        let client = mock.client();
        let ctx = OpContext::new();
        for expected in [1, 2, 2, 2] {
            let body = client.get(&ctx, "/v2/nfs/s1", &[("region", "atl1")]).await.unwrap();
            assert_eq!(body["n"], expected);
        }
        assert_eq!(mock.count(Method::Get, "/v2/nfs/s1"), 4);
        assert_eq!(
            mock.requests_to(Method::Get, "/v2/nfs/s1")[0].query_param("region"),
            Some("atl1")
        );
    }

    #[tokio::test]
    async fn test_mock_unscripted_route_is_not_found() {
        let mock = MockTransport::new();
        let err = mock
            .client()
            .get(&OpContext::new(), "/v2/anything", &[])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_tester_resource_types() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let types = tester.resource_types();
        assert!(types.contains(&"digitalocean_vpc".to_string()));
        assert!(tester
            .data_source_types()
            .contains(&"digitalocean_nfs".to_string()));
        assert!(tester.schema().resources.contains_key("digitalocean_nfs"));

        let metadata = tester.provider().metadata();
        assert_eq!(metadata.resources.len(), 16);
        assert_eq!(metadata.data_sources.len(), 13);
        assert!(metadata.capabilities.plan_destroy);
    }

    #[tokio::test]
    async fn test_tester_lifecycle_create_and_delete() {
        let mock = MockTransport::new()
            .on(Method::Post, "/v2/vpcs", 201, vpc_body("net"))
            .on(Method::Get, "/v2/vpcs/vpc-1", 200, vpc_body("net"))
            .on(Method::Delete, "/v2/vpcs/vpc-1", 204, Value::Null);
        let tester = configured(&mock).await;

        let state = tester
            .lifecycle_create("digitalocean_vpc", json!({"name": "net", "region": "nyc3"}))
            .await
            .unwrap();
        assert_eq!(state["id"], "vpc-1");
        assert_eq!(state["ip_range"], "10.10.10.0/24");

        tester
            .lifecycle_delete("digitalocean_vpc", state)
            .await
            .unwrap();
        assert_eq!(mock.count(Method::Delete, "/v2/vpcs/vpc-1"), 1);
    }

    #[tokio::test]
    async fn test_tester_plan_update_in_place() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let prior = vpc_body("old")["vpc"].clone();
        let mut proposed = prior.clone();
        proposed["name"] = json!("new");

        let plan = tester
            .plan_update("digitalocean_vpc", prior, proposed)
            .await
            .unwrap();
        assert_plan_changes_attribute(&plan, "name");
        assert_plan_updates_in_place(&plan);
    }

    #[tokio::test]
    async fn test_tester_validate_resource_config() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let err = tester
            .validate_resource_config("digitalocean_vpc", json!({"region": "nyc3"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Diagnostics(_)));
    }

    #[test]
    fn test_assert_no_errors() {
        let diagnostics = vec![Diagnostic::warning("Just a warning")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    #[should_panic(expected = "Expected no errors")]
    fn test_assert_no_errors_fails() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    fn test_assert_error_contains() {
        let diagnostics = vec![Diagnostic::error("Invalid configuration value")];
        assert_error_contains(&diagnostics, "Invalid");
        assert_error_contains(&diagnostics, "configuration");
    }

    #[test]
    #[should_panic(expected = "Expected plan to redact")]
    fn test_assert_plan_redacts_fails_on_leak() {
        let plan = PlanResult::with_changes(
            Value::Null,
            vec![AttributeChange::added("api_key", json!("sk-live"))],
            false,
        );
        assert_plan_redacts(&plan, "sk-live");
    }

    #[test]
    fn test_test_error_display() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("First error").with_attribute("field1"),
            Diagnostic::error("Second error").with_detail("More info"),
        ]);

        let display = format!("{}", err);
        assert!(display.contains("First error"));
        assert!(display.contains("Second error"));
        assert!(display.contains("field1"));
        assert!(display.contains("More info"));
    }
}
