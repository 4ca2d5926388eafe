//! Docker credentials for the account's container registry.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::context::OpContext;
use crate::credentials::{issue, refresh_if_expired, revoke, DockerCredential, MAX_EXPIRY_SECONDS};
use crate::error::ProviderError;
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, Resource};
use crate::resources::container_registry::get_registry;
use crate::schema::{Attribute, Schema, Validator};
use crate::state::ResourceData;

#[derive(Debug, Clone, Copy)]
struct Scope {
    write: bool,
    expiry_seconds: i64,
}

impl Scope {
    fn from_data(data: &ResourceData) -> Self {
        Self {
            write: data.get_bool("write").unwrap_or(false),
            expiry_seconds: data.get_i64("expiry_seconds").unwrap_or(MAX_EXPIRY_SECONDS),
        }
    }
}

fn store(data: &mut ResourceData, credential: &DockerCredential) {
    data.set("docker_credentials", credential.docker_config.expose().as_str());
    data.set("credential_expiration_time", credential.expiration_time());
}

/// `digitalocean_container_registry_docker_credentials`
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerCredentialsResource;

#[async_trait]
impl Resource for DockerCredentialsResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A Docker config.json granting access to the container registry.")
            .with_attribute(
                "registry_name",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute("write", Attribute::optional_bool().with_default(json!(false)))
            .with_attribute(
                "expiry_seconds",
                Attribute::optional_int64()
                    .with_default(json!(MAX_EXPIRY_SECONDS))
                    .with_validator(Validator::int_between(0, MAX_EXPIRY_SECONDS)),
            )
            .with_attribute("docker_credentials", Attribute::computed_string().sensitive())
            .with_attribute("credential_expiration_time", Attribute::computed_string())
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let registry_name = data.require_str("registry_name")?.to_string();
        let scope = Scope::from_data(data);
        let credential = issue(ctx, &meta.client, scope.write, scope.expiry_seconds, Utc::now()).await?;
        info!(registry = %registry_name, expires = %credential.expiration_time(), "issued docker credentials");
        store(data, &credential);
        data.set_id(registry_name);
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
            warn!(id = data.id(), "registry no longer exists, removing docker credentials from state");
            data.clear_id();
            return Ok(());
        }
        data.set("registry_name", registry.name.as_str());

        let scope = Scope::from_data(data);
        let stored = data.get_str("credential_expiration_time").map(str::to_string);
        let refreshed = refresh_if_expired(
            ctx,
            &meta.client,
            scope.write,
            scope.expiry_seconds,
            stored.as_deref(),
            Utc::now(),
        )
        .await?;
        if let Some(credential) = refreshed {
            store(data, &credential);
        }
        Ok(())
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_changes(&["write", "expiry_seconds"]) {
            return Ok(());
        }
        let scope = Scope::from_data(data);
        let credential = issue(ctx, &meta.client, scope.write, scope.expiry_seconds, Utc::now()).await?;
        store(data, &credential);
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if let Some(docker_config) = data.get_str("docker_credentials").filter(|s| !s.is_empty()) {
            revoke(ctx, &meta.client, docker_config).await?;
        }
        data.clear_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Method;
    use crate::credentials::{DOCKER_CREDENTIALS_PATH, OAUTH_REVOKE_URL};
    use crate::lookup::parse_timestamp;
    use crate::resources::container_registry::REGISTRY_PATH;
    use crate::testing::{assert_plan_redacts, not_found_body, MockTransport, ProviderTester};
    use crate::DigitalOceanProvider;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use chrono::Duration;
    use serde_json::Value;

    fn docker_config(token: &str) -> Value {
        let auth = STANDARD.encode(format!("{}:{}", token, token));
        json!({"auths": {"registry.digitalocean.com": {"auth": auth}}})
    }

    async fn configured(mock: &MockTransport) -> ProviderTester<DigitalOceanProvider> {
        let tester = ProviderTester::new(mock.provider().unwrap());
        tester
            .configure(json!({"token": MockTransport::TOKEN}))
            .await
            .unwrap();
        tester
    }

    fn registry() -> Value {
        json!({"registry": {"name": "shop", "region": "fra1"}})
    }

    #[tokio::test]
    async fn test_expired_credential_is_reissued_on_read() {
        let mock = MockTransport::new()
            .on(Method::Get, DOCKER_CREDENTIALS_PATH, 200, docker_config("first"))
            .on(Method::Get, DOCKER_CREDENTIALS_PATH, 200, docker_config("second"))
            .on(Method::Get, REGISTRY_PATH, 200, registry());
        let tester = configured(&mock).await;

        let before = Utc::now();
        let state = tester
            .create(
                "digitalocean_container_registry_docker_credentials",
                json!({"registry_name": "shop", "expiry_seconds": 3600}),
            )
            .await
            .unwrap();
        let expires = parse_timestamp(state["credential_expiration_time"].as_str()).unwrap();
        assert!(expires >= before + Duration::seconds(3599));
        assert!(expires <= Utc::now() + Duration::seconds(3600));
        assert!(state["docker_credentials"].as_str().unwrap().contains("auths"));
        assert_eq!(mock.count(Method::Get, DOCKER_CREDENTIALS_PATH), 1);

        // Pretend 3601 seconds went by.
        let mut stale = state.clone();
        let lapsed = Utc::now() - Duration::seconds(1);
        stale["credential_expiration_time"] = json!(lapsed.to_rfc3339());
        let refreshed = tester
            .read("digitalocean_container_registry_docker_credentials", stale)
            .await
            .unwrap();
        assert_eq!(mock.count(Method::Get, DOCKER_CREDENTIALS_PATH), 2);
        assert_ne!(refreshed["docker_credentials"], state["docker_credentials"]);
        let bumped = parse_timestamp(refreshed["credential_expiration_time"].as_str()).unwrap();
        assert!(bumped > Utc::now());
    }

    #[tokio::test]
    async fn test_deleted_registry_drops_credentials() {
        let mock = MockTransport::new().on(Method::Get, REGISTRY_PATH, 404, not_found_body());
        let tester = configured(&mock).await;
        let state = json!({
            "id": "shop",
            "registry_name": "shop",
            "docker_credentials": docker_config("tok").to_string(),
            "credential_expiration_time": "2999-01-01T00:00:00Z"
        });

        let state = tester
            .read("digitalocean_container_registry_docker_credentials", state)
            .await
            .unwrap();
        assert_eq!(state, Value::Null);
        assert_eq!(mock.count(Method::Get, DOCKER_CREDENTIALS_PATH), 0);
    }

    #[tokio::test]
    async fn test_scope_change_reissues_and_stays_redacted() {
        let mock = MockTransport::new()
            .on(Method::Get, DOCKER_CREDENTIALS_PATH, 200, docker_config("rw"))
            .on(Method::Get, REGISTRY_PATH, 200, registry());
        let tester = configured(&mock).await;
        let secret = docker_config("ro").to_string();
        let prior = json!({
            "id": "shop",
            "registry_name": "shop",
            "write": false,
            "expiry_seconds": 3600,
            "docker_credentials": secret,
            "credential_expiration_time": "2999-01-01T00:00:00Z"
        });
        let mut planned = prior.clone();
        planned["write"] = json!(true);

        let plan = tester
            .plan_update("digitalocean_container_registry_docker_credentials", prior.clone(), planned)
            .await
            .unwrap();
        assert_plan_redacts(&plan, &secret);

        let state = tester
            .update(
                "digitalocean_container_registry_docker_credentials",
                prior,
                plan.planned_state,
            )
            .await
            .unwrap();
        assert_ne!(state["docker_credentials"].as_str(), Some(secret.as_str()));
        let request = &mock.requests_to(Method::Get, DOCKER_CREDENTIALS_PATH)[0];
        assert_eq!(request.query_param("read_write"), Some("true"));
    }

    #[tokio::test]
    async fn test_delete_revokes_token() {
        let mock = MockTransport::new().on(Method::Post, OAUTH_REVOKE_URL, 200, json!({}));
        let tester = configured(&mock).await;

        tester
            .delete(
                "digitalocean_container_registry_docker_credentials",
                json!({"id": "shop", "registry_name": "shop", "docker_credentials": docker_config("tok").to_string()}),
            )
            .await
            .unwrap();
        assert_eq!(mock.count(Method::Post, OAUTH_REVOKE_URL), 1);

        let err = tester
            .delete(
                "digitalocean_container_registry_docker_credentials",
                json!({"id": "shop", "registry_name": "shop", "docker_credentials": "{}"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.message(), "unable to find OAuth token");
    }
}
