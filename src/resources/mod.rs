//! DigitalOcean products, one module per API family.
//!
//! Every module exposes unit structs implementing [`Resource`](crate::resource::Resource)
//! or [`DataSource`](crate::resource::DataSource); [`registry`] binds them to
//! their type names.

use crate::error::ProviderError;
use crate::registry::ResourceRegistry;
use crate::state::ResourceData;

pub mod autoscale;
pub mod byoip;
pub mod container_registry;
pub mod docker_credentials;
pub mod genai_agent;
pub mod genai_keys;
pub mod genai_route;
pub mod nat_gateway;
pub mod nfs;
pub mod nfs_attachment;
pub mod nfs_snapshot;
pub mod partner_attachment;
pub mod uptime;
pub mod vpc;

/// Build the registry of every resource and data source this provider serves.
pub fn registry() -> Result<ResourceRegistry, ProviderError> {
    let mut registry = ResourceRegistry::new();

    registry.register_resource("digitalocean_nfs", nfs::NfsResource)?;
    registry.register_resource("digitalocean_nfs_attachment", nfs_attachment::NfsAttachmentResource)?;
    registry.register_resource("digitalocean_nfs_snapshot", nfs_snapshot::NfsSnapshotResource)?;
    registry.register_resource("digitalocean_vpc_nat_gateway", nat_gateway::NatGatewayResource)?;
    registry.register_resource("digitalocean_byoip_prefix", byoip::ByoipPrefixResource)?;
    registry.register_resource("digitalocean_droplet_autoscale", autoscale::AutoscaleResource)?;
    registry.register_resource(
        "digitalocean_container_registry",
        container_registry::ContainerRegistryResource,
    )?;
    registry.register_resource(
        "digitalocean_container_registry_docker_credentials",
        docker_credentials::DockerCredentialsResource,
    )?;
    registry.register_resource(
        "digitalocean_partner_attachment",
        partner_attachment::PartnerAttachmentResource,
    )?;
    registry.register_resource("digitalocean_vpc", vpc::VpcResource)?;
    registry.register_resource("digitalocean_uptime_check", uptime::UptimeCheckResource)?;
    registry.register_resource("digitalocean_uptime_alert", uptime::UptimeAlertResource)?;
    registry.register_resource("digitalocean_genai_agent", genai_agent::AgentResource)?;
    registry.register_resource("digitalocean_genai_agent_api_key", genai_keys::AgentApiKeyResource)?;
    registry.register_resource("digitalocean_genai_agent_route", genai_route::AgentRouteResource)?;
    registry.register_resource("digitalocean_genai_openai_api_key", genai_keys::OpenAiKeyResource)?;

    registry.register_data_source("digitalocean_nfs", nfs::NfsDataSource)?;
    registry.register_data_source("digitalocean_nfs_snapshot", nfs_snapshot::NfsSnapshotDataSource)?;
    registry.register_data_source("digitalocean_vpc_nat_gateway", nat_gateway::NatGatewayDataSource)?;
    registry.register_data_source("digitalocean_byoip_prefix", byoip::ByoipPrefixDataSource)?;
    registry.register_data_source(
        "digitalocean_byoip_prefix_resources",
        byoip::ByoipPrefixResourcesDataSource,
    )?;
    registry.register_data_source("digitalocean_droplet_autoscale", autoscale::AutoscaleDataSource)?;
    registry.register_data_source(
        "digitalocean_container_registry",
        container_registry::ContainerRegistryDataSource,
    )?;
    registry.register_data_source(
        "digitalocean_partner_attachment",
        partner_attachment::PartnerAttachmentDataSource,
    )?;
    registry.register_data_source(
        "digitalocean_partner_attachment_service_key",
        partner_attachment::ServiceKeyDataSource,
    )?;
    registry.register_data_source("digitalocean_vpc", vpc::VpcDataSource)?;
    registry.register_data_source("digitalocean_genai_agent", genai_agent::AgentDataSource)?;
    registry.register_data_source("digitalocean_genai_agents", genai_agent::AgentsDataSource)?;
    registry.register_data_source(
        "digitalocean_genai_openai_api_key",
        genai_keys::OpenAiKeyDataSource,
    )?;

    Ok(registry)
}

/// Store a string the API reports as `""` when unset.
///
/// An empty value removes the attribute unless the configuration spelled out
/// `""` itself, so an unset optional attribute does not drift to `""`.
pub(crate) fn set_optional_str(data: &mut ResourceData, key: &str, value: &str) {
    if !value.is_empty() {
        data.set(key, value);
    } else if data.get_str(key) != Some("") {
        data.remove(key);
    }
}

/// `?region=<slug>` query pairs for region-scoped endpoints.
pub(crate) fn region_query(region: &str) -> [(&'static str, &str); 1] {
    [("region", region)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_builds() {
        let registry = registry().unwrap();
        let resources = registry.resource_names();
        assert_eq!(resources.len(), 16);
        assert!(resources.contains(&"digitalocean_nfs_attachment".to_string()));
        assert!(resources.contains(&"digitalocean_genai_openai_api_key".to_string()));

        let data_sources = registry.data_source_names();
        assert_eq!(data_sources.len(), 13);
        assert!(data_sources.contains(&"digitalocean_byoip_prefix_resources".to_string()));
    }

    #[test]
    fn test_set_optional_str() {
        let mut data = ResourceData::from_value(json!({"id": "x", "description": ""})).unwrap();
        set_optional_str(&mut data, "description", "");
        assert_eq!(data.get_str("description"), Some(""));

        set_optional_str(&mut data, "tier", "");
        assert!(!data.is_set("tier"));

        set_optional_str(&mut data, "tier", "basic");
        assert_eq!(data.get_str("tier"), Some("basic"));
    }
}
