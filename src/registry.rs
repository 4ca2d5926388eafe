//! Name → definition table for resources and data sources.
//!
//! Populated once while the provider is built; afterwards it is only read,
//! so lookups from concurrently running operations need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::resource::{DataSource, Resource};
use crate::schema::{ProviderSchema, Schema};

/// Registered resources and data sources.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<dyn Resource>>,
    data_sources: HashMap<String, Arc<dyn DataSource>>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resources", &self.resource_names())
            .field("data_sources", &self.data_source_names())
            .finish()
    }
}

fn check_schema(name: &str, schema: &Schema) -> Result<(), ProviderError> {
    schema.internal_validate().map_err(|problems| {
        ProviderError::Sdk(format!("invalid schema for {}: {}", name, problems.join("; ")))
    })
}

impl ResourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a resource. Fails if the name is taken or the schema is
    /// inconsistent.
    pub fn register_resource(
        &mut self,
        name: &str,
        resource: impl Resource + 'static,
    ) -> Result<(), ProviderError> {
        if self.resources.contains_key(name) {
            return Err(ProviderError::AlreadyExists(format!(
                "resource {} is already registered",
                name
            )));
        }
        check_schema(name, &resource.schema())?;
        self.resources.insert(name.to_string(), Arc::new(resource));
        Ok(())
    }

    /// Bind `name` to a data source.
    pub fn register_data_source(
        &mut self,
        name: &str,
        data_source: impl DataSource + 'static,
    ) -> Result<(), ProviderError> {
        if self.data_sources.contains_key(name) {
            return Err(ProviderError::AlreadyExists(format!(
                "data source {} is already registered",
                name
            )));
        }
        check_schema(name, &data_source.schema())?;
        self.data_sources
            .insert(name.to_string(), Arc::new(data_source));
        Ok(())
    }

    /// Look up a resource.
    pub fn resource(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.resources.get(name).cloned()
    }

    /// Look up a data source.
    pub fn data_source(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.data_sources.get(name).cloned()
    }

    /// Sorted resource names.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted data source names.
    pub fn data_source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.data_sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas of everything registered.
    pub fn provider_schema(&self) -> ProviderSchema {
        let schema = self
            .resources
            .iter()
            .fold(ProviderSchema::new(), |acc, (name, r)| acc.with_resource(name.clone(), r.schema()));
        self.data_sources
            .iter()
            .fold(schema, |acc, (name, d)| acc.with_data_source(name.clone(), d.schema()))
    }
}
