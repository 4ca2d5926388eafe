//! Hemmer DigitalOcean Provider
//!
//! This crate exposes DigitalOcean cloud resources (NFS shares and snapshots,
//! VPC NAT gateways, BYOIP prefixes, Droplet autoscale pools, container
//! registries and Docker credentials, partner interconnect attachments, VPCs,
//! uptime checks, and GradientAI agents, keys and routes) as declarative
//! resources and data sources for the Hemmer host runtime.
//!
//! # Overview
//!
//! - **Schema types**: typed attribute declarations with validators and defaults
//! - **Lifecycle engine**: create/read/update/delete/import per resource, behind
//!   the [`ProviderService`] trait the host drives
//! - **Waiter**: poll-until-target for asynchronously provisioned objects
//! - **Retry coordinator**: retryable vs terminal failures under a deadline
//! - **Attachment protocol**: detach-then-attach for NFS shares moving between VPCs
//! - **Credential lifecycle**: Docker credential issue, refresh and revoke
//! - **Data-source lookup**: paginated list plus by-name / regex / most-recent selection
//! - **Logging**: integration with `tracing`, written to stderr
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_provider_digitalocean::{init_logging, DigitalOceanProvider, ProviderService};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     let provider = DigitalOceanProvider::new()?;
//!     provider.configure(json!({"token": "dop_v1_..."})).await?;
//!
//!     let state = provider
//!         .create(
//!             "digitalocean_nfs",
//!             json!({"name": "share", "region": "atl1", "size": 50, "vpc_id": "..."}),
//!         )
//!         .await?;
//!     println!("{}", state["host"]);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attachment;
pub mod client;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod lookup;
pub mod mapping;
pub mod pagination;
pub mod plan;
pub mod provider;
pub mod registry;
pub mod resource;
pub mod resources;
pub mod retry;
pub mod schema;
pub mod service;
pub mod state;
pub mod testing;
pub mod types;
pub mod validation;
pub mod waiter;

// Re-export main types at crate root
pub use client::{Client, HttpTransport, Method, Transport};
pub use config::ProviderConfig;
pub use context::OpContext;
pub use error::{ApiError, ProviderError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::{DigitalOceanProvider, ProviderMeta};
pub use registry::ResourceRegistry;
pub use resource::{DataSource, Resource, Timeouts};
pub use schema::ProviderSchema;
pub use service::ProviderService;
pub use state::ResourceData;
pub use types::{
    AttributeChange, ImportedResource, PlanResult, ProviderMetadata, Sensitive,
    ServerCapabilities,
};
pub use validation::{is_valid, validate, validate_result};
pub use waiter::{StateChangeConf, WaitError};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tracing;
