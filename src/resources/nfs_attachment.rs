//! NFS share ↔ VPC attachments.
//!
//! The resource drives [`attach_to`]/[`detach_from`] over the share's action
//! endpoint. Its identifier is `<share_id>:<vpc_id>`.

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::attachment::{attach_to, detach_from, AttachmentBackend, AttachmentTimings, Binding};
use crate::client::Client;
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::mapping::normalize_region;
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, parse_compound_id, Resource};
use crate::resources::nfs::{get_share, list_shares, share_action};
use crate::schema::{Attribute, Schema, Validator};
use crate::state::ResourceData;

/// One share seen through the API.
struct ShareBackend<'a> {
    client: &'a Client,
    share_id: &'a str,
    region: &'a str,
}

#[async_trait]
impl AttachmentBackend for ShareBackend<'_> {
    async fn current(&self, ctx: &OpContext) -> Result<Option<Binding>, ProviderError> {
        match get_share(ctx, self.client, self.share_id, self.region).await {
            Ok(share) => Ok(Some(Binding {
                status: share.status,
                vpc_ids: share.vpc_ids,
            })),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn occupant(&self, ctx: &OpContext, vpc_id: &str) -> Result<Option<String>, ProviderError> {
        let shares = list_shares(ctx, self.client, self.region).await?;
        Ok(shares
            .into_iter()
            .find(|s| s.id != self.share_id && s.vpc_ids.iter().any(|v| v == vpc_id))
            .map(|s| s.id))
    }

    async fn attach(&self, ctx: &OpContext, vpc_id: &str) -> Result<(), ProviderError> {
        share_action(ctx, self.client, self.share_id, self.region, "attach", json!({"vpc_id": vpc_id}))
            .await
            .map(|_| ())
    }

    async fn detach(&self, ctx: &OpContext, vpc_id: &str) -> Result<(), ProviderError> {
        share_action(ctx, self.client, self.share_id, self.region, "detach", json!({"vpc_id": vpc_id}))
            .await
            .map(|_| ())
    }
}

fn attachment_id(share_id: &str, vpc_id: &str) -> String {
    format!("{}:{}", share_id, vpc_id)
}

struct Target {
    share_id: String,
    vpc_id: String,
    region: String,
}

impl Target {
    fn from_data(data: &ResourceData) -> Result<Self, ProviderError> {
        Ok(Self {
            share_id: data.require_str("share_id")?.to_string(),
            vpc_id: data.require_str("vpc_id")?.to_string(),
            region: normalize_region(data.require_str("region")?),
        })
    }

    fn backend<'a>(&'a self, client: &'a Client) -> ShareBackend<'a> {
        ShareBackend {
            client,
            share_id: &self.share_id,
            region: &self.region,
        }
    }
}

/// `digitalocean_nfs_attachment`
#[derive(Debug, Clone, Copy, Default)]
pub struct NfsAttachmentResource;

#[async_trait]
impl Resource for NfsAttachmentResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("Binds an NFS share to a VPC.")
            .with_attribute(
                "share_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "vpc_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute("region", Attribute::required_string().with_force_new())
    }

    fn import_state(&self, id: &str) -> Result<ResourceData, ProviderError> {
        let fields = parse_compound_id(id, 3, "<share_id>,<vpc_id>,<region>")?;
        let mut data = ResourceData::with_id(attachment_id(&fields[0], &fields[1]));
        data.set("share_id", fields[0].as_str());
        data.set("vpc_id", fields[1].as_str());
        data.set("region", normalize_region(&fields[2]));
        Ok(data)
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let target = Target::from_data(data)?;
        attach_to(
            ctx,
            &target.backend(&meta.client),
            &target.vpc_id,
            &AttachmentTimings::default(),
        )
        .await?;
        data.set("region", target.region.as_str());
        data.set_id(attachment_id(&target.share_id, &target.vpc_id));
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let target = Target::from_data(data)?;
        let share = match get_share(ctx, &meta.client, &target.share_id, &target.region).await {
            Ok(share) => share,
            Err(err) => return clear_if_not_found(err, "NFS share", data),
        };
        if share.vpc_ids.first() != Some(&target.vpc_id) {
            warn!(
                share_id = %target.share_id,
                vpc_id = %target.vpc_id,
                current = ?share.vpc_ids.first(),
                "share no longer attached to this VPC, removing attachment from state"
            );
            data.clear_id();
        }
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let target = Target::from_data(data)?;
        detach_from(
            ctx,
            &target.backend(&meta.client),
            &target.vpc_id,
            &AttachmentTimings::default(),
        )
        .await?;
        data.clear_id();
        Ok(())
    }
}
