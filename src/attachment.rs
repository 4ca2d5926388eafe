//! Detach-then-attach protocol for moving an NFS share between VPCs.
//!
//! A share is bound to at most one VPC at a time, and a VPC hosts at most one
//! share. Moving a share detaches it from its current VPC, waits until it
//! reports `INACTIVE` with no VPCs, then attaches it to the target and waits
//! for `ACTIVE` on that VPC. The API side is abstracted behind
//! [`AttachmentBackend`] so the sequencing can be driven without HTTP.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::context::OpContext;
use crate::error::ProviderError;
use crate::retry::{classify, retry, Backoff, RetryError};
use crate::waiter::{wait_for_state, StateChangeConf, NOT_FOUND_STATE};

/// Share status while bound to a VPC.
pub const STATUS_ACTIVE: &str = "ACTIVE";

/// Share status while bound to nothing.
pub const STATUS_INACTIVE: &str = "INACTIVE";

const SETTLING: &str = "SETTLING";
const SETTLED: &str = "SETTLED";

/// Observed binding of a share.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Binding {
    /// Share status (`ACTIVE`, `INACTIVE`, ...).
    pub status: String,
    /// VPCs the share is attached to; at most one in practice.
    pub vpc_ids: Vec<String>,
}

impl Binding {
    /// The VPC the share is currently attached to.
    pub fn current_vpc(&self) -> Option<&str> {
        self.vpc_ids.first().map(String::as_str)
    }

    /// Attached and serving on `vpc_id`.
    pub fn is_attached_to(&self, vpc_id: &str) -> bool {
        self.status == STATUS_ACTIVE && self.current_vpc() == Some(vpc_id)
    }

    /// Fully detached.
    pub fn is_detached(&self) -> bool {
        self.status == STATUS_INACTIVE && self.vpc_ids.is_empty()
    }
}

/// Remote operations the protocol needs for one share.
#[async_trait]
pub trait AttachmentBackend: Send + Sync {
    /// Current binding, or `None` when the share no longer exists.
    async fn current(&self, ctx: &OpContext) -> Result<Option<Binding>, ProviderError>;

    /// Another share already attached to `vpc_id`, if any.
    async fn occupant(&self, ctx: &OpContext, vpc_id: &str) -> Result<Option<String>, ProviderError>;

    /// Request attachment to `vpc_id`.
    async fn attach(&self, ctx: &OpContext, vpc_id: &str) -> Result<(), ProviderError>;

    /// Request detachment from `vpc_id`.
    async fn detach(&self, ctx: &OpContext, vpc_id: &str) -> Result<(), ProviderError>;
}

/// Budgets for the protocol's retries and waits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentTimings {
    /// Budget for retrying a detach request, or an attach together with its
    /// settle wait.
    pub retry_timeout: Duration,
    /// Delay between retried requests.
    pub backoff: Backoff,
    /// Delay before the first settle poll.
    pub delay: Duration,
    /// Interval between settle polls.
    pub poll_interval: Duration,
    /// Budget for one settle wait. An attach whose wait runs out is
    /// re-issued while `retry_timeout` allows.
    pub wait_timeout: Duration,
}

impl Default for AttachmentTimings {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_secs(5 * 60),
            backoff: Backoff::default(),
            delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(2 * 60),
        }
    }
}

/// Whether an API error reports that the VPC already hosts a share.
pub fn is_single_writer_violation(err: &ProviderError) -> bool {
    let message = err.message().to_lowercase();
    message.contains("already attached") || message.contains("only one share")
}

fn single_writer_error(vpc_id: &str, detail: &str) -> ProviderError {
    ProviderError::FailedPrecondition(format!(
        "VPC {} is already attached to {}: only one share can be attached to a VPC",
        vpc_id, detail
    ))
}

#[derive(Clone, Copy)]
enum Want<'a> {
    AttachedTo(&'a str),
    Detached,
}

impl Want<'_> {
    fn satisfied(&self, binding: &Binding) -> bool {
        match self {
            Want::AttachedTo(vpc_id) => binding.is_attached_to(vpc_id),
            Want::Detached => binding.is_detached(),
        }
    }
}

async fn wait_until(
    ctx: &OpContext,
    backend: &dyn AttachmentBackend,
    timings: &AttachmentTimings,
    want: Want<'_>,
) -> Result<Binding, ProviderError> {
    let conf = StateChangeConf::new(&[SETTLING], &[SETTLED])
        .with_delay(timings.delay)
        .with_min_timeout(timings.poll_interval)
        .with_timeout(timings.wait_timeout);
    let (binding, _) = wait_for_state(ctx, &conf, move || async move {
        backend.current(ctx).await.map(|found| match found {
            Some(binding) => {
                let state = if want.satisfied(&binding) { SETTLED } else { SETTLING };
                (Some(binding), state.to_string())
            },
            None => (None, NOT_FOUND_STATE.to_string()),
        })
    })
    .await?;
    binding.ok_or_else(|| ProviderError::NotFound("share disappeared while settling".to_string()))
}

async fn detach_and_wait(
    ctx: &OpContext,
    backend: &dyn AttachmentBackend,
    vpc_id: &str,
    timings: &AttachmentTimings,
) -> Result<Binding, ProviderError> {
    info!(vpc_id, "detaching share");
    retry(ctx, timings.retry_timeout, timings.backoff, move || async move {
        backend.detach(ctx, vpc_id).await.map_err(classify)
    })
    .await?;
    wait_until(ctx, backend, timings, Want::Detached).await
}

/// Bind the share to `vpc_id`, detaching it from any other VPC first.
///
/// Returns the settled binding (`ACTIVE` on `vpc_id`). A VPC that already
/// hosts another share fails with a precondition error before anything is
/// detached.
pub async fn attach_to(
    ctx: &OpContext,
    backend: &dyn AttachmentBackend,
    vpc_id: &str,
    timings: &AttachmentTimings,
) -> Result<Binding, ProviderError> {
    let binding = backend
        .current(ctx)
        .await?
        .ok_or_else(|| ProviderError::NotFound("share not found".to_string()))?;
    if binding.is_attached_to(vpc_id) {
        return Ok(binding);
    }

    if binding.current_vpc() != Some(vpc_id) {
        if let Some(other) = backend.occupant(ctx, vpc_id).await? {
            return Err(single_writer_error(vpc_id, &format!("share {}", other)));
        }
    }

    let current = binding.current_vpc().map(str::to_string);
    let binding = match current {
        Some(current) if current != vpc_id => detach_and_wait(ctx, backend, &current, timings).await?,
        _ => binding,
    };

    if binding.current_vpc() == Some(vpc_id) {
        return wait_until(ctx, backend, timings, Want::AttachedTo(vpc_id)).await;
    }

    info!(vpc_id, "attaching share");
    let mut first_attempt = true;
    retry(ctx, timings.retry_timeout, timings.backoff, move || {
        let recheck = !std::mem::replace(&mut first_attempt, false);
        async move {
            // A request from an earlier attempt may have landed after its wait gave up.
            let landed = recheck
                && backend
                    .current(ctx)
                    .await
                    .map_err(classify)?
                    .is_some_and(|b| b.current_vpc() == Some(vpc_id));
            if !landed {
                match backend.attach(ctx, vpc_id).await {
                    Ok(()) => {},
                    Err(err) if is_single_writer_violation(&err) => {
                        return Err(RetryError::NonRetryable(single_writer_error(vpc_id, "another share")));
                    },
                    Err(err) => return Err(classify(err)),
                }
            }
            wait_until(ctx, backend, timings, Want::AttachedTo(vpc_id))
                .await
                .map_err(|err| match err {
                    ProviderError::Timeout { .. } => RetryError::Retryable(err),
                    err => classify(err),
                })
        }
    })
    .await
}

/// Unbind the share from `vpc_id`. A share already elsewhere is left alone.
pub async fn detach_from(
    ctx: &OpContext,
    backend: &dyn AttachmentBackend,
    vpc_id: &str,
    timings: &AttachmentTimings,
) -> Result<(), ProviderError> {
    let Some(binding) = backend.current(ctx).await? else {
        return Ok(());
    };
    if binding.current_vpc() != Some(vpc_id) {
        warn!(vpc_id, current = ?binding.current_vpc(), "share not attached to this VPC, nothing to detach");
        return Ok(());
    }
    detach_and_wait(ctx, backend, vpc_id, timings).await?;
    Ok(())
}
