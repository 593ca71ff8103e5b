//! Carrier seam.

use std::sync::Arc;

use async_trait::async_trait;

use courier_core::TenantId;

/// The upstream send primitive a carrier integration provides.
///
/// Returns the carrier's message id on acceptance. Any error counts as a
/// failed attempt; payload construction is the implementation's concern.
#[async_trait]
pub trait UpstreamSender: Send + Sync {
    async fn send(&self, to: &str, body: &str, tenant_id: TenantId) -> anyhow::Result<String>;
}

#[async_trait]
impl<S> UpstreamSender for Arc<S>
where
    S: UpstreamSender + ?Sized,
{
    async fn send(&self, to: &str, body: &str, tenant_id: TenantId) -> anyhow::Result<String> {
        (**self).send(to, body, tenant_id).await
    }
}
