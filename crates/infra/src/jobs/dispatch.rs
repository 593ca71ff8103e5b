//! Outbound dispatch job: per tenant, drain pending messages through the
//! delivery pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use courier_core::{OutboundMessage, TenantId};

use super::scheduler::ScheduledJob;
use crate::cache::{HandleFactory, ResourceCache, TenantHandle};
use crate::delivery::{
    DeadLetterStore, DeliveryAttemptResult, DeliveryOrchestrator, SendOptions, UpstreamSender,
};

/// Where the dispatch job finds work. Implemented by the application
/// (typically a query against the tenant database the handle points at).
#[async_trait]
pub trait PendingMessageSource<H>: Send + Sync {
    /// Tenants to visit this run.
    async fn tenants(&self) -> anyhow::Result<Vec<TenantId>>;

    /// Messages waiting to be sent for `tenant_id`.
    async fn pending(&self, tenant_id: TenantId, handle: &H) -> anyhow::Result<Vec<OutboundMessage>>;

    /// Record the terminal outcome of one message.
    async fn record(&self, _handle: &H, _result: &DeliveryAttemptResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A tenant the run could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantFailure {
    pub tenant_id: TenantId,
    pub error: String,
}

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub tenants_visited: usize,
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub tenant_failures: Vec<TenantFailure>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }

    fn record(&mut self, result: &DeliveryAttemptResult) {
        if result.success {
            self.delivered += 1;
        } else {
            self.failed += 1;
            if result.dead_lettered {
                self.dead_lettered += 1;
            }
        }
    }

    fn tenant_failed(&mut self, tenant_id: TenantId, error: impl std::fmt::Display) {
        self.tenant_failures.push(TenantFailure {
            tenant_id,
            error: error.to_string(),
        });
    }
}

/// Drains pending messages for every tenant.
///
/// One tenant's failure (handle creation, pending query) is recorded in the
/// report and does not stop the others.
pub struct DispatchJob<H, F, P, S, D> {
    name: String,
    cache: Arc<ResourceCache<H, F>>,
    source: Arc<P>,
    orchestrator: DeliveryOrchestrator<S, D>,
    options: SendOptions,
}

impl<H, F, P, S, D> std::fmt::Debug for DispatchJob<H, F, P, S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchJob")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<H, F, P, S, D> DispatchJob<H, F, P, S, D>
where
    H: TenantHandle,
    F: HandleFactory<H>,
    P: PendingMessageSource<H>,
    S: UpstreamSender,
    D: DeadLetterStore,
{
    pub fn new(
        name: impl Into<String>,
        cache: Arc<ResourceCache<H, F>>,
        source: Arc<P>,
        orchestrator: DeliveryOrchestrator<S, D>,
    ) -> Self {
        Self {
            name: name.into(),
            cache,
            source,
            orchestrator,
            options: SendOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    /// One pass over all tenants. Errors only if the tenant list itself
    /// cannot be loaded.
    #[instrument(skip(self), fields(job = %self.name))]
    pub async fn run_once(&self) -> anyhow::Result<DispatchReport> {
        let tenants = self.source.tenants().await?;
        let mut report = DispatchReport::default();

        for tenant_id in tenants {
            report.tenants_visited += 1;

            let handle = match self.cache.get_within(tenant_id, self.options.deadline).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(tenant_id = %tenant_id, error = %err, "tenant handle unavailable; skipping tenant");
                    report.tenant_failed(tenant_id, err);
                    continue;
                }
            };

            let pending = match self.source.pending(tenant_id, &handle).await {
                Ok(pending) => pending,
                Err(err) => {
                    warn!(tenant_id = %tenant_id, error = %err, "failed to load pending messages");
                    report.tenant_failed(tenant_id, err);
                    continue;
                }
            };

            for message in &pending {
                let result = self.orchestrator.send(message, &self.options).await;
                report.record(&result);

                if let Err(err) = self.source.record(&handle, &result).await {
                    warn!(message_id = %message.message_id, error = %err, "failed to record delivery outcome");
                }
            }
        }

        info!(
            tenants = report.tenants_visited,
            delivered = report.delivered,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            tenant_failures = report.tenant_failures.len(),
            "dispatch run finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl<H, F, P, S, D> ScheduledJob for DispatchJob<H, F, P, S, D>
where
    H: TenantHandle,
    F: HandleFactory<H>,
    P: PendingMessageSource<H>,
    S: UpstreamSender,
    D: DeadLetterStore,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.run_once().await.map(|_| ())
    }
}
