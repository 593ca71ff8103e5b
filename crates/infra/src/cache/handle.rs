//! Tenant handle seam: what the cache stores and how it gets one.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use courier_core::TenantId;

/// A long-lived per-tenant resource (connection pool, client).
///
/// `close` releases the underlying resources. The cache calls it exactly once,
/// by whichever path removed the entry (eviction, idle sweep, invalidation).
#[async_trait]
pub trait TenantHandle: Send + Sync + 'static {
    async fn close(&self);
}

/// Builds a handle for a tenant on cache miss.
#[async_trait]
pub trait HandleFactory<H>: Send + Sync {
    async fn create(&self, tenant_id: TenantId) -> anyhow::Result<H>;
}

#[async_trait]
impl TenantHandle for PgPool {
    async fn close(&self) {
        PgPool::close(self).await;
    }
}

/// Placeholder substituted with the tenant id in [`PostgresHandleFactory`] URLs.
pub const TENANT_PLACEHOLDER: &str = "{tenant}";

/// One Postgres pool per tenant database.
///
/// `url_template` must contain `{tenant}`, e.g.
/// `postgres://app@db/tenant_{tenant}`.
#[derive(Debug, Clone)]
pub struct PostgresHandleFactory {
    url_template: String,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PostgresHandleFactory {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Connection URL for a tenant.
    pub fn url_for(&self, tenant_id: TenantId) -> String {
        // Hyphens are not valid in unquoted database names.
        let name = tenant_id.as_uuid().simple().to_string();
        self.url_template.replace(TENANT_PLACEHOLDER, &name)
    }
}

#[async_trait]
impl HandleFactory<PgPool> for PostgresHandleFactory {
    async fn create(&self, tenant_id: TenantId) -> anyhow::Result<PgPool> {
        anyhow::ensure!(
            self.url_template.contains(TENANT_PLACEHOLDER),
            "database url template is missing {TENANT_PLACEHOLDER}"
        );

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.url_for(tenant_id))
            .await?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn url_template_substitutes_tenant() {
        let factory = PostgresHandleFactory::new("postgres://app@db/tenant_{tenant}");
        let uuid = Uuid::now_v7();
        let url = factory.url_for(TenantId::from_uuid(uuid));

        assert_eq!(url, format!("postgres://app@db/tenant_{}", uuid.simple()));
    }

    #[tokio::test]
    async fn template_without_placeholder_is_rejected_before_connecting() {
        let factory = PostgresHandleFactory::new("postgres://app@db/shared");
        let err = factory.create(TenantId::new()).await.unwrap_err();
        assert!(err.to_string().contains("{tenant}"));
    }
}
