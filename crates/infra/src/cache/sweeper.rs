//! Background idle-expiry task for [`ResourceCache`].

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::handle::{HandleFactory, TenantHandle};
use super::resource_cache::ResourceCache;

/// Handle to control and join the sweep task.
///
/// Dropping the handle cancels the task without waiting for it.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "tenant handle sweeper ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<H, F> ResourceCache<H, F>
where
    H: TenantHandle,
    F: HandleFactory<H> + 'static,
{
    /// Spawn the periodic idle sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and stops on its own once the
    /// cache is dropped. `parent` cancellation (process shutdown) also stops it.
    pub fn spawn_sweeper(self: &Arc<Self>, parent: &CancellationToken) -> SweeperHandle {
        let token = parent.child_token();
        let cache = Arc::downgrade(self);
        let period = self.config().sweep_interval;
        let join = tokio::spawn(sweep_loop(cache, period, token.clone()));

        SweeperHandle {
            token,
            join: Some(join),
        }
    }
}

async fn sweep_loop<H, F>(
    cache: Weak<ResourceCache<H, F>>,
    period: std::time::Duration,
    token: CancellationToken,
) where
    H: TenantHandle,
    F: HandleFactory<H> + 'static,
{
    info!(period_secs = period.as_secs(), "tenant handle sweeper started");
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(cache) = cache.upgrade() else {
                    debug!("tenant handle cache dropped; sweeper exiting");
                    break;
                };
                cache.sweep_idle().await;
            }
        }
    }

    info!("tenant handle sweeper stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::testing::RecordingFactory;
    use courier_core::TenantId;

    fn config() -> CacheConfig {
        CacheConfig {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            ..CacheConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_expires_idle_handles() {
        let cache = Arc::new(ResourceCache::new(config(), RecordingFactory::new()));
        let root = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(&root);

        let handle = cache.get(TenantId::new()).await.unwrap();
        // Ticks at 30s, 60s, 90s; the 90s tick sees 90s idle.
        tokio::time::sleep(Duration::from_secs(91)).await;

        assert!(handle.is_closed());
        assert!(cache.is_empty());
        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_the_task() {
        let cache = Arc::new(ResourceCache::new(config(), RecordingFactory::new()));
        let root = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(&root);

        root.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_exits_when_cache_is_dropped() {
        let cache = Arc::new(ResourceCache::new(config(), RecordingFactory::new()));
        let sweeper = cache.spawn_sweeper(&CancellationToken::new());

        drop(cache);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(sweeper.is_finished());
    }
}
