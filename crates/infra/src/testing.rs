//! Test doubles shared by unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use courier_core::{MessageId, TenantId};

use crate::cache::{HandleFactory, TenantHandle};
use crate::delivery::{DeadLetterStore, DlqEntry, DlqError, UpstreamSender};
use crate::sync::lock;

/// Handle that counts how often it was closed.
#[derive(Debug, Clone)]
pub struct FakeHandle {
    pub tenant_id: TenantId,
    closes: Arc<AtomicUsize>,
}

impl FakeHandle {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl TenantHandle for FakeHandle {
    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    created: HashMap<TenantId, usize>,
    failures: HashMap<TenantId, usize>,
    handles: Vec<FakeHandle>,
}

/// Factory that records creations and can be told to fail or stall.
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory {
    state: Arc<Mutex<FactoryState>>,
    delay: Option<Duration>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` creations for `tenant_id`.
    pub fn fail_next(&self, tenant_id: TenantId, times: usize) {
        lock(&self.state).failures.insert(tenant_id, times);
    }

    pub fn created_for(&self, tenant_id: TenantId) -> usize {
        lock(&self.state).created.get(&tenant_id).copied().unwrap_or(0)
    }

    pub fn handles(&self) -> Vec<FakeHandle> {
        lock(&self.state).handles.clone()
    }
}

#[async_trait]
impl HandleFactory<FakeHandle> for RecordingFactory {
    async fn create(&self, tenant_id: TenantId) -> anyhow::Result<FakeHandle> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(left) = state.failures.get_mut(&tenant_id) {
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("tenant database unreachable");
            }
        }

        *state.created.entry(tenant_id).or_default() += 1;
        let handle = FakeHandle {
            tenant_id,
            closes: Arc::new(AtomicUsize::new(0)),
        };
        state.handles.push(handle.clone());
        Ok(handle)
    }
}

#[derive(Debug, Default)]
struct SenderState {
    calls: HashMap<String, Vec<Instant>>,
    sent: Vec<(TenantId, String)>,
}

/// Carrier double with per-recipient failure scripts.
#[derive(Debug, Default)]
pub struct ScriptedSender {
    always_fail: HashSet<String>,
    fail_first: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    state: Mutex<SenderState>,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_fail(mut self, recipient: &str) -> Self {
        self.always_fail.insert(recipient.to_string());
        self
    }

    /// Fail the first `times` calls to `recipient`, then succeed.
    pub fn fail_first(self, recipient: &str, times: u32) -> Self {
        lock(&self.fail_first).insert(recipient.to_string(), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Instants at which calls to `recipient` started.
    pub fn calls_to(&self, recipient: &str) -> Vec<Instant> {
        lock(&self.state)
            .calls
            .get(recipient)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful sends, in order.
    pub fn sent(&self) -> Vec<(TenantId, String)> {
        lock(&self.state).sent.clone()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.state).calls.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl UpstreamSender for ScriptedSender {
    async fn send(&self, to: &str, _body: &str, tenant_id: TenantId) -> anyhow::Result<String> {
        lock(&self.state)
            .calls
            .entry(to.to_string())
            .or_default()
            .push(Instant::now());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail.contains(to) {
            anyhow::bail!("carrier rejected {to}: 503 service unavailable");
        }
        {
            let mut fail_first = lock(&self.fail_first);
            if let Some(left) = fail_first.get_mut(to) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("carrier rejected {to}: 429 too many requests");
                }
            }
        }

        lock(&self.state).sent.push((tenant_id, to.to_string()));
        Ok(format!("SM{}", MessageId::new().as_uuid().simple()))
    }
}

/// DLQ whose every write fails (persistence outage).
#[derive(Debug, Default)]
pub struct FailingDeadLetterStore;

#[async_trait]
impl DeadLetterStore for FailingDeadLetterStore {
    async fn put(&self, _entry: &DlqEntry, _retention: Duration) -> Result<(), DlqError> {
        Err(DlqError::Storage("connection refused".into()))
    }

    async fn get(&self, _message_id: MessageId) -> Result<Option<DlqEntry>, DlqError> {
        Err(DlqError::Storage("connection refused".into()))
    }

    async fn remove(&self, _message_id: MessageId) -> Result<bool, DlqError> {
        Err(DlqError::Storage("connection refused".into()))
    }

    async fn list(&self, _limit: usize) -> Result<Vec<DlqEntry>, DlqError> {
        Err(DlqError::Storage("connection refused".into()))
    }
}
