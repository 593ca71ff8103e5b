//! Delivery orchestrator: the retrying send loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use courier_core::{MessageId, OutboundMessage, TenantId};

use super::dlq::{DeadLetterStore, DlqError};
use super::policy::{DeliveryConfig, RetryPolicy};
use super::sender::UpstreamSender;
use super::types::{BroadcastResult, DeliveryAttemptResult, DlqEntry, SendOptions};
use crate::circuit_breaker::CircuitBreaker;
use crate::deadline::{Deadline, DeadlineExceeded};

/// DLQ replay error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no dead-letter entry for message {0}")]
    NotFound(MessageId),
    #[error(transparent)]
    Dlq(#[from] DlqError),
}

/// Why a single attempt failed.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("circuit open")]
    CircuitOpen,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("deadline exceeded before attempt {0}")]
    DeadlinePassed(u32),
    #[error("{0:#}")]
    Upstream(anyhow::Error),
}

/// Sends messages through one carrier with retries, breaker gating, and a DLQ.
///
/// Cheap to clone; clones share the sender, store, and breaker.
pub struct DeliveryOrchestrator<S, D> {
    sender: Arc<S>,
    dlq: Arc<D>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    config: DeliveryConfig,
}

impl<S, D> Clone for DeliveryOrchestrator<S, D> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            dlq: self.dlq.clone(),
            breaker: self.breaker.clone(),
            policy: self.policy.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, D> std::fmt::Debug for DeliveryOrchestrator<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryOrchestrator")
            .field("breaker", &self.breaker.name())
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, D> DeliveryOrchestrator<S, D>
where
    S: UpstreamSender,
    D: DeadLetterStore,
{
    pub fn new(
        sender: Arc<S>,
        dlq: Arc<D>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            sender,
            dlq,
            breaker,
            policy,
            config,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn dead_letters(&self) -> &Arc<D> {
        &self.dlq
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver one message, retrying per policy.
    ///
    /// Never fails: transient errors and circuit-open rejections are absorbed,
    /// and only the terminal outcome is returned. On exhaustion the message is
    /// written to the DLQ once; a DLQ write failure is logged, not returned.
    #[instrument(
        skip(self, message, opts),
        fields(
            message_id = %message.message_id,
            tenant_id = %message.tenant_id,
            breaker = %self.breaker.name()
        )
    )]
    pub async fn send(&self, message: &OutboundMessage, opts: &SendOptions) -> DeliveryAttemptResult {
        let policy = opts.retry.as_ref().unwrap_or(&self.policy);
        let mut attempts = 0;
        let mut last_error: Option<String> = None;
        // A zero-attempt override still makes one attempt.
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if opts.deadline.is_expired() {
                warn!(attempt, "deadline reached before attempt; abandoning retries");
                last_error.get_or_insert_with(|| AttemptError::DeadlinePassed(attempt).to_string());
                break;
            }
            attempts = attempt;

            match self.attempt_once(message, &opts.deadline).await {
                Ok(upstream_id) => {
                    debug!(attempt, upstream_id = %upstream_id, "message delivered");
                    return DeliveryAttemptResult::delivered(message, attempt, upstream_id);
                }
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "delivery attempt failed");
                    last_error = Some(err.to_string());
                }
            }

            if !policy.should_retry(attempt) {
                break;
            }

            let delay = policy.delay_after_attempt(attempt);
            if opts.deadline.remaining().is_some_and(|left| left <= delay) {
                warn!(attempt, "deadline would pass during backoff; abandoning retries");
                break;
            }
            tokio::time::sleep(delay).await;
        }

        let mut result = DeliveryAttemptResult::failed(message, attempts, last_error);
        result.dead_lettered = self.dead_letter(message, &result).await;
        result
    }

    /// Send `content` to every recipient concurrently and wait for all of them.
    ///
    /// One failure never cancels the others; the result counts successes,
    /// failures, and how many failures reached the DLQ.
    pub async fn send_many(
        &self,
        tenant_id: TenantId,
        recipients: &[String],
        content: &str,
        opts: &SendOptions,
    ) -> BroadcastResult
    where
        S: 'static,
        D: 'static,
    {
        let mut report = BroadcastResult::default();
        let mut tasks = JoinSet::new();
        let mut pending: Vec<OutboundMessage> = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            match OutboundMessage::new(tenant_id, recipient.as_str(), content) {
                Ok(message) => {
                    let index = pending.len();
                    pending.push(message.clone());
                    let this = self.clone();
                    let opts = opts.clone();
                    tasks.spawn(async move { (index, this.send(&message, &opts).await) });
                }
                Err(err) => {
                    debug!(recipient = %recipient, error = %err, "skipping invalid recipient");
                    let placeholder = OutboundMessage {
                        message_id: MessageId::new(),
                        tenant_id,
                        recipient: recipient.clone(),
                        content: content.to_string(),
                        queued_at: chrono::Utc::now(),
                    };
                    report.push(DeliveryAttemptResult::failed(&placeholder, 0, Some(err.to_string())));
                }
            }
        }

        let mut results: Vec<Option<DeliveryAttemptResult>> = vec![None; pending.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => error!(error = %err, "delivery task aborted"),
            }
        }

        // Keep input order; a task that panicked still reports a failure.
        for (slot, message) in results.into_iter().zip(pending) {
            report.push(slot.unwrap_or_else(|| {
                DeliveryAttemptResult::failed(&message, 0, Some("delivery task aborted".to_string()))
            }));
        }

        info!(
            tenant_id = %tenant_id,
            successful = report.successful.len(),
            failed = report.failed.len(),
            dlq = report.dlq_count,
            "broadcast finished"
        );
        report
    }

    /// Replay a dead-lettered message with a fresh retry budget.
    ///
    /// The entry is removed only if the replay succeeds; a failed replay
    /// leaves it in place (refreshed with the new failure).
    pub async fn retry_dead_letter(
        &self,
        message_id: MessageId,
    ) -> Result<DeliveryAttemptResult, DeliveryError> {
        let entry = self
            .dlq
            .get(message_id)
            .await?
            .ok_or(DeliveryError::NotFound(message_id))?;

        info!(message_id = %message_id, previous_attempts = entry.attempts, "replaying dead-lettered message");
        let result = self.send(&entry.to_message(), &SendOptions::default()).await;

        if result.success {
            if let Err(err) = self.dlq.remove(message_id).await {
                warn!(message_id = %message_id, error = %err, "replayed message delivered but DLQ entry not removed");
            }
        }
        Ok(result)
    }

    async fn attempt_once(
        &self,
        message: &OutboundMessage,
        deadline: &Deadline,
    ) -> Result<String, AttemptError> {
        if !self.breaker.can_attempt() {
            return Err(AttemptError::CircuitOpen);
        }

        let call = self
            .sender
            .send(&message.recipient, &message.content, message.tenant_id);

        match deadline.run(self.config.attempt_timeout, call).await {
            Ok(Ok(upstream_id)) => {
                self.breaker.record_success();
                Ok(upstream_id)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(AttemptError::Upstream(err))
            }
            Err(DeadlineExceeded(after)) => {
                self.breaker.record_failure();
                Err(AttemptError::Timeout(after))
            }
        }
    }

    /// Persist the terminal failure. Returns whether the write succeeded.
    async fn dead_letter(&self, message: &OutboundMessage, result: &DeliveryAttemptResult) -> bool {
        let entry = DlqEntry::from_failure(message, result);
        let write = self.dlq.put(&entry, self.config.dlq_retention);

        match Deadline::none().run(self.config.attempt_timeout, write).await {
            Ok(Ok(())) => {
                warn!(
                    message_id = %message.message_id,
                    attempts = result.attempts,
                    reason = %entry.failure_reason,
                    "message dead-lettered"
                );
                true
            }
            Ok(Err(err)) => {
                error!(message_id = %message.message_id, error = %err, "failed to persist dead-letter entry");
                false
            }
            Err(DeadlineExceeded(after)) => {
                error!(message_id = %message.message_id, after_ms = after.as_millis() as u64, "dead-letter write timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::delivery::InMemoryDeadLetterStore;
    use crate::testing::{FailingDeadLetterStore, ScriptedSender};
    use tokio::time::Instant;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "carrier",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(60),
            },
        ))
    }

    fn orchestrator(
        sender: Arc<ScriptedSender>,
        breaker: Arc<CircuitBreaker>,
    ) -> DeliveryOrchestrator<ScriptedSender, InMemoryDeadLetterStore> {
        DeliveryOrchestrator::new(
            sender,
            InMemoryDeadLetterStore::arc(),
            breaker,
            RetryPolicy::default(),
            DeliveryConfig::default(),
        )
    }

    fn message(recipient: &str) -> OutboundMessage {
        OutboundMessage::new(TenantId::new(), recipient, "your code is 1234").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt_stops_immediately() {
        let sender = Arc::new(ScriptedSender::new());
        let orch = orchestrator(sender.clone(), breaker(5));

        let result = orch.send(&message("+15550100"), &SendOptions::default()).await;

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert!(result.upstream_id.is_some());
        assert_eq!(sender.calls_to("+15550100").len(), 1);
        assert!(orch.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_send_backs_off_then_dead_letters_once() {
        let sender = Arc::new(ScriptedSender::new().always_fail("+15550100"));
        let orch = orchestrator(sender.clone(), breaker(5));
        let msg = message("+15550100");

        let started = Instant::now();
        let result = orch.send(&msg, &SendOptions::default()).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.dead_lettered);
        assert!(result.last_error.as_deref().unwrap().contains("carrier rejected"));

        let calls = sender.calls_to("+15550100");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_millis(1000));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(2000));
        // No wait after the final attempt.
        assert_eq!(started.elapsed(), Duration::from_millis(3000));

        let dlq = orch.dead_letters();
        assert_eq!(dlq.len(), 1);
        let entry = dlq.get(msg.message_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.tenant_id, msg.tenant_id);
        assert_eq!(entry.content, msg.content);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let sender = Arc::new(ScriptedSender::new().fail_first("+15550100", 2));
        let b = breaker(5);
        let orch = orchestrator(sender.clone(), b.clone());

        let result = orch.send(&message("+15550100"), &SendOptions::default()).await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert!(!result.dead_lettered);
        assert_eq!(b.snapshot().failure_count, 0);
        assert_eq!(b.snapshot().total_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_consumes_attempts_without_upstream_calls() {
        let sender = Arc::new(ScriptedSender::new());
        let b = breaker(1);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        let orch = orchestrator(sender.clone(), b);

        let started = Instant::now();
        let result = orch.send(&message("+15550100"), &SendOptions::default()).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.last_error.as_deref(), Some("circuit open"));
        assert!(result.dead_lettered);
        assert!(sender.calls_to("+15550100").is_empty());
        // Backoff still applies between rejected attempts.
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_counts_as_failure() {
        let sender = Arc::new(ScriptedSender::new().with_delay(Duration::from_secs(60)));
        let orch = DeliveryOrchestrator::new(
            sender,
            InMemoryDeadLetterStore::arc(),
            breaker(5),
            RetryPolicy::fixed(2, Duration::from_millis(10)),
            DeliveryConfig {
                attempt_timeout: Duration::from_secs(1),
                ..DeliveryConfig::default()
            },
        );

        let result = orch.send(&message("+15550100"), &SendOptions::default()).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.last_error.unwrap().starts_with("send timed out"));
        assert_eq!(orch.breaker().snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_cuts_retries_short() {
        let sender = Arc::new(ScriptedSender::new().always_fail("+15550100"));
        let orch = orchestrator(sender.clone(), breaker(5));
        let opts = SendOptions::default().with_deadline(Deadline::after(Duration::from_millis(1500)));

        let result = orch.send(&message("+15550100"), &opts).await;

        // Attempt 1 at 0ms, attempt 2 at 1000ms; the 2000ms backoff would overrun.
        assert_eq!(result.attempts, 2);
        assert_eq!(sender.calls_to("+15550100").len(), 2);
        assert!(result.dead_lettered);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_dead_letters_with_a_reason() {
        let sender = Arc::new(ScriptedSender::new());
        let orch = orchestrator(sender.clone(), breaker(5));
        let opts = SendOptions::default().with_deadline(Deadline::after(Duration::ZERO));

        let result = orch.send(&message("+15550100"), &opts).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.last_error.as_deref(), Some("deadline exceeded before attempt 1"));
        assert!(result.dead_lettered);
        assert_eq!(sender.total_calls(), 0);

        let entries = orch.dead_letters().list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_reason, "deadline exceeded before attempt 1");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempt_override_still_tries_once() {
        let sender = Arc::new(ScriptedSender::new().always_fail("+15550100"));
        let orch = orchestrator(sender.clone(), breaker(5));
        let opts = SendOptions::default().with_retry(RetryPolicy::fixed(0, Duration::ZERO));

        let result = orch.send(&message("+15550100"), &opts).await;

        assert_eq!(result.attempts, 1);
        assert_eq!(sender.calls_to("+15550100").len(), 1);
        assert!(result.last_error.is_some());
        assert!(result.dead_lettered);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_policy_override() {
        let sender = Arc::new(ScriptedSender::new().always_fail("+15550100"));
        let orch = orchestrator(sender.clone(), breaker(10));
        let opts = SendOptions::default().with_retry(RetryPolicy::fixed(5, Duration::from_millis(1)));

        let result = orch.send(&message("+15550100"), &opts).await;

        assert_eq!(result.attempts, 5);
        assert_eq!(sender.calls_to("+15550100").len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn dlq_outage_does_not_fail_the_call() {
        let sender = Arc::new(ScriptedSender::new().always_fail("+15550100"));
        let orch = DeliveryOrchestrator::new(
            sender,
            Arc::new(FailingDeadLetterStore),
            breaker(5),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            DeliveryConfig::default(),
        );

        let result = orch.send(&message("+15550100"), &SendOptions::default()).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert!(!result.dead_lettered);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_reports_partial_failure() {
        let recipients: Vec<String> = (0..10).map(|i| format!("+1555010{i}")).collect();
        let sender = Arc::new(
            ScriptedSender::new()
                .always_fail(&recipients[1])
                .always_fail(&recipients[4])
                .always_fail(&recipients[7]),
        );
        // Threshold above the 9 failures so the breaker never trips mid-test.
        let orch = orchestrator(sender.clone(), breaker(100));

        let report = orch
            .send_many(TenantId::new(), &recipients, "maintenance tonight", &SendOptions::default())
            .await;

        assert_eq!(report.successful.len(), 7);
        assert_eq!(report.failed.len(), 3);
        assert_eq!(report.dlq_count, 3);
        assert_eq!(orch.dead_letters().len(), 3);

        let failed: Vec<&str> = report.failed.iter().map(|r| r.recipient.as_str()).collect();
        assert_eq!(failed, vec![recipients[1].as_str(), recipients[4].as_str(), recipients[7].as_str()]);
        assert!(report.failed.iter().all(|r| r.attempts == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_reports_invalid_recipients_without_sending() {
        let sender = Arc::new(ScriptedSender::new());
        let orch = orchestrator(sender.clone(), breaker(5));
        let recipients = vec!["+15550100".to_string(), "  ".to_string()];

        let report = orch
            .send_many(TenantId::new(), &recipients, "hi", &SendOptions::default())
            .await;

        assert_eq!(report.successful.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts, 0);
        assert_eq!(report.dlq_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_removes_entry_only_on_success() {
        let sender = Arc::new(ScriptedSender::new().fail_first("+15550100", 6));
        let orch = orchestrator(sender.clone(), breaker(100));
        let msg = message("+15550100");

        let first = orch.send(&msg, &SendOptions::default()).await;
        assert!(first.dead_lettered);

        // Second budget of 3 also fails (failures 4..=6), entry stays.
        let replay = orch.retry_dead_letter(msg.message_id).await.unwrap();
        assert!(!replay.success);
        assert!(orch.dead_letters().get(msg.message_id).await.unwrap().is_some());

        let replay = orch.retry_dead_letter(msg.message_id).await.unwrap();
        assert!(replay.success);
        assert_eq!(replay.message_id, msg.message_id);
        assert!(orch.dead_letters().get(msg.message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_of_unknown_message_is_not_found() {
        let orch = orchestrator(Arc::new(ScriptedSender::new()), breaker(5));
        let id = MessageId::new();

        let err = orch.retry_dead_letter(id).await.unwrap_err();
        assert_eq!(err, DeliveryError::NotFound(id));
    }
}
