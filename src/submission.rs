//! Submission engine: drives an approved match into an external claim
//! submission and owns the submission state machine.
//!
//! Status machine: `pending -> submitted -> {approved, rejected, completed}`
//! with the bounded failure loop `submitted-attempt fails -> retrying ->
//! pending -> submitted`. `failed` is terminal once `retry_count` reaches
//! `max_retries`. This is the only component that talks to the claims
//! authority, and every call first takes a slot from the shared rate
//! limiter.

use crate::authority::{ClaimSubmissionPayload, ClaimsAuthorityClient};
use crate::config::{RetryConfig, SubmissionConfig};
use crate::error::PipelineError;
use crate::events::EventBroadcaster;
use crate::model::{EvidenceMatch, MatchAction, Submission, SubmissionStatus};
use crate::rate_limit::RateLimiter;
use crate::store::ClaimStore;
use chrono::{Duration, Utc};
use std::sync::Arc;

pub struct SubmissionEngine {
    store: Arc<dyn ClaimStore>,
    authority: Arc<dyn ClaimsAuthorityClient>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    batch: SubmissionConfig,
    events: Arc<EventBroadcaster>,
}

impl SubmissionEngine {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        authority: Arc<dyn ClaimsAuthorityClient>,
        limiter: Arc<RateLimiter>,
        retry: RetryConfig,
        batch: SubmissionConfig,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        SubmissionEngine {
            store,
            authority,
            limiter,
            retry,
            batch,
            events,
        }
    }

    /// Exponential backoff: base delay doubled per retry already spent,
    /// capped at the configured maximum.
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        let seconds = self
            .retry
            .base_delay_seconds
            .saturating_mul(factor)
            .min(self.retry.max_delay_seconds);
        Duration::seconds(seconds as i64)
    }

    /// Create and drive a new submission for the claim. Fails with
    /// `Conflict` if the claim already has a non-terminal submission; that
    /// guard is the store's conditional create, so concurrent callers cannot
    /// both win.
    pub async fn submit(
        &self,
        claim_id: &str,
        evidence_ids: Vec<String>,
        confidence: f64,
    ) -> Result<Submission, PipelineError> {
        if self.store.get_claim(claim_id)?.is_none() {
            return Err(PipelineError::not_found(format!("claim {claim_id}")));
        }

        let submission = Submission::new(claim_id, evidence_ids, confidence, self.retry.max_retries);
        self.store.create_submission(&submission)?;
        self.events.publish(
            "submission.created",
            claim_id,
            serde_json::json!({
                "submission_id": submission.id,
                "confidence": confidence,
            }),
        );
        log::info!(
            "created submission {} for claim {claim_id} (confidence {confidence:.2})",
            submission.id
        );

        self.drive(submission).await
    }

    /// One submission attempt: rate-limiter slot, authority call, state
    /// transition. `submission.status` must be the status currently stored
    /// (the CAS expectation).
    async fn drive(&self, submission: Submission) -> Result<Submission, PipelineError> {
        let claim = self
            .store
            .get_claim(&submission.claim_id)?
            .ok_or_else(|| PipelineError::not_found(format!("claim {}", submission.claim_id)))?;

        let payload = ClaimSubmissionPayload {
            claim_id: claim.id.clone(),
            order_id: claim.order_id.clone(),
            sku: claim.sku.clone(),
            amount_cents: claim.amount_cents,
            evidence_ids: submission.evidence_ids.clone(),
            confidence: submission.confidence_at_submission,
        };

        self.limiter.acquire().await;

        let expected = submission.status;
        match self.authority.submit(&payload).await {
            Ok(ack) => {
                let mut updated = submission;
                updated.status = SubmissionStatus::Submitted;
                updated.external_submission_id = Some(ack.submission_id);
                updated.external_case_id = Some(ack.case_id);
                updated.submitted_at = Some(Utc::now());
                updated.next_retry_at = None;
                updated.error_message = None;

                if !self.store.update_submission_if_status(&updated, expected)? {
                    // Someone advanced this submission while the call was in
                    // flight; the store wins.
                    log::warn!(
                        "submission {} advanced concurrently; keeping stored state",
                        updated.id
                    );
                    return Ok(self
                        .store
                        .get_submission(&updated.id)?
                        .unwrap_or(updated));
                }

                for evidence_id in &updated.evidence_ids {
                    if let Err(e) = self.store.mark_evidence_resolved(evidence_id) {
                        log::warn!("could not mark evidence {evidence_id} resolved: {e}");
                    }
                }

                self.events.publish(
                    "submission.submitted",
                    &updated.claim_id,
                    serde_json::json!({
                        "submission_id": updated.id,
                        "external_submission_id": updated.external_submission_id,
                        "external_case_id": updated.external_case_id,
                    }),
                );
                log::info!(
                    "submission {} accepted by authority as {:?}",
                    updated.id,
                    updated.external_submission_id
                );
                Ok(updated)
            }
            Err(e) => self.record_failure(submission, expected, e),
        }
    }

    fn record_failure(
        &self,
        submission: Submission,
        expected: SubmissionStatus,
        error: PipelineError,
    ) -> Result<Submission, PipelineError> {
        let mut updated = submission;
        updated.error_message = Some(error.to_string());

        let retryable = error.is_retryable() && updated.retry_count < updated.max_retries;
        if retryable {
            let mut delay = self.backoff_delay(updated.retry_count);
            if let PipelineError::TransientExternal {
                retry_after: Some(hint),
                ..
            } = &error
            {
                // The authority's own hint wins when it asks for more
                // patience than the computed backoff.
                let hinted = Duration::from_std(*hint)
                    .unwrap_or_else(|_| Duration::seconds(self.retry.max_delay_seconds as i64));
                if hinted > delay {
                    delay = hinted;
                }
            }
            updated.status = SubmissionStatus::Retrying;
            updated.next_retry_at = Some(Utc::now() + delay);

            if !self.store.update_submission_if_status(&updated, expected)? {
                log::warn!(
                    "submission {} advanced concurrently during failure handling",
                    updated.id
                );
                return Ok(self.store.get_submission(&updated.id)?.unwrap_or(updated));
            }
            self.events.publish(
                "submission.retrying",
                &updated.claim_id,
                serde_json::json!({
                    "submission_id": updated.id,
                    "retry_count": updated.retry_count,
                    "next_retry_at": updated.next_retry_at,
                    "error": updated.error_message,
                }),
            );
            log::warn!(
                "submission {} failed transiently ({error}); retry {} scheduled at {:?}",
                updated.id,
                updated.retry_count + 1,
                updated.next_retry_at
            );
            Ok(updated)
        } else {
            if !error.is_retryable() {
                // Fatal failures never get another attempt.
                updated.retry_count = updated.max_retries;
            }
            updated.status = SubmissionStatus::Failed;
            updated.next_retry_at = None;
            updated.resolved_at = Some(Utc::now());

            if !self.store.update_submission_if_status(&updated, expected)? {
                log::warn!(
                    "submission {} advanced concurrently during failure handling",
                    updated.id
                );
                return Ok(self.store.get_submission(&updated.id)?.unwrap_or(updated));
            }
            self.events.publish(
                "submission.failed",
                &updated.claim_id,
                serde_json::json!({
                    "submission_id": updated.id,
                    "retry_count": updated.retry_count,
                    "error": updated.error_message,
                }),
            );
            log::error!("submission {} failed permanently: {error}", updated.id);
            Ok(updated)
        }
    }

    /// Re-drive every retrying submission whose backoff has elapsed.
    /// Each row is claimed with a compare-and-swap to `pending` before the
    /// authority is contacted, so two sweeps running back to back cannot
    /// double-submit: the second sweep no longer observes `retrying`.
    pub async fn retry_due(&self) -> Result<usize, PipelineError> {
        let now = Utc::now();
        let due = self
            .store
            .submissions_due_for_retry(now, self.batch.batch_size * 2)?;
        let mut driven = 0;

        for stale in due {
            // Re-read: another worker may have claimed it already.
            let Some(current) = self.store.get_submission(&stale.id)? else {
                continue;
            };
            if current.status != SubmissionStatus::Retrying {
                continue;
            }
            match current.next_retry_at {
                Some(at) if at <= now => {}
                _ => continue,
            }

            let mut claimed = current;
            claimed.retry_count += 1;

            if claimed.retry_count >= claimed.max_retries {
                // Retry budget exhausted; no further attempt.
                claimed.status = SubmissionStatus::Failed;
                claimed.next_retry_at = None;
                claimed.resolved_at = Some(Utc::now());
                if self
                    .store
                    .update_submission_if_status(&claimed, SubmissionStatus::Retrying)?
                {
                    self.events.publish(
                        "submission.failed",
                        &claimed.claim_id,
                        serde_json::json!({
                            "submission_id": claimed.id,
                            "retry_count": claimed.retry_count,
                            "error": claimed.error_message,
                        }),
                    );
                    log::error!(
                        "submission {} exhausted its {} retries",
                        claimed.id,
                        claimed.max_retries
                    );
                }
                continue;
            }

            claimed.status = SubmissionStatus::Pending;
            claimed.next_retry_at = None;
            if !self
                .store
                .update_submission_if_status(&claimed, SubmissionStatus::Retrying)?
            {
                // Lost the claim race; the winner drives it.
                continue;
            }

            log::info!(
                "retrying submission {} (attempt {})",
                claimed.id,
                claimed.retry_count + 1
            );
            self.drive(claimed).await?;
            driven += 1;
        }

        Ok(driven)
    }

    /// Submit a bounded batch of auto-submit matches. Candidates are
    /// expected to be over-fetched (up to twice the batch size); each one is
    /// re-checked against the store before acting, so racing batch runs
    /// degrade to skips instead of duplicates.
    pub async fn process_batch(
        &self,
        candidates: Vec<EvidenceMatch>,
    ) -> Result<usize, PipelineError> {
        let mut processed = 0;

        for candidate in candidates {
            if processed >= self.batch.batch_size {
                break;
            }
            if candidate.action != MatchAction::AutoSubmit {
                continue;
            }
            if self
                .store
                .active_submission_for_claim(&candidate.claim_id)?
                .is_some()
            {
                log::debug!(
                    "claim {} already has an active submission; skipping",
                    candidate.claim_id
                );
                continue;
            }

            match self
                .submit(
                    &candidate.claim_id,
                    vec![candidate.evidence_id.clone()],
                    candidate.final_confidence,
                )
                .await
            {
                Ok(_) => processed += 1,
                Err(PipelineError::Conflict(_)) => {
                    // Benign race with a concurrent batch run.
                    log::debug!("lost submission race for claim {}", candidate.claim_id);
                }
                Err(e) => {
                    log::warn!(
                        "batch submission for claim {} failed: {e}",
                        candidate.claim_id
                    );
                }
            }

            if self.batch.batch_pause_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.batch.batch_pause_ms))
                    .await;
            }
        }

        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthoritySubmitAck, MockAuthorityClient};
    use crate::config::RateLimitConfig;
    use crate::model::{Claim, ClaimState, Evidence};
    use crate::store::MemoryStore;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_seconds: 2,
            max_delay_seconds: 300,
            sweep_interval_seconds: 30,
        }
    }

    fn batch_config() -> SubmissionConfig {
        SubmissionConfig {
            batch_size: 10,
            batch_pause_ms: 0,
        }
    }

    fn engine(
        store: Arc<MemoryStore>,
        authority: Arc<MockAuthorityClient>,
    ) -> SubmissionEngine {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            max_requests: 1000,
            window_seconds: 60,
            min_interval_ms: 0,
        }));
        let events = Arc::new(EventBroadcaster::new(store.clone()));
        SubmissionEngine::new(store, authority, limiter, retry_config(), batch_config(), events)
    }

    fn seed_claim(store: &MemoryStore, id: &str) {
        let now = Utc::now();
        store
            .put_claim(&Claim {
                id: id.to_string(),
                owner_id: "owner-1".to_string(),
                order_id: "ord-1".to_string(),
                sku: "SKU-1".to_string(),
                amount_cents: 1000,
                window_start: now - Duration::days(30),
                window_end: now,
                state: ClaimState::Open,
                created_at: now,
            })
            .unwrap();
    }

    fn seed_evidence(store: &MemoryStore, id: &str) {
        store
            .put_evidence(&Evidence {
                id: id.to_string(),
                source: "inbox".to_string(),
                order_id: Some("ord-1".to_string()),
                sku: None,
                amount_cents: None,
                document_date: None,
                description: None,
                resolved: false,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    fn backdate_retry(store: &MemoryStore, submission_id: &str) {
        let mut sub = store.get_submission(submission_id).unwrap().unwrap();
        sub.next_retry_at = Some(Utc::now() - Duration::seconds(1));
        assert!(store
            .update_submission_if_status(&sub, SubmissionStatus::Retrying)
            .unwrap());
    }

    #[tokio::test]
    async fn test_successful_submit_transitions_to_submitted() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        seed_evidence(&store, "ev-1");
        let e = engine(store.clone(), authority.clone());

        let sub = e
            .submit("claim-1", vec!["ev-1".to_string()], 0.92)
            .await
            .unwrap();

        assert_eq!(sub.status, SubmissionStatus::Submitted);
        assert_eq!(sub.external_submission_id.as_deref(), Some("ext-claim-1"));
        assert_eq!(sub.external_case_id.as_deref(), Some("case-claim-1"));
        assert!(sub.submitted_at.is_some());
        assert_eq!(authority.submit_count(), 1);
        // Evidence consumed by the submission.
        assert!(store.get_evidence("ev-1").unwrap().unwrap().resolved);
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_conflict() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        let e = engine(store.clone(), authority.clone());

        e.submit("claim-1", vec![], 0.9).await.unwrap();
        let second = e.submit("claim-1", vec![], 0.9).await;
        assert!(matches!(second, Err(PipelineError::Conflict(_))));
        assert_eq!(authority.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_backoff() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        authority.push_submit_outcome(Err(PipelineError::transient("timeout")));
        seed_claim(&store, "claim-1");
        let e = engine(store.clone(), authority.clone());

        let before = Utc::now();
        let sub = e.submit("claim-1", vec![], 0.9).await.unwrap();

        assert_eq!(sub.status, SubmissionStatus::Retrying);
        assert_eq!(sub.retry_count, 0);
        assert!(sub.error_message.as_deref().unwrap().contains("timeout"));
        // First backoff step is the base delay (2s).
        let next = sub.next_retry_at.unwrap();
        assert!(next >= before + Duration::seconds(2));
        assert!(next <= Utc::now() + Duration::seconds(3));
    }

    #[tokio::test]
    async fn test_retry_after_hint_extends_backoff() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        authority.push_submit_outcome(Err(PipelineError::transient_with_retry_after(
            "throttled",
            std::time::Duration::from_secs(120),
        )));
        seed_claim(&store, "claim-1");
        let e = engine(store.clone(), authority.clone());

        let before = Utc::now();
        let sub = e.submit("claim-1", vec![], 0.9).await.unwrap();
        assert_eq!(sub.status, SubmissionStatus::Retrying);
        assert!(sub.next_retry_at.unwrap() >= before + Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_terminal_immediately() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        authority.push_submit_outcome(Err(PipelineError::FatalExternal(
            "invalid payload".to_string(),
        )));
        seed_claim(&store, "claim-1");
        let e = engine(store.clone(), authority.clone());

        let sub = e.submit("claim-1", vec![], 0.9).await.unwrap();
        assert_eq!(sub.status, SubmissionStatus::Failed);
        assert_eq!(sub.retry_count, sub.max_retries);
        assert!(sub.resolved_at.is_some());

        // The claim frees up for a fresh submission afterwards.
        assert!(store.active_submission_for_claim("claim-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retries_exhaust_after_three_timeouts() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        for _ in 0..3 {
            authority.push_submit_outcome(Err(PipelineError::transient("timeout")));
        }
        seed_claim(&store, "claim-1");
        let e = engine(store.clone(), authority.clone());

        // Attempt 1 fails, schedules a retry.
        let sub = e.submit("claim-1", vec![], 0.9).await.unwrap();
        assert_eq!(sub.status, SubmissionStatus::Retrying);

        // Attempts 2 and 3 fail the same way.
        for _ in 0..2 {
            backdate_retry(&store, &sub.id);
            assert_eq!(e.retry_due().await.unwrap(), 1);
        }
        let current = store.get_submission(&sub.id).unwrap().unwrap();
        assert_eq!(current.status, SubmissionStatus::Retrying);
        assert_eq!(current.retry_count, 2);

        // The budget is spent: the sweep flips to failed without a fourth
        // call to the authority.
        backdate_retry(&store, &sub.id);
        assert_eq!(e.retry_due().await.unwrap(), 0);

        let terminal = store.get_submission(&sub.id).unwrap().unwrap();
        assert_eq!(terminal.status, SubmissionStatus::Failed);
        assert_eq!(terminal.retry_count, 3);
        assert_eq!(authority.submit_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_due_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        authority.push_submit_outcome(Err(PipelineError::transient("timeout")));
        seed_claim(&store, "claim-1");
        let e = engine(store.clone(), authority.clone());

        let sub = e.submit("claim-1", vec![], 0.9).await.unwrap();
        backdate_retry(&store, &sub.id);

        // First sweep claims and re-submits successfully.
        assert_eq!(e.retry_due().await.unwrap(), 1);
        assert_eq!(
            store.get_submission(&sub.id).unwrap().unwrap().status,
            SubmissionStatus::Submitted
        );

        // Immediate second sweep observes the advanced status and does
        // nothing.
        assert_eq!(e.retry_due().await.unwrap(), 0);
        assert_eq!(authority.submit_count(), 2);
    }

    #[tokio::test]
    async fn test_process_batch_skips_claims_with_submissions() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        seed_claim(&store, "claim-2");
        let e = engine(store.clone(), authority.clone());

        // claim-1 already has an active submission.
        e.submit("claim-1", vec![], 0.9).await.unwrap();

        let candidate = |claim_id: &str, evidence_id: &str| EvidenceMatch {
            id: crate::model::new_id("match"),
            claim_id: claim_id.to_string(),
            evidence_id: evidence_id.to_string(),
            rule_score: 1.0,
            ml_score: 1.0,
            final_confidence: 0.95,
            matched_fields: vec!["order_id".to_string()],
            action: MatchAction::AutoSubmit,
            created_at: Utc::now(),
        };

        let processed = e
            .process_batch(vec![candidate("claim-1", "ev-1"), candidate("claim-2", "ev-2")])
            .await
            .unwrap();

        assert_eq!(processed, 1);
        assert!(store.active_submission_for_claim("claim-2").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_process_batch_respects_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            max_requests: 1000,
            window_seconds: 60,
            min_interval_ms: 0,
        }));
        let events = Arc::new(EventBroadcaster::new(store.clone()));
        let e = SubmissionEngine::new(
            store.clone(),
            authority.clone(),
            limiter,
            retry_config(),
            SubmissionConfig {
                batch_size: 2,
                batch_pause_ms: 0,
            },
            events,
        );

        let mut candidates = Vec::new();
        for i in 0..5 {
            let claim_id = format!("claim-{i}");
            seed_claim(&store, &claim_id);
            candidates.push(EvidenceMatch {
                id: crate::model::new_id("match"),
                claim_id,
                evidence_id: format!("ev-{i}"),
                rule_score: 1.0,
                ml_score: 1.0,
                final_confidence: 0.95,
                matched_fields: vec!["order_id".to_string()],
                action: MatchAction::AutoSubmit,
                created_at: Utc::now(),
            });
        }

        assert_eq!(e.process_batch(candidates).await.unwrap(), 2);
        assert_eq!(authority.submit_count(), 2);
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        let e = engine(store, authority);

        assert_eq!(e.backoff_delay(0), Duration::seconds(2));
        assert_eq!(e.backoff_delay(1), Duration::seconds(4));
        assert_eq!(e.backoff_delay(2), Duration::seconds(8));
        // Capped at max_delay_seconds.
        assert_eq!(e.backoff_delay(20), Duration::seconds(300));
    }

    #[tokio::test]
    async fn test_concurrent_submits_yield_single_active_submission() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        let e = Arc::new(engine(store.clone(), authority.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let e = e.clone();
            handles.push(tokio::spawn(async move {
                e.submit("claim-1", vec![], 0.9).await
            }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(PipelineError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(authority.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure_then_success_via_retry() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        authority.push_submit_outcome(Err(PipelineError::transient("503")));
        authority.push_submit_outcome(Ok(AuthoritySubmitAck {
            submission_id: "ext-retry".to_string(),
            case_id: "case-retry".to_string(),
        }));
        seed_claim(&store, "claim-1");
        let e = engine(store.clone(), authority.clone());

        let sub = e.submit("claim-1", vec![], 0.9).await.unwrap();
        assert_eq!(sub.status, SubmissionStatus::Retrying);

        backdate_retry(&store, &sub.id);
        e.retry_due().await.unwrap();

        let current = store.get_submission(&sub.id).unwrap().unwrap();
        assert_eq!(current.status, SubmissionStatus::Submitted);
        assert_eq!(current.external_submission_id.as_deref(), Some("ext-retry"));
        assert_eq!(current.retry_count, 1);
    }
}
