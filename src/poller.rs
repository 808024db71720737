//! Status polling for submitted claims.
//!
//! Pull (scheduler-driven polling) and push (inbound webhook callbacks)
//! carry the same payload shape and converge on one idempotent
//! `apply_status`. A transient status never mutates local state; only an
//! authoritative terminal status moves the submission, and a paid/approved
//! outcome triggers proof bundle generation exactly once.

use crate::authority::{AuthorityStatus, ClaimsAuthorityClient, ResolutionFields};
use crate::error::PipelineError;
use crate::events::EventBroadcaster;
use crate::model::{Submission, SubmissionStatus};
use crate::proof::ProofBundleService;
use crate::store::ClaimStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Inbound webhook payload. Same shape as a polled status response, plus the
/// external submission id it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCallback {
    pub submission_id: String,
    pub status: String,
    #[serde(default)]
    pub resolution: Option<ResolutionFields>,
}

/// Map the authority's status vocabulary onto local terminal states.
/// Anything unrecognised is treated as still in review.
pub fn map_external_status(status: &str) -> Option<SubmissionStatus> {
    match status.to_ascii_lowercase().as_str() {
        "approved" => Some(SubmissionStatus::Approved),
        "paid" | "completed" | "settled" => Some(SubmissionStatus::Completed),
        "rejected" | "denied" => Some(SubmissionStatus::Rejected),
        "under_review" | "pending" | "received" | "in_progress" => None,
        other => {
            log::warn!("unknown authority status '{other}'; treating as in review");
            None
        }
    }
}

pub struct StatusPoller {
    store: Arc<dyn ClaimStore>,
    authority: Arc<dyn ClaimsAuthorityClient>,
    proof: Arc<ProofBundleService>,
    events: Arc<EventBroadcaster>,
    batch_size: usize,
}

impl StatusPoller {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        authority: Arc<dyn ClaimsAuthorityClient>,
        proof: Arc<ProofBundleService>,
        events: Arc<EventBroadcaster>,
        batch_size: usize,
    ) -> Self {
        StatusPoller {
            store,
            authority,
            proof,
            events,
            batch_size,
        }
    }

    /// Poll the authority for one submission and apply the result. A
    /// transient authority failure propagates without touching local state.
    pub async fn check(&self, submission_id: &str) -> Result<Submission, PipelineError> {
        let submission = self
            .store
            .get_submission(submission_id)?
            .ok_or_else(|| PipelineError::not_found(format!("submission {submission_id}")))?;

        if submission.status != SubmissionStatus::Submitted {
            // Nothing to poll: not yet with the authority, or already
            // terminal.
            return Ok(submission);
        }

        let external_id = submission.external_submission_id.clone().ok_or_else(|| {
            PipelineError::conflict(format!(
                "submission {submission_id} is submitted but has no external id"
            ))
        })?;

        let payload = self.authority.status(&external_id).await?;
        self.apply_status(submission, &payload).await
    }

    /// Apply a status payload (polled or pushed) to a submission.
    /// Idempotent: re-applying a terminal payload is a no-op and cannot
    /// trigger a second proof bundle.
    pub async fn apply_status(
        &self,
        submission: Submission,
        payload: &AuthorityStatus,
    ) -> Result<Submission, PipelineError> {
        let Some(terminal) = map_external_status(&payload.status) else {
            log::debug!(
                "submission {} still in review ({})",
                submission.id,
                payload.status
            );
            return Ok(submission);
        };

        if submission.status.is_terminal() {
            log::debug!(
                "submission {} already terminal ({}); ignoring payload",
                submission.id,
                submission.status.as_str()
            );
            return Ok(submission);
        }

        let mut updated = submission;
        updated.status = terminal;
        updated.resolved_at = Some(Utc::now());

        if !self
            .store
            .update_submission_if_status(&updated, SubmissionStatus::Submitted)?
        {
            // A concurrent poll or callback won; take the stored truth.
            log::debug!("submission {} resolved concurrently", updated.id);
            return Ok(self.store.get_submission(&updated.id)?.unwrap_or(updated));
        }

        let event_type = format!("submission.{}", terminal.as_str());
        self.events.publish(
            &event_type,
            &updated.claim_id,
            serde_json::json!({
                "submission_id": updated.id,
                "status": terminal.as_str(),
                "resolution": payload.resolution,
            }),
        );
        log::info!(
            "submission {} resolved as {}",
            updated.id,
            terminal.as_str()
        );

        if terminal.is_terminal_success() {
            // Fire-and-forget: a rendering failure is recorded on the bundle
            // and never unwinds the submission's terminal status.
            if let Err(e) = self
                .proof
                .on_terminal_success(&updated.claim_id, payload.resolution.as_ref())
                .await
            {
                log::error!(
                    "proof bundle trigger failed for claim {}: {e}",
                    updated.claim_id
                );
            }
        }

        Ok(updated)
    }

    /// Inbound webhook path. Looks the submission up by its external id and
    /// converges on `apply_status`.
    pub async fn handle_callback(
        &self,
        callback: &StatusCallback,
    ) -> Result<Submission, PipelineError> {
        let submission = self
            .store
            .submission_by_external_id(&callback.submission_id)?
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "no submission with external id {}",
                    callback.submission_id
                ))
            })?;

        let payload = AuthorityStatus {
            status: callback.status.clone(),
            resolution: callback.resolution.clone(),
        };
        self.apply_status(submission, &payload).await
    }

    /// Scheduler entry point: poll a bounded batch of submissions awaiting
    /// status. Individual failures are logged and do not stop the sweep.
    pub async fn poll_pending(&self) -> Result<usize, PipelineError> {
        let waiting = self.store.submissions_awaiting_status(self.batch_size)?;
        let mut resolved = 0;

        for submission in waiting {
            match self.check(&submission.id).await {
                Ok(updated) => {
                    if updated.status.is_terminal() {
                        resolved += 1;
                    }
                }
                Err(e) => {
                    log::warn!("status check for submission {} failed: {e}", submission.id);
                }
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MockAuthorityClient;
    use crate::model::{Claim, ClaimState, ProofStatus};
    use crate::proof::DocumentRenderer;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;

    struct StaticRenderer;

    #[async_trait]
    impl DocumentRenderer for StaticRenderer {
        async fn render(
            &self,
            claim: &Claim,
            _evidence: &[crate::model::Evidence],
            _prompts: &[crate::model::SmartPrompt],
            _payout: Option<&ResolutionFields>,
        ) -> Result<Vec<String>, PipelineError> {
            Ok(vec![format!("artifact://{}", claim.id)])
        }
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

    fn seed_submitted(store: &MemoryStore, claim_id: &str, external_id: &str) -> Submission {
        let mut sub = Submission::new(claim_id, vec![], 0.9, 3);
        store.create_submission(&sub).unwrap();
        sub.status = SubmissionStatus::Submitted;
        sub.external_submission_id = Some(external_id.to_string());
        sub.external_case_id = Some(format!("case-{claim_id}"));
        sub.submitted_at = Some(Utc::now());
        assert!(store
            .update_submission_if_status(&sub, SubmissionStatus::Pending)
            .unwrap());
        sub
    }

    fn poller(
        store: Arc<MemoryStore>,
        authority: Arc<MockAuthorityClient>,
    ) -> StatusPoller {
        let events = Arc::new(EventBroadcaster::new(store.clone()));
        let proof = Arc::new(ProofBundleService::new(
            store.clone(),
            Arc::new(StaticRenderer),
            events.clone(),
        ));
        StatusPoller::new(store, authority, proof, events, 20)
    }

    #[test]
    fn test_external_status_vocabulary() {
        assert_eq!(map_external_status("approved"), Some(SubmissionStatus::Approved));
        assert_eq!(map_external_status("PAID"), Some(SubmissionStatus::Completed));
        assert_eq!(map_external_status("settled"), Some(SubmissionStatus::Completed));
        assert_eq!(map_external_status("denied"), Some(SubmissionStatus::Rejected));
        assert_eq!(map_external_status("under_review"), None);
        assert_eq!(map_external_status("something_new"), None);
    }

    #[tokio::test]
    async fn test_transient_status_leaves_submission_untouched() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        let sub = seed_submitted(&store, "claim-1", "ext-1");
        let p = poller(store.clone(), authority.clone());

        // Mock default status is under_review.
        let after = p.check(&sub.id).await.unwrap();
        assert_eq!(after.status, SubmissionStatus::Submitted);
        assert!(store.proof_bundle_for_claim("claim-1").unwrap().is_none());
        assert_eq!(authority.status_count(), 1);
    }

    #[tokio::test]
    async fn test_approved_status_resolves_and_triggers_proof() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        let sub = seed_submitted(&store, "claim-1", "ext-1");
        authority.set_status(
            "ext-1",
            AuthorityStatus {
                status: "approved".to_string(),
                resolution: Some(ResolutionFields {
                    outcome: Some("approved".to_string()),
                    payout_amount_cents: Some(1000),
                    paid_at: None,
                    reference: None,
                }),
            },
        );
        let p = poller(store.clone(), authority.clone());

        let after = p.check(&sub.id).await.unwrap();
        assert_eq!(after.status, SubmissionStatus::Approved);
        assert!(after.resolved_at.is_some());

        let bundle = store.proof_bundle_for_claim("claim-1").unwrap().unwrap();
        assert_eq!(bundle.status, ProofStatus::Completed);
        assert!(!bundle.artifact_refs.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_status_resolves_without_proof() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        let sub = seed_submitted(&store, "claim-1", "ext-1");
        authority.set_status(
            "ext-1",
            AuthorityStatus {
                status: "rejected".to_string(),
                resolution: None,
            },
        );
        let p = poller(store.clone(), authority.clone());

        let after = p.check(&sub.id).await.unwrap();
        assert_eq!(after.status, SubmissionStatus::Rejected);
        assert!(store.proof_bundle_for_claim("claim-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_status_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        let sub = seed_submitted(&store, "claim-1", "ext-1");
        let p = poller(store.clone(), authority);

        let payload = AuthorityStatus {
            status: "paid".to_string(),
            resolution: None,
        };
        let first = p.apply_status(sub, &payload).await.unwrap();
        assert_eq!(first.status, SubmissionStatus::Completed);
        let bundle_first = store.proof_bundle_for_claim("claim-1").unwrap().unwrap();

        // Re-applying the same terminal payload changes nothing and does not
        // mint a second bundle.
        let second = p.apply_status(first.clone(), &payload).await.unwrap();
        assert_eq!(second.status, SubmissionStatus::Completed);
        let bundle_second = store.proof_bundle_for_claim("claim-1").unwrap().unwrap();
        assert_eq!(bundle_first.id, bundle_second.id);
    }

    #[tokio::test]
    async fn test_callback_converges_with_polling() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        let sub = seed_submitted(&store, "claim-1", "ext-1");
        let p = poller(store.clone(), authority);

        let callback = StatusCallback {
            submission_id: "ext-1".to_string(),
            status: "approved".to_string(),
            resolution: None,
        };
        let after = p.handle_callback(&callback).await.unwrap();
        assert_eq!(after.id, sub.id);
        assert_eq!(after.status, SubmissionStatus::Approved);

        let unknown = StatusCallback {
            submission_id: "ext-unknown".to_string(),
            status: "approved".to_string(),
            resolution: None,
        };
        assert!(matches!(
            p.handle_callback(&unknown).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_pending_sweeps_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthorityClient::new());
        seed_claim(&store, "claim-1");
        seed_claim(&store, "claim-2");
        seed_submitted(&store, "claim-1", "ext-1");
        seed_submitted(&store, "claim-2", "ext-2");
        authority.set_status(
            "ext-1",
            AuthorityStatus {
                status: "approved".to_string(),
                resolution: None,
            },
        );
        // ext-2 stays under review.
        let p = poller(store.clone(), authority);

        assert_eq!(p.poll_pending().await.unwrap(), 1);
        // The unresolved one is still awaiting status next sweep.
        assert_eq!(store.submissions_awaiting_status(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_authority_failure_propagates_without_mutation() {
        struct BrokenAuthority;

        #[async_trait]
        impl ClaimsAuthorityClient for BrokenAuthority {
            async fn submit(
                &self,
                _payload: &crate::authority::ClaimSubmissionPayload,
            ) -> Result<crate::authority::AuthoritySubmitAck, PipelineError> {
                Err(PipelineError::transient("down"))
            }

            async fn status(
                &self,
                _external_submission_id: &str,
            ) -> Result<AuthorityStatus, PipelineError> {
                Err(PipelineError::transient("status endpoint down"))
            }
        }

        let store = Arc::new(MemoryStore::new());
        seed_claim(&store, "claim-1");
        let sub = seed_submitted(&store, "claim-1", "ext-1");

        let events = Arc::new(EventBroadcaster::new(store.clone()));
        let proof = Arc::new(ProofBundleService::new(
            store.clone(),
            Arc::new(StaticRenderer),
            events.clone(),
        ));
        let p = StatusPoller::new(store.clone(), Arc::new(BrokenAuthority), proof, events, 20);

        assert!(p.check(&sub.id).await.is_err());
        assert_eq!(
            store.get_submission(&sub.id).unwrap().unwrap().status,
            SubmissionStatus::Submitted
        );
    }
}
