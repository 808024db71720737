//! Service facade: every component constructed once at process start and
//! shared by reference, so request handlers and background schedulers see
//! the same explicit services and tests can swap any collaborator.

use crate::authority::{ClaimsAuthorityClient, HttpAuthorityClient, MockAuthorityClient};
use crate::config::Config;
use crate::error::PipelineError;
use crate::events::{EventBroadcaster, PipelineEvent};
use crate::matcher::EvidenceMatcher;
use crate::model::{
    AuditRecord, EvidenceMatch, MatchAction, ProofBundle, PromptOption, SmartPrompt, Submission,
};
use crate::poller::{StatusCallback, StatusPoller};
use crate::prompt::PromptManager;
use crate::proof::{DocumentRenderer, ProofBundleService, TextRenderer};
use crate::rate_limit::RateLimiter;
use crate::router;
use crate::scorer::{FieldOverlapScorer, Scorer};
use crate::store::{ClaimStore, MemoryStore, SqliteStore};
use chrono::Duration;
use std::sync::Arc;

/// Result of answering a prompt: the terminal prompt plus the submission the
/// answer may have triggered.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub prompt: SmartPrompt,
    pub submission: Option<Submission>,
}

pub struct Pipeline {
    config: Config,
    store: Arc<dyn ClaimStore>,
    events: Arc<EventBroadcaster>,
    matcher: EvidenceMatcher,
    prompts: PromptManager,
    engine: crate::submission::SubmissionEngine,
    poller: StatusPoller,
}

impl Pipeline {
    /// Build the whole pipeline from configuration, selecting the store
    /// backend and the real or mock authority client.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        let store: Arc<dyn ClaimStore> = match config.store.backend.as_str() {
            "memory" => Arc::new(MemoryStore::new()),
            _ => Arc::new(SqliteStore::new(&config.store.path)?),
        };

        let authority: Arc<dyn ClaimsAuthorityClient> = if config.authority.use_mock {
            log::warn!("authority.use_mock is set; submissions go to the mock client");
            Arc::new(MockAuthorityClient::new())
        } else {
            Arc::new(HttpAuthorityClient::new(&config.authority)?)
        };

        let renderer = Arc::new(TextRenderer::new(&config.proof.output_dir));
        Self::with_collaborators(config, store, Arc::new(FieldOverlapScorer), authority, renderer)
    }

    /// Explicit-collaborator constructor: the seam tests and the demo use to
    /// inject doubles.
    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn ClaimStore>,
        scorer: Arc<dyn Scorer>,
        authority: Arc<dyn ClaimsAuthorityClient>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Result<Self, PipelineError> {
        let events = Arc::new(EventBroadcaster::new(store.clone()));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        let matcher = EvidenceMatcher::new(
            store.clone(),
            scorer,
            config.scoring.clone(),
            config.router.clone(),
            events.clone(),
        );
        let prompts = PromptManager::new(store.clone(), events.clone(), config.prompts.clone());
        let engine = crate::submission::SubmissionEngine::new(
            store.clone(),
            authority.clone(),
            limiter,
            config.retry.clone(),
            config.submission.clone(),
            events.clone(),
        );
        let proof = Arc::new(ProofBundleService::new(
            store.clone(),
            renderer,
            events.clone(),
        ));
        let poller = StatusPoller::new(
            store.clone(),
            authority,
            proof,
            events.clone(),
            config.poller.batch_size,
        );

        Ok(Pipeline {
            config,
            store,
            events,
            matcher,
            prompts,
            engine,
            poller,
        })
    }

    /// Match evidence for a claim and enqueue the downstream work each
    /// action implies: auto-submit matches go straight to the submission
    /// engine, prompt-band matches get a disambiguation prompt, manual
    /// review matches are left for an operator.
    pub async fn match_evidence(
        &self,
        claim_id: &str,
    ) -> Result<Vec<EvidenceMatch>, PipelineError> {
        let matches = self.matcher.match_claim(claim_id).await?;

        for evidence_match in &matches {
            match evidence_match.action {
                MatchAction::AutoSubmit => {
                    match self
                        .engine
                        .submit(
                            claim_id,
                            vec![evidence_match.evidence_id.clone()],
                            evidence_match.final_confidence,
                        )
                        .await
                    {
                        Ok(_) => {}
                        Err(PipelineError::Conflict(_)) => {
                            log::debug!(
                                "claim {claim_id} already has an active submission; skipping"
                            );
                        }
                        Err(e) => {
                            log::warn!("auto-submission for claim {claim_id} failed: {e}");
                        }
                    }
                }
                MatchAction::SmartPrompt => {
                    if self
                        .store
                        .pending_prompt_for_evidence(claim_id, &evidence_match.evidence_id)?
                        .is_some()
                    {
                        log::debug!(
                            "pending prompt already exists for evidence {}",
                            evidence_match.evidence_id
                        );
                        continue;
                    }
                    self.prompts.create(
                        claim_id,
                        &evidence_match.evidence_id,
                        "We found a document that may match this claim. Is it yours?",
                        default_prompt_options(),
                        self.prompts.default_ttl(),
                    )?;
                }
                MatchAction::ManualReview => {}
            }
        }

        Ok(matches)
    }

    pub fn create_prompt(
        &self,
        claim_id: &str,
        evidence_id: &str,
        question: &str,
        options: Vec<PromptOption>,
        ttl_hours: Option<i64>,
    ) -> Result<SmartPrompt, PipelineError> {
        let ttl = ttl_hours
            .map(Duration::hours)
            .unwrap_or_else(|| self.prompts.default_ttl());
        self.prompts
            .create(claim_id, evidence_id, question, options, ttl)
    }

    /// Answer a prompt and re-enter the decision router with the option's
    /// implied confidence. Only the auto-submit and manual-review branches
    /// apply here; an answer never creates another prompt.
    pub async fn answer_prompt(
        &self,
        prompt_id: &str,
        option_id: &str,
        actor: &str,
    ) -> Result<PromptOutcome, PipelineError> {
        let answer = self.prompts.answer(prompt_id, option_id, actor)?;
        let claim_id = answer.prompt.claim_id.clone();
        let evidence_id = answer.prompt.evidence_id.clone();

        if answer.action == MatchAction::ManualReview {
            self.events.publish(
                "claim.manual_review",
                &claim_id,
                serde_json::json!({"prompt_id": prompt_id, "reason": "owner answer"}),
            );
            return Ok(PromptOutcome {
                prompt: answer.prompt,
                submission: None,
            });
        }

        let claim = self
            .store
            .get_claim(&claim_id)?
            .ok_or_else(|| PipelineError::not_found(format!("claim {claim_id}")))?;

        // The owner vouched for the overlap, so only the confidence decides
        // between submission and manual review.
        let routed = router::route(
            &self.config.router,
            answer.implied_confidence,
            1,
            claim.state,
        );
        let submission = if routed == MatchAction::AutoSubmit {
            match self
                .engine
                .submit(&claim_id, vec![evidence_id], answer.implied_confidence)
                .await
            {
                Ok(submission) => Some(submission),
                Err(PipelineError::Conflict(_)) => {
                    log::debug!("claim {claim_id} already has an active submission");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            self.events.publish(
                "claim.manual_review",
                &claim_id,
                serde_json::json!({
                    "prompt_id": prompt_id,
                    "implied_confidence": answer.implied_confidence,
                }),
            );
            None
        };

        Ok(PromptOutcome {
            prompt: answer.prompt,
            submission,
        })
    }

    pub fn dismiss_prompt(&self, prompt_id: &str, actor: &str) -> Result<SmartPrompt, PipelineError> {
        self.prompts.dismiss(prompt_id, actor)
    }

    pub fn cancel_prompt(&self, prompt_id: &str, actor: &str) -> Result<SmartPrompt, PipelineError> {
        self.prompts.cancel(prompt_id, actor)
    }

    /// Operator-triggered submission: drive the strongest recorded match for
    /// the claim.
    pub async fn submit(&self, claim_id: &str) -> Result<Submission, PipelineError> {
        let matches = self.store.matches_for_claim(claim_id)?;
        let best = matches
            .into_iter()
            .filter(|m| m.action != MatchAction::ManualReview)
            .max_by(|a, b| {
                a.final_confidence
                    .partial_cmp(&b.final_confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "claim {claim_id} has no submittable evidence match"
                ))
            })?;

        self.engine
            .submit(claim_id, vec![best.evidence_id], best.final_confidence)
            .await
    }

    pub async fn check_status(&self, submission_id: &str) -> Result<Submission, PipelineError> {
        self.poller.check(submission_id).await
    }

    pub async fn handle_status_callback(
        &self,
        callback: &StatusCallback,
    ) -> Result<Submission, PipelineError> {
        self.poller.handle_callback(callback).await
    }

    pub fn get_proof_bundle(&self, claim_id: &str) -> Result<ProofBundle, PipelineError> {
        self.store
            .proof_bundle_for_claim(claim_id)?
            .ok_or_else(|| PipelineError::not_found(format!("proof bundle for claim {claim_id}")))
    }

    pub fn subscribe(&self, subject_id: &str) -> tokio::sync::mpsc::UnboundedReceiver<PipelineEvent> {
        self.events.subscribe(subject_id)
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>, PipelineError> {
        self.store.recent_audit(limit)
    }

    pub fn store(&self) -> Arc<dyn ClaimStore> {
        self.store.clone()
    }

    // Scheduler entry points.

    pub fn sweep_prompts(&self) -> Result<(usize, usize), PipelineError> {
        let expired = self.prompts.sweep_expired()?;
        let notified = self.prompts.sweep_expiring_soon()?;
        Ok((expired, notified))
    }

    pub async fn retry_due(&self) -> Result<usize, PipelineError> {
        self.engine.retry_due().await
    }

    /// Under-fetch up to twice the batch size and let the engine re-check
    /// each candidate, tolerating races with concurrent batch runs.
    pub async fn run_submission_batch(&self) -> Result<usize, PipelineError> {
        let candidates = self
            .store
            .auto_submit_candidates(self.config.submission.batch_size * 2)?;
        if candidates.is_empty() {
            return Ok(0);
        }
        self.engine.process_batch(candidates).await
    }

    pub async fn poll_pending(&self) -> Result<usize, PipelineError> {
        self.poller.poll_pending().await
    }
}

fn default_prompt_options() -> Vec<PromptOption> {
    vec![
        PromptOption {
            id: "confirm".to_string(),
            label: "Yes, this is my order".to_string(),
            action: MatchAction::AutoSubmit,
            implied_confidence: 0.95,
        },
        PromptOption {
            id: "unsure".to_string(),
            label: "I'm not sure".to_string(),
            action: MatchAction::ManualReview,
            implied_confidence: 0.4,
        },
        PromptOption {
            id: "deny".to_string(),
            label: "No, this is something else".to_string(),
            action: MatchAction::ManualReview,
            implied_confidence: 0.05,
        },
    ]
}
