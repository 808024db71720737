//! Smart prompt lifecycle: disambiguation questions shown to the claim owner
//! when a match lands between the routing thresholds.
//!
//! Status machine: `pending -> answered | dismissed | cancelled | expired`.
//! Every terminal state is final; attempts to mutate a terminal prompt fail
//! with a conflict. Expiry is applied lazily on answer and by the background
//! sweep, whichever observes it first.

use crate::config::PromptConfig;
use crate::error::PipelineError;
use crate::events::EventBroadcaster;
use crate::model::{new_id, MatchAction, PromptOption, PromptStatus, SmartPrompt};
use crate::store::ClaimStore;
use chrono::{Duration, Utc};
use std::sync::Arc;

/// The outcome handed back to the pipeline after a successful answer, ready
/// to re-enter the decision router.
#[derive(Debug, Clone)]
pub struct PromptAnswer {
    pub prompt: SmartPrompt,
    pub action: MatchAction,
    pub implied_confidence: f64,
}

pub struct PromptManager {
    store: Arc<dyn ClaimStore>,
    events: Arc<EventBroadcaster>,
    config: PromptConfig,
}

impl PromptManager {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        events: Arc<EventBroadcaster>,
        config: PromptConfig,
    ) -> Self {
        PromptManager {
            store,
            events,
            config,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::hours(self.config.default_ttl_hours)
    }

    pub fn create(
        &self,
        claim_id: &str,
        evidence_id: &str,
        question: &str,
        options: Vec<PromptOption>,
        ttl: Duration,
    ) -> Result<SmartPrompt, PipelineError> {
        if options.is_empty() {
            return Err(PipelineError::validation(
                "a prompt needs at least one option",
            ));
        }
        if ttl <= Duration::zero() {
            return Err(PipelineError::validation("prompt TTL must be positive"));
        }
        if self.store.get_claim(claim_id)?.is_none() {
            return Err(PipelineError::not_found(format!("claim {claim_id}")));
        }

        let now = Utc::now();
        let prompt = SmartPrompt {
            id: new_id("prompt"),
            claim_id: claim_id.to_string(),
            evidence_id: evidence_id.to_string(),
            question: question.to_string(),
            options,
            status: PromptStatus::Pending,
            selected_option: None,
            expires_at: now + ttl,
            created_at: now,
            answered_at: None,
            expiring_notified: false,
        };
        self.store.put_prompt(&prompt)?;
        self.events.publish(
            "prompt.created",
            claim_id,
            serde_json::json!({
                "prompt_id": prompt.id,
                "evidence_id": evidence_id,
                "expires_at": prompt.expires_at,
            }),
        );
        log::info!("created prompt {} for claim {claim_id}", prompt.id);
        Ok(prompt)
    }

    /// Record the owner's answer. Fails with `NotFound` if the prompt is
    /// missing, `Conflict` if it already reached a terminal state, and
    /// `Expired` (flipping the status on the way) if its TTL has passed.
    pub fn answer(
        &self,
        prompt_id: &str,
        option_id: &str,
        actor: &str,
    ) -> Result<PromptAnswer, PipelineError> {
        let prompt = self
            .store
            .get_prompt(prompt_id)?
            .ok_or_else(|| PipelineError::not_found(format!("prompt {prompt_id}")))?;

        if prompt.status != PromptStatus::Pending {
            return Err(PipelineError::conflict(format!(
                "prompt {prompt_id} is already {}",
                prompt.status.as_str()
            )));
        }

        let now = Utc::now();
        if now > prompt.expires_at {
            // Lazy expiry: flip the status now rather than waiting for the
            // sweep. Losing the CAS means the sweep got there first.
            let mut expired = prompt.clone();
            expired.status = PromptStatus::Expired;
            if self.store.update_prompt_if_pending(&expired)? {
                self.events.publish(
                    "prompt.expired",
                    &expired.claim_id,
                    serde_json::json!({"prompt_id": prompt_id}),
                );
            }
            return Err(PipelineError::Expired(format!(
                "prompt {prompt_id} expired at {}",
                prompt.expires_at
            )));
        }

        let option = prompt
            .option(option_id)
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "prompt {prompt_id} has no option {option_id}"
                ))
            })?
            .clone();

        let mut answered = prompt.clone();
        answered.status = PromptStatus::Answered;
        answered.selected_option = Some(option.id.clone());
        answered.answered_at = Some(now);

        if !self.store.update_prompt_if_pending(&answered)? {
            return Err(PipelineError::conflict(format!(
                "prompt {prompt_id} was resolved concurrently"
            )));
        }

        self.events.publish(
            "prompt.answered",
            &answered.claim_id,
            serde_json::json!({
                "prompt_id": prompt_id,
                "option_id": option.id,
                "actor": actor,
                "implied_confidence": option.implied_confidence,
            }),
        );
        log::info!(
            "prompt {prompt_id} answered by {actor} with option {} (implied {:.2})",
            option.id,
            option.implied_confidence
        );

        Ok(PromptAnswer {
            prompt: answered,
            action: option.action,
            implied_confidence: option.implied_confidence,
        })
    }

    pub fn dismiss(&self, prompt_id: &str, actor: &str) -> Result<SmartPrompt, PipelineError> {
        self.finish(prompt_id, actor, PromptStatus::Dismissed, "prompt.dismissed")
    }

    pub fn cancel(&self, prompt_id: &str, actor: &str) -> Result<SmartPrompt, PipelineError> {
        self.finish(prompt_id, actor, PromptStatus::Cancelled, "prompt.cancelled")
    }

    fn finish(
        &self,
        prompt_id: &str,
        actor: &str,
        status: PromptStatus,
        event_type: &str,
    ) -> Result<SmartPrompt, PipelineError> {
        let prompt = self
            .store
            .get_prompt(prompt_id)?
            .ok_or_else(|| PipelineError::not_found(format!("prompt {prompt_id}")))?;

        if prompt.status != PromptStatus::Pending {
            return Err(PipelineError::conflict(format!(
                "prompt {prompt_id} is already {}",
                prompt.status.as_str()
            )));
        }

        let mut updated = prompt.clone();
        updated.status = status;
        if !self.store.update_prompt_if_pending(&updated)? {
            return Err(PipelineError::conflict(format!(
                "prompt {prompt_id} was resolved concurrently"
            )));
        }

        self.events.publish(
            event_type,
            &updated.claim_id,
            serde_json::json!({"prompt_id": prompt_id, "actor": actor}),
        );
        Ok(updated)
    }

    /// Flip every pending prompt past its expiry. Runs on a fixed interval,
    /// independent of request traffic.
    pub fn sweep_expired(&self) -> Result<usize, PipelineError> {
        let now = Utc::now();
        let mut flipped = 0;
        for prompt in self.store.pending_prompts_expiring_before(now)? {
            let mut expired = prompt.clone();
            expired.status = PromptStatus::Expired;
            if self.store.update_prompt_if_pending(&expired)? {
                self.events.publish(
                    "prompt.expired",
                    &expired.claim_id,
                    serde_json::json!({"prompt_id": expired.id}),
                );
                flipped += 1;
            }
        }
        if flipped > 0 {
            log::info!("expired {flipped} prompt(s)");
        }
        Ok(flipped)
    }

    /// Notification-only pass: warn owners about prompts nearing expiry
    /// without mutating prompt status.
    pub fn sweep_expiring_soon(&self) -> Result<usize, PipelineError> {
        let now = Utc::now();
        let cutoff = now + Duration::hours(self.config.expiring_soon_hours);
        let mut notified = 0;
        for prompt in self.store.pending_prompts_unnotified_before(cutoff)? {
            if prompt.expires_at <= now {
                // Already past expiry; leave it for the expiry sweep.
                continue;
            }
            self.store.mark_prompt_notified(&prompt.id)?;
            self.events.publish(
                "prompt.expiring_soon",
                &prompt.claim_id,
                serde_json::json!({
                    "prompt_id": prompt.id,
                    "expires_at": prompt.expires_at,
                }),
            );
            notified += 1;
        }
        Ok(notified)
    }
}
