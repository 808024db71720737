//! In-memory store used by tests and demo runs.
//!
//! All conditional writes happen under one lock, which gives the same
//! atomicity the sqlite backend gets from conditional SQL.

use super::{is_candidate, ClaimStore};
use crate::error::PipelineError;
use crate::model::{
    AuditRecord, Claim, Evidence, EvidenceMatch, ProofBundle, PromptStatus, SmartPrompt,
    Submission, SubmissionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    claims: HashMap<String, Claim>,
    evidence: HashMap<String, Evidence>,
    matches: Vec<EvidenceMatch>,
    prompts: HashMap<String, SmartPrompt>,
    submissions: HashMap<String, Submission>,
    bundles: HashMap<String, ProofBundle>,
    audit: Vec<AuditRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, PipelineError> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::store("memory store lock poisoned"))
    }
}

impl ClaimStore for MemoryStore {
    fn put_claim(&self, claim: &Claim) -> Result<(), PipelineError> {
        self.lock()?.claims.insert(claim.id.clone(), claim.clone());
        Ok(())
    }

    fn get_claim(&self, claim_id: &str) -> Result<Option<Claim>, PipelineError> {
        Ok(self.lock()?.claims.get(claim_id).cloned())
    }

    fn put_evidence(&self, evidence: &Evidence) -> Result<(), PipelineError> {
        self.lock()?
            .evidence
            .insert(evidence.id.clone(), evidence.clone());
        Ok(())
    }

    fn get_evidence(&self, evidence_id: &str) -> Result<Option<Evidence>, PipelineError> {
        Ok(self.lock()?.evidence.get(evidence_id).cloned())
    }

    fn candidate_evidence(&self, claim: &Claim) -> Result<Vec<Evidence>, PipelineError> {
        let inner = self.lock()?;
        let mut candidates: Vec<Evidence> = inner
            .evidence
            .values()
            .filter(|ev| is_candidate(claim, ev))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(candidates)
    }

    fn mark_evidence_resolved(&self, evidence_id: &str) -> Result<(), PipelineError> {
        let mut inner = self.lock()?;
        match inner.evidence.get_mut(evidence_id) {
            Some(ev) => {
                ev.resolved = true;
                Ok(())
            }
            None => Err(PipelineError::not_found(format!(
                "evidence {evidence_id}"
            ))),
        }
    }

    fn put_match(&self, evidence_match: &EvidenceMatch) -> Result<(), PipelineError> {
        self.lock()?.matches.push(evidence_match.clone());
        Ok(())
    }

    fn matches_for_claim(&self, claim_id: &str) -> Result<Vec<EvidenceMatch>, PipelineError> {
        Ok(self
            .lock()?
            .matches
            .iter()
            .filter(|m| m.claim_id == claim_id)
            .cloned()
            .collect())
    }

    fn auto_submit_candidates(&self, limit: usize) -> Result<Vec<EvidenceMatch>, PipelineError> {
        let inner = self.lock()?;
        let submitted_claims: std::collections::HashSet<&str> = inner
            .submissions
            .values()
            .map(|s| s.claim_id.as_str())
            .collect();
        Ok(inner
            .matches
            .iter()
            .filter(|m| {
                m.action == crate::model::MatchAction::AutoSubmit
                    && !submitted_claims.contains(m.claim_id.as_str())
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn put_prompt(&self, prompt: &SmartPrompt) -> Result<(), PipelineError> {
        self.lock()?
            .prompts
            .insert(prompt.id.clone(), prompt.clone());
        Ok(())
    }

    fn get_prompt(&self, prompt_id: &str) -> Result<Option<SmartPrompt>, PipelineError> {
        Ok(self.lock()?.prompts.get(prompt_id).cloned())
    }

    fn update_prompt_if_pending(&self, prompt: &SmartPrompt) -> Result<bool, PipelineError> {
        let mut inner = self.lock()?;
        match inner.prompts.get_mut(&prompt.id) {
            Some(stored) if stored.status == PromptStatus::Pending => {
                *stored = prompt.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PipelineError::not_found(format!("prompt {}", prompt.id))),
        }
    }

    fn pending_prompt_for_evidence(
        &self,
        claim_id: &str,
        evidence_id: &str,
    ) -> Result<Option<SmartPrompt>, PipelineError> {
        Ok(self
            .lock()?
            .prompts
            .values()
            .find(|p| {
                p.status == PromptStatus::Pending
                    && p.claim_id == claim_id
                    && p.evidence_id == evidence_id
            })
            .cloned())
    }

    fn prompts_for_claim(&self, claim_id: &str) -> Result<Vec<SmartPrompt>, PipelineError> {
        let mut prompts: Vec<SmartPrompt> = self
            .lock()?
            .prompts
            .values()
            .filter(|p| p.claim_id == claim_id)
            .cloned()
            .collect();
        prompts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(prompts)
    }

    fn pending_prompts_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SmartPrompt>, PipelineError> {
        Ok(self
            .lock()?
            .prompts
            .values()
            .filter(|p| p.status == PromptStatus::Pending && p.expires_at <= cutoff)
            .cloned()
            .collect())
    }

    fn pending_prompts_unnotified_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SmartPrompt>, PipelineError> {
        Ok(self
            .lock()?
            .prompts
            .values()
            .filter(|p| {
                p.status == PromptStatus::Pending && !p.expiring_notified && p.expires_at <= cutoff
            })
            .cloned()
            .collect())
    }

    fn mark_prompt_notified(&self, prompt_id: &str) -> Result<(), PipelineError> {
        let mut inner = self.lock()?;
        match inner.prompts.get_mut(prompt_id) {
            Some(p) => {
                p.expiring_notified = true;
                Ok(())
            }
            None => Err(PipelineError::not_found(format!("prompt {prompt_id}"))),
        }
    }

    fn create_submission(&self, submission: &Submission) -> Result<(), PipelineError> {
        let mut inner = self.lock()?;
        let active_exists = inner
            .submissions
            .values()
            .any(|s| s.claim_id == submission.claim_id && !s.status.is_terminal());
        if active_exists {
            return Err(PipelineError::conflict(format!(
                "claim {} already has an active submission",
                submission.claim_id
            )));
        }
        inner
            .submissions
            .insert(submission.id.clone(), submission.clone());
        Ok(())
    }

    fn get_submission(&self, submission_id: &str) -> Result<Option<Submission>, PipelineError> {
        Ok(self.lock()?.submissions.get(submission_id).cloned())
    }

    fn submission_by_external_id(
        &self,
        external_submission_id: &str,
    ) -> Result<Option<Submission>, PipelineError> {
        Ok(self
            .lock()?
            .submissions
            .values()
            .find(|s| s.external_submission_id.as_deref() == Some(external_submission_id))
            .cloned())
    }

    fn update_submission_if_status(
        &self,
        submission: &Submission,
        expected: SubmissionStatus,
    ) -> Result<bool, PipelineError> {
        let mut inner = self.lock()?;
        match inner.submissions.get_mut(&submission.id) {
            Some(stored) if stored.status == expected => {
                *stored = submission.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PipelineError::not_found(format!(
                "submission {}",
                submission.id
            ))),
        }
    }

    fn active_submission_for_claim(
        &self,
        claim_id: &str,
    ) -> Result<Option<Submission>, PipelineError> {
        Ok(self
            .lock()?
            .submissions
            .values()
            .find(|s| s.claim_id == claim_id && !s.status.is_terminal())
            .cloned())
    }

    fn submissions_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Submission>, PipelineError> {
        let inner = self.lock()?;
        let mut due: Vec<Submission> = inner
            .submissions
            .values()
            .filter(|s| {
                s.status == SubmissionStatus::Retrying
                    && s.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        due.truncate(limit);
        Ok(due)
    }

    fn submissions_awaiting_status(&self, limit: usize) -> Result<Vec<Submission>, PipelineError> {
        let inner = self.lock()?;
        let mut waiting: Vec<Submission> = inner
            .submissions
            .values()
            .filter(|s| s.status == SubmissionStatus::Submitted)
            .cloned()
            .collect();
        waiting.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        waiting.truncate(limit);
        Ok(waiting)
    }

    fn create_proof_bundle(&self, bundle: &ProofBundle) -> Result<bool, PipelineError> {
        let mut inner = self.lock()?;
        if inner.bundles.contains_key(&bundle.claim_id) {
            return Ok(false);
        }
        inner
            .bundles
            .insert(bundle.claim_id.clone(), bundle.clone());
        Ok(true)
    }

    fn update_proof_bundle(&self, bundle: &ProofBundle) -> Result<(), PipelineError> {
        self.lock()?
            .bundles
            .insert(bundle.claim_id.clone(), bundle.clone());
        Ok(())
    }

    fn proof_bundle_for_claim(&self, claim_id: &str) -> Result<Option<ProofBundle>, PipelineError> {
        Ok(self.lock()?.bundles.get(claim_id).cloned())
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), PipelineError> {
        self.lock()?.audit.push(record.clone());
        Ok(())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>, PipelineError> {
        let inner = self.lock()?;
        Ok(inner.audit.iter().rev().take(limit).cloned().collect())
    }
}
