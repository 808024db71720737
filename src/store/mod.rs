//! Keyed record store for all pipeline entities.
//!
//! The store is the single source of truth; nothing is cached long enough to
//! become a second one. The conditional-write primitives here are what
//! enforce the pipeline's concurrency invariants:
//!
//! - `create_submission` refuses a second non-terminal submission per claim
//! - `update_submission_if_status` / `update_prompt_if_pending` are
//!   compare-and-swap transitions
//! - `create_proof_bundle` is create-if-absent per claim

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::PipelineError;
use crate::model::{
    AuditRecord, Claim, Evidence, EvidenceMatch, ProofBundle, SmartPrompt, Submission,
    SubmissionStatus,
};
use chrono::{DateTime, Utc};

pub trait ClaimStore: Send + Sync {
    fn put_claim(&self, claim: &Claim) -> Result<(), PipelineError>;
    fn get_claim(&self, claim_id: &str) -> Result<Option<Claim>, PipelineError>;

    fn put_evidence(&self, evidence: &Evidence) -> Result<(), PipelineError>;
    fn get_evidence(&self, evidence_id: &str) -> Result<Option<Evidence>, PipelineError>;
    /// Unresolved evidence whose extracted fields overlap the claim's
    /// identifying fields (order id, SKU, or amount within the date window).
    fn candidate_evidence(&self, claim: &Claim) -> Result<Vec<Evidence>, PipelineError>;
    fn mark_evidence_resolved(&self, evidence_id: &str) -> Result<(), PipelineError>;

    fn put_match(&self, evidence_match: &EvidenceMatch) -> Result<(), PipelineError>;
    fn matches_for_claim(&self, claim_id: &str) -> Result<Vec<EvidenceMatch>, PipelineError>;
    /// Auto-submit matches whose claim has no submission yet, oldest first.
    fn auto_submit_candidates(&self, limit: usize) -> Result<Vec<EvidenceMatch>, PipelineError>;

    fn put_prompt(&self, prompt: &SmartPrompt) -> Result<(), PipelineError>;
    fn get_prompt(&self, prompt_id: &str) -> Result<Option<SmartPrompt>, PipelineError>;
    /// Replace the prompt only if the stored status is still `pending`.
    /// Returns false when the guard fails (the prompt reached a terminal
    /// state concurrently).
    fn update_prompt_if_pending(&self, prompt: &SmartPrompt) -> Result<bool, PipelineError>;
    fn pending_prompt_for_evidence(
        &self,
        claim_id: &str,
        evidence_id: &str,
    ) -> Result<Option<SmartPrompt>, PipelineError>;
    fn prompts_for_claim(&self, claim_id: &str) -> Result<Vec<SmartPrompt>, PipelineError>;
    fn pending_prompts_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SmartPrompt>, PipelineError>;
    /// Pending prompts expiring before `cutoff` that have not yet received an
    /// expiring-soon notification.
    fn pending_prompts_unnotified_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SmartPrompt>, PipelineError>;
    fn mark_prompt_notified(&self, prompt_id: &str) -> Result<(), PipelineError>;

    /// Create the submission, failing with `Conflict` if the claim already
    /// has a submission in a non-terminal status.
    fn create_submission(&self, submission: &Submission) -> Result<(), PipelineError>;
    fn get_submission(&self, submission_id: &str) -> Result<Option<Submission>, PipelineError>;
    fn submission_by_external_id(
        &self,
        external_submission_id: &str,
    ) -> Result<Option<Submission>, PipelineError>;
    /// Replace the submission only if the stored status equals `expected`.
    fn update_submission_if_status(
        &self,
        submission: &Submission,
        expected: SubmissionStatus,
    ) -> Result<bool, PipelineError>;
    fn active_submission_for_claim(
        &self,
        claim_id: &str,
    ) -> Result<Option<Submission>, PipelineError>;
    fn submissions_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Submission>, PipelineError>;
    fn submissions_awaiting_status(&self, limit: usize) -> Result<Vec<Submission>, PipelineError>;

    /// Create-if-absent per claim. Returns false when a bundle already
    /// exists, which is what makes terminal-status application idempotent.
    fn create_proof_bundle(&self, bundle: &ProofBundle) -> Result<bool, PipelineError>;
    fn update_proof_bundle(&self, bundle: &ProofBundle) -> Result<(), PipelineError>;
    fn proof_bundle_for_claim(&self, claim_id: &str) -> Result<Option<ProofBundle>, PipelineError>;

    fn append_audit(&self, record: &AuditRecord) -> Result<(), PipelineError>;
    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>, PipelineError>;
}

/// Whether this evidence overlaps the claim's identifying fields at all.
/// Shared by both store implementations so candidate selection stays
/// consistent.
pub(crate) fn is_candidate(claim: &Claim, evidence: &Evidence) -> bool {
    if evidence.resolved {
        return false;
    }
    if evidence.order_id.as_deref() == Some(claim.order_id.as_str()) {
        return true;
    }
    if evidence.sku.as_deref() == Some(claim.sku.as_str()) {
        return true;
    }
    if evidence.amount_cents == Some(claim.amount_cents) {
        if let Some(date) = evidence.document_date {
            return date >= claim.window_start && date <= claim.window_end;
        }
    }
    false
}
