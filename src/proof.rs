//! Proof bundle generation for claims that reached a paid/approved outcome.
//!
//! Fire-and-forget relative to the submission engine: a rendering failure is
//! recorded on the bundle and never reverts the submission's terminal
//! status.

use crate::authority::ResolutionFields;
use crate::error::PipelineError;
use crate::events::EventBroadcaster;
use crate::model::{Claim, Evidence, ProofBundle, ProofStatus, SmartPrompt};
use crate::store::ClaimStore;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        claim: &Claim,
        evidence: &[Evidence],
        prompts: &[SmartPrompt],
        payout: Option<&ResolutionFields>,
    ) -> Result<Vec<String>, PipelineError>;
}

/// Renders a plain-text completion report to disk and returns its path as
/// the artifact reference. The production renderer is an external
/// collaborator behind the same trait.
pub struct TextRenderer {
    output_dir: PathBuf,
}

impl TextRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        TextRenderer {
            output_dir: output_dir.into(),
        }
    }

    fn build_report(
        claim: &Claim,
        evidence: &[Evidence],
        prompts: &[SmartPrompt],
        payout: Option<&ResolutionFields>,
    ) -> String {
        let mut report = String::new();

        report.push_str("CLAIM COMPLETION REPORT\n");
        report.push_str("=======================\n\n");
        report.push_str(&format!("Claim: {}\n", claim.id));
        report.push_str(&format!("Owner: {}\n", claim.owner_id));
        report.push_str(&format!("Order: {}\n", claim.order_id));
        report.push_str(&format!("SKU: {}\n", claim.sku));
        report.push_str(&format!(
            "Amount: {}.{:02}\n",
            claim.amount_cents / 100,
            claim.amount_cents % 100
        ));

        report.push_str("\nEVIDENCE:\n");
        report.push_str("=========\n");
        if evidence.is_empty() {
            report.push_str("(none on record)\n");
        }
        for item in evidence {
            report.push_str(&format!("- {} (source: {})", item.id, item.source));
            if let Some(description) = &item.description {
                report.push_str(&format!(": {description}"));
            }
            report.push('\n');
        }

        if !prompts.is_empty() {
            report.push_str("\nOWNER CONFIRMATIONS:\n");
            report.push_str("====================\n");
            for prompt in prompts {
                report.push_str(&format!(
                    "- {} [{}]",
                    prompt.question,
                    prompt.status.as_str()
                ));
                if let Some(option_id) = &prompt.selected_option {
                    if let Some(option) = prompt.option(option_id) {
                        report.push_str(&format!(" answer: {}", option.label));
                    }
                }
                report.push('\n');
            }
        }

        if let Some(payout) = payout {
            report.push_str("\nRESOLUTION:\n");
            report.push_str("===========\n");
            if let Some(outcome) = &payout.outcome {
                report.push_str(&format!("Outcome: {outcome}\n"));
            }
            if let Some(amount) = payout.payout_amount_cents {
                report.push_str(&format!("Payout: {}.{:02}\n", amount / 100, amount % 100));
            }
            if let Some(paid_at) = payout.paid_at {
                report.push_str(&format!("Paid at: {paid_at}\n"));
            }
            if let Some(reference) = &payout.reference {
                report.push_str(&format!("Reference: {reference}\n"));
            }
        }

        report.push_str(&format!(
            "\nReport generated: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ));
        report
    }
}

#[async_trait]
impl DocumentRenderer for TextRenderer {
    async fn render(
        &self,
        claim: &Claim,
        evidence: &[Evidence],
        prompts: &[SmartPrompt],
        payout: Option<&ResolutionFields>,
    ) -> Result<Vec<String>, PipelineError> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| PipelineError::Render(format!("create output directory: {e}")))?;

        let path = self
            .output_dir
            .join(format!("{}-completion-report.txt", claim.id));
        let report = Self::build_report(claim, evidence, prompts, payout);
        std::fs::write(&path, report)
            .map_err(|e| PipelineError::Render(format!("write report: {e}")))?;

        Ok(vec![path.to_string_lossy().to_string()])
    }
}

pub struct ProofBundleService {
    store: Arc<dyn ClaimStore>,
    renderer: Arc<dyn DocumentRenderer>,
    events: Arc<EventBroadcaster>,
}

impl ProofBundleService {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        renderer: Arc<dyn DocumentRenderer>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        ProofBundleService {
            store,
            renderer,
            events,
        }
    }

    /// Generate the completion proof for a claim whose submission reached a
    /// terminal success status. Returns `None` when a bundle already exists
    /// (the create-if-absent guard), which makes repeated terminal-status
    /// applications harmless.
    pub async fn on_terminal_success(
        &self,
        claim_id: &str,
        payout: Option<&ResolutionFields>,
    ) -> Result<Option<ProofBundle>, PipelineError> {
        let bundle = ProofBundle::new(claim_id);
        if !self.store.create_proof_bundle(&bundle)? {
            log::debug!("proof bundle for claim {claim_id} already exists");
            return Ok(None);
        }
        self.events.publish(
            "proof.generating",
            claim_id,
            serde_json::json!({"bundle_id": bundle.id}),
        );

        let result = self.gather_and_render(claim_id, payout).await;

        let mut finished = bundle;
        match result {
            Ok(artifact_refs) => {
                finished.status = ProofStatus::Completed;
                finished.artifact_refs = artifact_refs;
                finished.generated_at = Some(Utc::now());
                self.store.update_proof_bundle(&finished)?;
                self.events.publish(
                    "proof.completed",
                    claim_id,
                    serde_json::json!({
                        "bundle_id": finished.id,
                        "artifact_refs": finished.artifact_refs,
                    }),
                );
                log::info!(
                    "proof bundle {} completed with {} artifact(s)",
                    finished.id,
                    finished.artifact_refs.len()
                );
            }
            Err(e) => {
                finished.status = ProofStatus::Failed;
                finished.error_message = Some(e.to_string());
                self.store.update_proof_bundle(&finished)?;
                self.events.publish(
                    "proof.failed",
                    claim_id,
                    serde_json::json!({
                        "bundle_id": finished.id,
                        "error": finished.error_message,
                    }),
                );
                log::error!("proof bundle {} failed: {e}", finished.id);
            }
        }

        Ok(Some(finished))
    }

    async fn gather_and_render(
        &self,
        claim_id: &str,
        payout: Option<&ResolutionFields>,
    ) -> Result<Vec<String>, PipelineError> {
        let claim = self
            .store
            .get_claim(claim_id)?
            .ok_or_else(|| PipelineError::Render(format!("claim {claim_id} missing")))?;

        let mut evidence = Vec::new();
        for evidence_match in self.store.matches_for_claim(claim_id)? {
            if let Some(item) = self.store.get_evidence(&evidence_match.evidence_id)? {
                evidence.push(item);
            }
        }
        let prompts = self.store.prompts_for_claim(claim_id)?;

        self.renderer
            .render(&claim, &evidence, &prompts, payout)
            .await
    }
}
