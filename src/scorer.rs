//! Scoring seam for evidence/claim match confidence.
//!
//! The production scorer is an external collaborator; the pipeline only
//! depends on this trait. `FieldOverlapScorer` is the bundled deterministic
//! implementation used by tests and demo runs.

use crate::error::PipelineError;
use crate::model::{Claim, Evidence};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy)]
pub struct ScorePair {
    pub rule_score: f64,
    pub ml_score: f64,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, claim: &Claim, evidence: &Evidence) -> Result<ScorePair, PipelineError>;
}

/// Names of the claim fields an evidence candidate can overlap on.
pub const MATCHABLE_FIELDS: [&str; 4] = ["order_id", "sku", "amount", "date_window"];

/// Compute which identifying fields of the claim this evidence agrees with.
pub fn matched_fields(claim: &Claim, evidence: &Evidence) -> Vec<String> {
    let mut fields = Vec::new();

    if evidence.order_id.as_deref() == Some(claim.order_id.as_str()) {
        fields.push("order_id".to_string());
    }
    if evidence.sku.as_deref() == Some(claim.sku.as_str()) {
        fields.push("sku".to_string());
    }
    if evidence.amount_cents == Some(claim.amount_cents) {
        fields.push("amount".to_string());
    }
    if let Some(date) = evidence.document_date {
        if date >= claim.window_start && date <= claim.window_end {
            fields.push("date_window".to_string());
        }
    }

    fields
}

/// Deterministic scorer built on field overlap. The rule score is the
/// fraction of matchable fields that agree; the ml proxy smooths that toward
/// a 0.5 prior so neither component saturates on its own.
pub struct FieldOverlapScorer;

#[async_trait]
impl Scorer for FieldOverlapScorer {
    async fn score(&self, claim: &Claim, evidence: &Evidence) -> Result<ScorePair, PipelineError> {
        let matched = matched_fields(claim, evidence).len() as f64;
        let total = MATCHABLE_FIELDS.len() as f64;
        let rule_score = matched / total;
        let ml_score = 0.5 + (rule_score - 0.5) * 0.9;
        Ok(ScorePair {
            rule_score,
            ml_score,
        })
    }
}

/// A scorer that always fails. Used in tests to exercise per-candidate
/// failure isolation in the matcher.
#[cfg(test)]
pub struct FailingScorer;

#[cfg(test)]
#[async_trait]
impl Scorer for FailingScorer {
    async fn score(&self, _claim: &Claim, _evidence: &Evidence) -> Result<ScorePair, PipelineError> {
        Err(PipelineError::Scorer("scorer unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClaimState;
    use chrono::{Duration, Utc};

    fn claim() -> Claim {
        let now = Utc::now();
        Claim {
            id: "claim-1".to_string(),
            owner_id: "owner-1".to_string(),
            order_id: "ord-100".to_string(),
            sku: "SKU-7".to_string(),
            amount_cents: 4599,
            window_start: now - Duration::days(30),
            window_end: now,
            state: ClaimState::Open,
            created_at: now,
        }
    }

    fn evidence_matching_all() -> Evidence {
        Evidence {
            id: "ev-1".to_string(),
            source: "inbox".to_string(),
            order_id: Some("ord-100".to_string()),
            sku: Some("SKU-7".to_string()),
            amount_cents: Some(4599),
            document_date: Some(Utc::now() - Duration::days(3)),
            description: None,
            resolved: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_matched_fields_full_overlap() {
        let fields = matched_fields(&claim(), &evidence_matching_all());
        assert_eq!(fields, vec!["order_id", "sku", "amount", "date_window"]);
    }

    #[test]
    fn test_matched_fields_partial_overlap() {
        let mut ev = evidence_matching_all();
        ev.sku = Some("OTHER".to_string());
        ev.document_date = None;
        let fields = matched_fields(&claim(), &ev);
        assert_eq!(fields, vec!["order_id", "amount"]);
    }

    #[test]
    fn test_matched_fields_outside_date_window() {
        let mut ev = evidence_matching_all();
        ev.document_date = Some(Utc::now() - Duration::days(365));
        let fields = matched_fields(&claim(), &ev);
        assert!(!fields.contains(&"date_window".to_string()));
    }

    #[tokio::test]
    async fn test_overlap_scorer_scales_with_matches() {
        let scorer = FieldOverlapScorer;
        let full = scorer.score(&claim(), &evidence_matching_all()).await.unwrap();
        assert_eq!(full.rule_score, 1.0);
        assert!(full.ml_score > 0.9);

        let mut ev = evidence_matching_all();
        ev.order_id = None;
        ev.sku = None;
        ev.amount_cents = None;
        ev.document_date = None;
        let none = scorer.score(&claim(), &ev).await.unwrap();
        assert_eq!(none.rule_score, 0.0);
        assert!(none.ml_score < 0.1);
    }
}
