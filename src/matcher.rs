//! Evidence matching: score every unresolved candidate for a claim and stamp
//! each with a routed action.

use crate::config::{RouterConfig, ScoringConfig};
use crate::error::PipelineError;
use crate::events::EventBroadcaster;
use crate::model::{new_id, EvidenceMatch, MatchAction};
use crate::router;
use crate::scorer::{matched_fields, Scorer};
use crate::store::ClaimStore;
use chrono::Utc;
use std::sync::Arc;

pub struct EvidenceMatcher {
    store: Arc<dyn ClaimStore>,
    scorer: Arc<dyn Scorer>,
    scoring: ScoringConfig,
    router: RouterConfig,
    events: Arc<EventBroadcaster>,
}

impl EvidenceMatcher {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        scorer: Arc<dyn Scorer>,
        scoring: ScoringConfig,
        router: RouterConfig,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        EvidenceMatcher {
            store,
            scorer,
            scoring,
            router,
            events,
        }
    }

    fn combine(&self, rule_score: f64, ml_score: f64) -> f64 {
        let combined =
            self.scoring.rule_weight * rule_score + self.scoring.ml_weight * ml_score;
        combined.clamp(0.0, 1.0)
    }

    /// Score every unresolved evidence candidate for the claim and persist an
    /// `EvidenceMatch` per candidate. A scorer failure degrades that single
    /// candidate to manual review instead of aborting the batch.
    pub async fn match_claim(&self, claim_id: &str) -> Result<Vec<EvidenceMatch>, PipelineError> {
        let claim = self
            .store
            .get_claim(claim_id)?
            .ok_or_else(|| PipelineError::not_found(format!("claim {claim_id}")))?;

        let candidates = self.store.candidate_evidence(&claim)?;
        log::info!(
            "matching claim {claim_id}: {} candidate(s)",
            candidates.len()
        );

        let mut matches = Vec::with_capacity(candidates.len());
        for evidence in candidates {
            let fields = matched_fields(&claim, &evidence);

            let (rule_score, ml_score, final_confidence, action) =
                match self.scorer.score(&claim, &evidence).await {
                    Ok(scores) => {
                        let confidence = self.combine(scores.rule_score, scores.ml_score);
                        let action =
                            router::route(&self.router, confidence, fields.len(), claim.state);
                        (scores.rule_score, scores.ml_score, confidence, action)
                    }
                    Err(e) => {
                        log::warn!(
                            "scorer failed for evidence {} on claim {claim_id}: {e}; \
                             degrading to manual review",
                            evidence.id
                        );
                        (0.0, 0.0, 0.0, MatchAction::ManualReview)
                    }
                };

            let evidence_match = EvidenceMatch {
                id: new_id("match"),
                claim_id: claim.id.clone(),
                evidence_id: evidence.id.clone(),
                rule_score,
                ml_score,
                final_confidence,
                matched_fields: fields,
                action,
                created_at: Utc::now(),
            };
            self.store.put_match(&evidence_match)?;
            self.events.publish(
                "match.created",
                &claim.id,
                serde_json::json!({
                    "match_id": evidence_match.id,
                    "evidence_id": evidence_match.evidence_id,
                    "confidence": evidence_match.final_confidence,
                    "action": evidence_match.action.as_str(),
                }),
            );
            log::debug!(
                "evidence {} scored {:.3} -> {}",
                evidence_match.evidence_id,
                evidence_match.final_confidence,
                evidence_match.action.as_str()
            );
            matches.push(evidence_match);
        }

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Claim, ClaimState, Evidence};
    use crate::scorer::{FailingScorer, FieldOverlapScorer};
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn scoring() -> ScoringConfig {
        ScoringConfig {
            rule_weight: 0.4,
            ml_weight: 0.6,
        }
    }

    fn router_config() -> RouterConfig {
        RouterConfig {
            auto_threshold: 0.85,
            prompt_threshold: 0.50,
        }
    }

    fn seed_claim(store: &MemoryStore) -> Claim {
        let now = Utc::now();
        let claim = Claim {
            id: "claim-1".to_string(),
            owner_id: "owner-1".to_string(),
            order_id: "ord-1".to_string(),
            sku: "SKU-1".to_string(),
            amount_cents: 2500,
            window_start: now - Duration::days(30),
            window_end: now,
            state: ClaimState::Open,
            created_at: now,
        };
        store.put_claim(&claim).unwrap();
        claim
    }

    fn seed_evidence(store: &MemoryStore, id: &str, order_id: Option<&str>) {
        store
            .put_evidence(&Evidence {
                id: id.to_string(),
                source: "inbox".to_string(),
                order_id: order_id.map(|s| s.to_string()),
                sku: Some("SKU-1".to_string()),
                amount_cents: Some(2500),
                document_date: Some(Utc::now() - Duration::days(2)),
                description: None,
                resolved: false,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    fn matcher(store: Arc<MemoryStore>, scorer: Arc<dyn Scorer>) -> EvidenceMatcher {
        let events = Arc::new(EventBroadcaster::new(store.clone()));
        EvidenceMatcher::new(store, scorer, scoring(), router_config(), events)
    }

    #[tokio::test]
    async fn test_full_overlap_routes_to_auto_submit() {
        let store = Arc::new(MemoryStore::new());
        seed_claim(&store);
        seed_evidence(&store, "ev-1", Some("ord-1"));

        let m = matcher(store.clone(), Arc::new(FieldOverlapScorer));
        let matches = m.match_claim("claim-1").await.unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].action, MatchAction::AutoSubmit);
        assert!(matches[0].final_confidence >= 0.85);
        assert_eq!(matches[0].matched_fields.len(), 4);
        // Persisted too.
        assert_eq!(store.matches_for_claim("claim-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scorer_failure_degrades_single_candidate() {
        let store = Arc::new(MemoryStore::new());
        seed_claim(&store);
        seed_evidence(&store, "ev-1", Some("ord-1"));
        seed_evidence(&store, "ev-2", Some("ord-1"));

        let m = matcher(store.clone(), Arc::new(FailingScorer));
        let matches = m.match_claim("claim-1").await.unwrap();

        // The whole batch survives; every candidate falls back to manual
        // review with zero confidence.
        assert_eq!(matches.len(), 2);
        for em in &matches {
            assert_eq!(em.action, MatchAction::ManualReview);
            assert_eq!(em.final_confidence, 0.0);
        }
    }

    #[tokio::test]
    async fn test_missing_claim_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let m = matcher(store, Arc::new(FieldOverlapScorer));
        assert!(matches!(
            m.match_claim("missing").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_confidence_is_clamped() {
        let store = Arc::new(MemoryStore::new());
        seed_claim(&store);
        seed_evidence(&store, "ev-1", Some("ord-1"));

        let m = EvidenceMatcher::new(
            store.clone(),
            Arc::new(FieldOverlapScorer),
            // Pathological weights push the raw combination above 1.0.
            ScoringConfig {
                rule_weight: 2.0,
                ml_weight: 2.0,
            },
            router_config(),
            Arc::new(EventBroadcaster::new(store.clone())),
        );
        let matches = m.match_claim("claim-1").await.unwrap();
        assert_eq!(matches[0].final_confidence, 1.0);
    }
}
