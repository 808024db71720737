//! Decision routing for scored evidence matches.
//!
//! Pure threshold evaluation: (confidence, matched-field overlap, claim
//! state) in, action out. No I/O happens here, so the policy is trivially
//! unit-testable and the rest of the pipeline treats it as opaque.

use crate::config::RouterConfig;
use crate::model::{ClaimState, MatchAction};

/// Map a combined confidence onto an action.
///
/// Threshold bounds are inclusive: a confidence exactly at a threshold lands
/// in the higher bucket. A claim that is no longer open always routes to
/// manual review, and an auto-grade confidence with no overlapping fields is
/// downgraded to a prompt rather than submitted sight-unseen.
pub fn route(
    config: &RouterConfig,
    confidence: f64,
    matched_field_count: usize,
    claim_state: ClaimState,
) -> MatchAction {
    if claim_state != ClaimState::Open {
        return MatchAction::ManualReview;
    }

    if confidence >= config.auto_threshold {
        if matched_field_count == 0 {
            return MatchAction::SmartPrompt;
        }
        MatchAction::AutoSubmit
    } else if confidence >= config.prompt_threshold {
        MatchAction::SmartPrompt
    } else {
        MatchAction::ManualReview
    }
}

/// Rank ordering for the monotonicity property:
/// manual_review < smart_prompt < auto_submit.
pub fn router_rank(action: MatchAction) -> u8 {
    match action {
        MatchAction::ManualReview => 0,
        MatchAction::SmartPrompt => 1,
        MatchAction::AutoSubmit => 2,
    }
}
