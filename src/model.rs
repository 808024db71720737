use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a short unique identifier with a type prefix, e.g. "sub-9f3a01c2e4b8d617".
pub fn new_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = DefaultHasher::new();
    (nanos, seq, prefix).hash(&mut hasher);
    format!("{}-{:016x}", prefix, hasher.finish())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Open,
    Submitted,
    Resolved,
    Closed,
}

/// A claim as delivered by the upstream claim intake. The identifying fields
/// (order id, SKU, amount, date window) are what evidence candidates are
/// matched against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub owner_id: String,
    pub order_id: String,
    pub sku: String,
    pub amount_cents: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub state: ClaimState,
    pub created_at: DateTime<Utc>,
}

/// An evidence candidate delivered by a document-source connector, with the
/// metadata fields extracted for matching. `resolved` marks evidence already
/// consumed by a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub source: String,
    pub order_id: Option<String>,
    pub sku: Option<String>,
    pub amount_cents: Option<i64>,
    pub document_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchAction {
    AutoSubmit,
    SmartPrompt,
    ManualReview,
}

impl MatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchAction::AutoSubmit => "auto_submit",
            MatchAction::SmartPrompt => "smart_prompt",
            MatchAction::ManualReview => "manual_review",
        }
    }
}

/// The outcome of scoring one evidence candidate against a claim. Immutable
/// once created; a newer match supersedes it if the evidence changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceMatch {
    pub id: String,
    pub claim_id: String,
    pub evidence_id: String,
    pub rule_score: f64,
    pub ml_score: f64,
    pub final_confidence: f64,
    pub matched_fields: Vec<String>,
    pub action: MatchAction,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Pending,
    Answered,
    Dismissed,
    Cancelled,
    Expired,
}

impl PromptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PromptStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptStatus::Pending => "pending",
            PromptStatus::Answered => "answered",
            PromptStatus::Dismissed => "dismissed",
            PromptStatus::Cancelled => "cancelled",
            PromptStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOption {
    pub id: String,
    pub label: String,
    pub action: MatchAction,
    pub implied_confidence: f64,
}

/// A disambiguation question shown to the claim owner when a match falls in
/// the smart-prompt confidence band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartPrompt {
    pub id: String,
    pub claim_id: String,
    pub evidence_id: String,
    pub question: String,
    pub options: Vec<PromptOption>,
    pub status: PromptStatus,
    pub selected_option: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    /// Set once the expiring-soon notification has gone out, so restarts do
    /// not re-notify.
    pub expiring_notified: bool,
}

impl SmartPrompt {
    pub fn option(&self, option_id: &str) -> Option<&PromptOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Submitted,
    Retrying,
    Approved,
    Rejected,
    Completed,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Approved
                | SubmissionStatus::Rejected
                | SubmissionStatus::Completed
                | SubmissionStatus::Failed
        )
    }

    /// Terminal states that denote a paid/approved outcome and trigger the
    /// proof bundle.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, SubmissionStatus::Approved | SubmissionStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Retrying => "retrying",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<SubmissionStatus> {
        match s {
            "pending" => Some(SubmissionStatus::Pending),
            "submitted" => Some(SubmissionStatus::Submitted),
            "retrying" => Some(SubmissionStatus::Retrying),
            "approved" => Some(SubmissionStatus::Approved),
            "rejected" => Some(SubmissionStatus::Rejected),
            "completed" => Some(SubmissionStatus::Completed),
            "failed" => Some(SubmissionStatus::Failed),
            _ => None,
        }
    }
}

/// One external claim submission. At most one submission per claim may be in
/// a non-terminal status at any time; the store's conditional create enforces
/// this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub claim_id: String,
    pub evidence_ids: Vec<String>,
    pub external_submission_id: Option<String>,
    pub external_case_id: Option<String>,
    pub status: SubmissionStatus,
    pub confidence_at_submission: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(claim_id: &str, evidence_ids: Vec<String>, confidence: f64, max_retries: u32) -> Self {
        Submission {
            id: new_id("sub"),
            claim_id: claim_id.to_string(),
            evidence_ids,
            external_submission_id: None,
            external_case_id: None,
            status: SubmissionStatus::Pending,
            confidence_at_submission: confidence,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            error_message: None,
            submitted_at: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Generating,
    Completed,
    Failed,
}

/// The completion-proof bundle generated once a submission reaches a terminal
/// success status. Immutable once completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofBundle {
    pub id: String,
    pub claim_id: String,
    pub status: ProofStatus,
    pub artifact_refs: Vec<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProofBundle {
    pub fn new(claim_id: &str) -> Self {
        ProofBundle {
            id: new_id("proof"),
            claim_id: claim_id.to_string(),
            status: ProofStatus::Generating,
            artifact_refs: Vec::new(),
            generated_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// One entry in the append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub event_type: String,
    pub subject_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
