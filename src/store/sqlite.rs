//! SQLite-backed store.
//!
//! Each entity is stored as a JSON document alongside the columns the sweep
//! queries and conditional writes need. The conditional SQL (`WHERE NOT
//! EXISTS`, `WHERE ... AND status = ?`) is what enforces the invariants
//! under concurrent workers sharing one database.

use super::{is_candidate, ClaimStore};
use crate::error::PipelineError;
use crate::model::{
    AuditRecord, Claim, Evidence, EvidenceMatch, ProofBundle, SmartPrompt, Submission,
    SubmissionStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Mutex;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn to_doc<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string(value).map_err(|e| PipelineError::store(format!("serialize: {e}")))
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> Result<T, PipelineError> {
    serde_json::from_str(doc).map_err(|e| PipelineError::store(format!("deserialize: {e}")))
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, PipelineError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::store(format!("create store directory: {e}")))?;
            }
            Connection::open(path)?
        };
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init_schema(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), PipelineError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS claims (
                id TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS evidence (
                id TEXT PRIMARY KEY,
                resolved INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS matches (
                id TEXT PRIMARY KEY,
                claim_id TEXT NOT NULL,
                action TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_matches_claim ON matches(claim_id);
            CREATE TABLE IF NOT EXISTS prompts (
                id TEXT PRIMARY KEY,
                claim_id TEXT NOT NULL,
                evidence_id TEXT NOT NULL,
                status TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                expiring_notified INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_prompts_status ON prompts(status, expires_at);
            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                claim_id TEXT NOT NULL,
                status TEXT NOT NULL,
                external_submission_id TEXT,
                next_retry_at INTEGER,
                submitted_at INTEGER,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_submissions_claim ON submissions(claim_id, status);
            CREATE INDEX IF NOT EXISTS idx_submissions_retry ON submissions(status, next_retry_at);
            CREATE TABLE IF NOT EXISTS proof_bundles (
                claim_id TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PipelineError> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::store("sqlite connection lock poisoned"))
    }
}

const NON_TERMINAL: &str = "('pending','submitted','retrying')";

impl ClaimStore for SqliteStore {
    fn put_claim(&self, claim: &Claim) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO claims (id, doc) VALUES (?1, ?2)",
            params![claim.id, to_doc(claim)?],
        )?;
        Ok(())
    }

    fn get_claim(&self, claim_id: &str) -> Result<Option<Claim>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT doc FROM claims WHERE id = ?1")?;
        let mut rows = stmt.query(params![claim_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn put_evidence(&self, evidence: &Evidence) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO evidence (id, resolved, created_at, doc)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                evidence.id,
                evidence.resolved as i64,
                evidence.created_at.timestamp_millis(),
                to_doc(evidence)?
            ],
        )?;
        Ok(())
    }

    fn get_evidence(&self, evidence_id: &str) -> Result<Option<Evidence>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT doc FROM evidence WHERE id = ?1")?;
        let mut rows = stmt.query(params![evidence_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn candidate_evidence(&self, claim: &Claim) -> Result<Vec<Evidence>, PipelineError> {
        // Field overlap is evaluated in code so both backends share one
        // definition of "candidate".
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT doc FROM evidence WHERE resolved = 0 ORDER BY created_at")?;
        let docs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut candidates = Vec::new();
        for doc in docs {
            let evidence: Evidence = from_doc(&doc)?;
            if is_candidate(claim, &evidence) {
                candidates.push(evidence);
            }
        }
        Ok(candidates)
    }

    fn mark_evidence_resolved(&self, evidence_id: &str) -> Result<(), PipelineError> {
        let evidence = self
            .get_evidence(evidence_id)?
            .ok_or_else(|| PipelineError::not_found(format!("evidence {evidence_id}")))?;
        let mut updated = evidence;
        updated.resolved = true;
        self.put_evidence(&updated)
    }

    fn put_match(&self, evidence_match: &EvidenceMatch) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO matches (id, claim_id, action, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                evidence_match.id,
                evidence_match.claim_id,
                evidence_match.action.as_str(),
                evidence_match.created_at.timestamp_millis(),
                to_doc(evidence_match)?
            ],
        )?;
        Ok(())
    }

    fn matches_for_claim(&self, claim_id: &str) -> Result<Vec<EvidenceMatch>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT doc FROM matches WHERE claim_id = ?1 ORDER BY created_at")?;
        let docs = stmt
            .query_map(params![claim_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn auto_submit_candidates(&self, limit: usize) -> Result<Vec<EvidenceMatch>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM matches
             WHERE action = 'auto_submit'
               AND claim_id NOT IN (SELECT claim_id FROM submissions)
             ORDER BY created_at LIMIT ?1",
        )?;
        let docs = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn put_prompt(&self, prompt: &SmartPrompt) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO prompts
             (id, claim_id, evidence_id, status, expires_at, expiring_notified, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                prompt.id,
                prompt.claim_id,
                prompt.evidence_id,
                prompt.status.as_str(),
                prompt.expires_at.timestamp_millis(),
                prompt.expiring_notified as i64,
                prompt.created_at.timestamp_millis(),
                to_doc(prompt)?
            ],
        )?;
        Ok(())
    }

    fn get_prompt(&self, prompt_id: &str) -> Result<Option<SmartPrompt>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT doc FROM prompts WHERE id = ?1")?;
        let mut rows = stmt.query(params![prompt_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn update_prompt_if_pending(&self, prompt: &SmartPrompt) -> Result<bool, PipelineError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE prompts
             SET status = ?2, expires_at = ?3, expiring_notified = ?4, doc = ?5
             WHERE id = ?1 AND status = 'pending'",
            params![
                prompt.id,
                prompt.status.as_str(),
                prompt.expires_at.timestamp_millis(),
                prompt.expiring_notified as i64,
                to_doc(prompt)?
            ],
        )?;
        if changed == 0 {
            // Distinguish a lost CAS from a missing row.
            let mut stmt = conn.prepare("SELECT 1 FROM prompts WHERE id = ?1")?;
            let exists = stmt.query(params![prompt.id])?.next()?.is_some();
            if !exists {
                return Err(PipelineError::not_found(format!("prompt {}", prompt.id)));
            }
        }
        Ok(changed == 1)
    }

    fn pending_prompt_for_evidence(
        &self,
        claim_id: &str,
        evidence_id: &str,
    ) -> Result<Option<SmartPrompt>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM prompts
             WHERE claim_id = ?1 AND evidence_id = ?2 AND status = 'pending'
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![claim_id, evidence_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn prompts_for_claim(&self, claim_id: &str) -> Result<Vec<SmartPrompt>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT doc FROM prompts WHERE claim_id = ?1 ORDER BY created_at")?;
        let docs = stmt
            .query_map(params![claim_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn pending_prompts_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SmartPrompt>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM prompts WHERE status = 'pending' AND expires_at <= ?1",
        )?;
        let docs = stmt
            .query_map(params![cutoff.timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn pending_prompts_unnotified_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SmartPrompt>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM prompts
             WHERE status = 'pending' AND expiring_notified = 0 AND expires_at <= ?1",
        )?;
        let docs = stmt
            .query_map(params![cutoff.timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn mark_prompt_notified(&self, prompt_id: &str) -> Result<(), PipelineError> {
        let prompt = self
            .get_prompt(prompt_id)?
            .ok_or_else(|| PipelineError::not_found(format!("prompt {prompt_id}")))?;
        let mut updated = prompt;
        updated.expiring_notified = true;
        self.put_prompt(&updated)
    }

    fn create_submission(&self, submission: &Submission) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO submissions
                 (id, claim_id, status, external_submission_id, next_retry_at, submitted_at, doc)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                 WHERE NOT EXISTS (
                     SELECT 1 FROM submissions
                     WHERE claim_id = ?2 AND status IN {NON_TERMINAL}
                 )"
            ),
            params![
                submission.id,
                submission.claim_id,
                submission.status.as_str(),
                submission.external_submission_id,
                submission.next_retry_at.map(|t| t.timestamp_millis()),
                submission.submitted_at.map(|t| t.timestamp_millis()),
                to_doc(submission)?
            ],
        )?;
        if inserted == 0 {
            return Err(PipelineError::conflict(format!(
                "claim {} already has an active submission",
                submission.claim_id
            )));
        }
        Ok(())
    }

    fn get_submission(&self, submission_id: &str) -> Result<Option<Submission>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT doc FROM submissions WHERE id = ?1")?;
        let mut rows = stmt.query(params![submission_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn submission_by_external_id(
        &self,
        external_submission_id: &str,
    ) -> Result<Option<Submission>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT doc FROM submissions WHERE external_submission_id = ?1")?;
        let mut rows = stmt.query(params![external_submission_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn update_submission_if_status(
        &self,
        submission: &Submission,
        expected: SubmissionStatus,
    ) -> Result<bool, PipelineError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE submissions
             SET status = ?2, external_submission_id = ?3, next_retry_at = ?4,
                 submitted_at = ?5, doc = ?6
             WHERE id = ?1 AND status = ?7",
            params![
                submission.id,
                submission.status.as_str(),
                submission.external_submission_id,
                submission.next_retry_at.map(|t| t.timestamp_millis()),
                submission.submitted_at.map(|t| t.timestamp_millis()),
                to_doc(submission)?,
                expected.as_str()
            ],
        )?;
        if changed == 0 {
            let mut stmt = conn.prepare("SELECT 1 FROM submissions WHERE id = ?1")?;
            let exists = stmt.query(params![submission.id])?.next()?.is_some();
            if !exists {
                return Err(PipelineError::not_found(format!(
                    "submission {}",
                    submission.id
                )));
            }
        }
        Ok(changed == 1)
    }

    fn active_submission_for_claim(
        &self,
        claim_id: &str,
    ) -> Result<Option<Submission>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT doc FROM submissions WHERE claim_id = ?1 AND status IN {NON_TERMINAL} LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![claim_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn submissions_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Submission>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM submissions
             WHERE status = 'retrying' AND next_retry_at <= ?1
             ORDER BY next_retry_at LIMIT ?2",
        )?;
        let docs = stmt
            .query_map(params![now.timestamp_millis(), limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn submissions_awaiting_status(&self, limit: usize) -> Result<Vec<Submission>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM submissions WHERE status = 'submitted'
             ORDER BY submitted_at LIMIT ?1",
        )?;
        let docs = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn create_proof_bundle(&self, bundle: &ProofBundle) -> Result<bool, PipelineError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO proof_bundles (claim_id, doc) VALUES (?1, ?2)",
            params![bundle.claim_id, to_doc(bundle)?],
        )?;
        Ok(inserted == 1)
    }

    fn update_proof_bundle(&self, bundle: &ProofBundle) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO proof_bundles (claim_id, doc) VALUES (?1, ?2)",
            params![bundle.claim_id, to_doc(bundle)?],
        )?;
        Ok(())
    }

    fn proof_bundle_for_claim(&self, claim_id: &str) -> Result<Option<ProofBundle>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT doc FROM proof_bundles WHERE claim_id = ?1")?;
        let mut rows = stmt.query(params![claim_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_doc(&row.get::<_, String>(0)?)?)),
            None => Ok(None),
        }
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_log (id, event_type, subject_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.event_type,
                record.subject_id,
                record.payload.to_string(),
                record.created_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, subject_id, payload, created_at
             FROM audit_log ORDER BY seq DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        records
            .into_iter()
            .map(|(id, event_type, subject_id, payload, millis)| {
                let payload = serde_json::from_str(&payload)
                    .map_err(|e| PipelineError::store(format!("audit payload: {e}")))?;
                let created_at = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| PipelineError::store("audit timestamp out of range"))?;
                Ok(AuditRecord {
                    id,
                    event_type,
                    subject_id,
                    payload,
                    created_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClaimState, PromptStatus};
    use chrono::Duration;

    fn store() -> SqliteStore {
        SqliteStore::new(":memory:").unwrap()
    }

    fn claim(id: &str) -> Claim {
        let now = Utc::now();
        Claim {
            id: id.to_string(),
            owner_id: "owner-1".to_string(),
            order_id: "ord-1".to_string(),
            sku: "SKU-1".to_string(),
            amount_cents: 1000,
            window_start: now - Duration::days(30),
            window_end: now,
            state: ClaimState::Open,
            created_at: now,
        }
    }

    #[test]
    fn test_claim_round_trip() {
        let s = store();
        let c = claim("claim-1");
        s.put_claim(&c).unwrap();
        let loaded = s.get_claim("claim-1").unwrap().unwrap();
        assert_eq!(loaded.order_id, "ord-1");
        assert!(s.get_claim("missing").unwrap().is_none());
    }

    #[test]
    fn test_single_active_submission_constraint() {
        let s = store();
        let sub = Submission::new("claim-1", vec!["ev-1".to_string()], 0.9, 3);
        s.create_submission(&sub).unwrap();

        let second = Submission::new("claim-1", vec!["ev-2".to_string()], 0.8, 3);
        assert!(matches!(
            s.create_submission(&second),
            Err(PipelineError::Conflict(_))
        ));

        // Drive the first to a terminal state; the claim frees up.
        let mut terminal = sub.clone();
        terminal.status = SubmissionStatus::Rejected;
        assert!(s
            .update_submission_if_status(&terminal, SubmissionStatus::Pending)
            .unwrap());
        s.create_submission(&second).unwrap();
    }

    #[test]
    fn test_submission_cas_and_retry_query() {
        let s = store();
        let mut sub = Submission::new("claim-1", vec!["ev-1".to_string()], 0.9, 3);
        s.create_submission(&sub).unwrap();

        sub.status = SubmissionStatus::Retrying;
        sub.next_retry_at = Some(Utc::now() - Duration::seconds(5));
        assert!(s
            .update_submission_if_status(&sub, SubmissionStatus::Pending)
            .unwrap());

        let due = s.submissions_due_for_retry(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, sub.id);

        // A stale CAS fails without touching the row.
        let mut stale = sub.clone();
        stale.status = SubmissionStatus::Submitted;
        assert!(!s
            .update_submission_if_status(&stale, SubmissionStatus::Pending)
            .unwrap());
    }

    #[test]
    fn test_update_missing_submission_is_not_found() {
        let s = store();
        let sub = Submission::new("claim-1", vec![], 0.9, 3);
        assert!(matches!(
            s.update_submission_if_status(&sub, SubmissionStatus::Pending),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_prompt_cas_and_expiry_queries() {
        let s = store();
        let mut p = SmartPrompt {
            id: "prompt-1".to_string(),
            claim_id: "claim-1".to_string(),
            evidence_id: "ev-1".to_string(),
            question: "match?".to_string(),
            options: vec![],
            status: PromptStatus::Pending,
            selected_option: None,
            expires_at: Utc::now() - Duration::minutes(1),
            created_at: Utc::now(),
            answered_at: None,
            expiring_notified: false,
        };
        s.put_prompt(&p).unwrap();

        let expired = s.pending_prompts_expiring_before(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);

        p.status = PromptStatus::Expired;
        assert!(s.update_prompt_if_pending(&p).unwrap());
        assert!(s.pending_prompts_expiring_before(Utc::now()).unwrap().is_empty());

        // Terminal prompt no longer accepts CAS updates.
        p.status = PromptStatus::Answered;
        assert!(!s.update_prompt_if_pending(&p).unwrap());
    }

    #[test]
    fn test_proof_bundle_create_if_absent() {
        let s = store();
        let bundle = ProofBundle::new("claim-1");
        assert!(s.create_proof_bundle(&bundle).unwrap());
        assert!(!s.create_proof_bundle(&ProofBundle::new("claim-1")).unwrap());
        let loaded = s.proof_bundle_for_claim("claim-1").unwrap().unwrap();
        assert_eq!(loaded.id, bundle.id);
    }

    #[test]
    fn test_audit_append_and_query() {
        let s = store();
        for i in 0..3 {
            s.append_audit(&AuditRecord {
                id: crate::model::new_id("audit"),
                event_type: format!("event.{i}"),
                subject_id: "claim-1".to_string(),
                payload: serde_json::json!({"n": i}),
                created_at: Utc::now(),
            })
            .unwrap();
        }
        let recent = s.recent_audit(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "event.2");
        assert_eq!(recent[0].payload["n"], 2);
    }

    #[test]
    fn test_candidate_evidence_via_doc_fields() {
        let s = store();
        let c = claim("claim-1");
        let ev = Evidence {
            id: "ev-1".to_string(),
            source: "inbox".to_string(),
            order_id: Some("ord-1".to_string()),
            sku: None,
            amount_cents: None,
            document_date: None,
            description: None,
            resolved: false,
            created_at: Utc::now(),
        };
        s.put_evidence(&ev).unwrap();
        assert_eq!(s.candidate_evidence(&c).unwrap().len(), 1);

        s.mark_evidence_resolved("ev-1").unwrap();
        assert!(s.candidate_evidence(&c).unwrap().is_empty());
    }
}
