//! Event fan-out and the append-only audit trail.
//!
//! Every state transition in the pipeline goes through `publish`. The audit
//! write is the durability guarantee; delivery to live subscribers is
//! best-effort and a dead subscriber is dropped on the next send.

use crate::model::{new_id, AuditRecord};
use crate::store::ClaimStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_type: String,
    pub subject_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub struct EventBroadcaster {
    store: Arc<dyn ClaimStore>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<PipelineEvent>>>>,
}

impl EventBroadcaster {
    pub fn new(store: Arc<dyn ClaimStore>) -> Self {
        EventBroadcaster {
            store,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Append the event to the audit trail and fan it out to subscribers for
    /// this subject. Audit failures are logged, never propagated to the
    /// publishing component.
    pub fn publish(&self, event_type: &str, subject_id: &str, payload: serde_json::Value) {
        let event = PipelineEvent {
            event_type: event_type.to_string(),
            subject_id: subject_id.to_string(),
            payload,
            created_at: Utc::now(),
        };

        let record = AuditRecord {
            id: new_id("audit"),
            event_type: event.event_type.clone(),
            subject_id: event.subject_id.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
        };
        if let Err(e) = self.store.append_audit(&record) {
            log::error!("failed to append audit record for {event_type}: {e}");
        }

        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("subscriber registry lock poisoned; dropping live delivery");
                return;
            }
        };
        if let Some(senders) = subscribers.get_mut(subject_id) {
            senders.retain(|sender| match sender.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    log::debug!("dropping closed subscriber for subject {subject_id}");
                    false
                }
            });
            if senders.is_empty() {
                subscribers.remove(subject_id);
            }
        }
        log::debug!("published {event_type} for {subject_id}");
    }

    /// Register a live subscriber for a subject (a user or claim owner).
    pub fn subscribe(&self, subject_id: &str) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(subject_id.to_string())
                .or_default()
                .push(sender);
        }
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn broadcaster() -> EventBroadcaster {
        EventBroadcaster::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_publish_writes_audit_and_delivers() {
        let b = broadcaster();
        let mut rx = b.subscribe("claim-1");

        b.publish("submission.created", "claim-1", serde_json::json!({"id": "sub-1"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "submission.created");
        assert_eq!(event.payload["id"], "sub-1");

        let audit = b.store.recent_audit(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event_type, "submission.created");
    }

    #[tokio::test]
    async fn test_delivery_is_scoped_to_subject() {
        let b = broadcaster();
        let mut rx_other = b.subscribe("claim-2");

        b.publish("prompt.created", "claim-1", serde_json::json!({}));

        // The audit entry lands regardless; the unrelated subscriber sees
        // nothing.
        assert_eq!(b.store.recent_audit(10).unwrap().len(), 1);
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_subscribers_are_pruned() {
        let b = broadcaster();
        let rx = b.subscribe("claim-1");
        drop(rx);

        // Publishing to a dropped receiver must not error and must prune it.
        b.publish("prompt.created", "claim-1", serde_json::json!({}));
        assert!(b.subscribers.lock().unwrap().get("claim-1").is_none());
    }
}
