//! Background schedulers: prompt expiry, submission retries, auto-submit
//! batches, and status polling, each on its own fixed interval and
//! independent of inbound request traffic.
//!
//! Every loop selects between its interval tick and a shutdown signal. Work
//! errors are logged and never kill the loop; all progress is persisted by
//! the components themselves before the next suspension point, so shutdown
//! loses nothing.

use crate::config::Config;
use crate::pipeline::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

pub struct Schedulers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Schedulers {
    pub fn start(pipeline: Arc<Pipeline>, config: &Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        // Prompt sweeps: expiry plus the notification-only expiring-soon
        // pass.
        {
            let pipeline = pipeline.clone();
            let mut rx = shutdown.subscribe();
            let period = Duration::from_secs(config.prompts.sweep_interval_seconds);
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match pipeline.sweep_prompts() {
                                Ok((expired, notified)) => {
                                    if expired > 0 || notified > 0 {
                                        log::debug!(
                                            "prompt sweep: {expired} expired, {notified} notified"
                                        );
                                    }
                                }
                                Err(e) => log::error!("prompt sweep failed: {e}"),
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
                log::debug!("prompt sweep stopped");
            }));
        }

        // Retry sweep plus the auto-submit batch, sharing one cadence: both
        // feed the same rate-limited submission path.
        {
            let pipeline = pipeline.clone();
            let mut rx = shutdown.subscribe();
            let period = Duration::from_secs(config.retry.sweep_interval_seconds);
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match pipeline.retry_due().await {
                                Ok(retried) if retried > 0 => {
                                    log::info!("retry sweep drove {retried} submission(s)");
                                }
                                Ok(_) => {}
                                Err(e) => log::error!("retry sweep failed: {e}"),
                            }
                            match pipeline.run_submission_batch().await {
                                Ok(submitted) if submitted > 0 => {
                                    log::info!("batch submitted {submitted} claim(s)");
                                }
                                Ok(_) => {}
                                Err(e) => log::error!("submission batch failed: {e}"),
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
                log::debug!("retry sweep stopped");
            }));
        }

        // Status polling.
        {
            let pipeline = pipeline.clone();
            let mut rx = shutdown.subscribe();
            let period = Duration::from_secs(config.poller.interval_seconds);
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match pipeline.poll_pending().await {
                                Ok(resolved) if resolved > 0 => {
                                    log::info!("status poll resolved {resolved} submission(s)");
                                }
                                Ok(_) => {}
                                Err(e) => log::error!("status poll failed: {e}"),
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
                log::debug!("status poller stopped");
            }));
        }

        Schedulers { shutdown, handles }
    }

    /// Signal every loop and wait for them to finish their current pass.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            log::debug!("scheduler loops already gone");
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::warn!("scheduler task ended abnormally: {e}");
            }
        }
        log::info!("schedulers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MockAuthorityClient;
    use crate::model::{Claim, ClaimState, PromptOption, PromptStatus, MatchAction};
    use crate::proof::TextRenderer;
    use crate::scorer::FieldOverlapScorer;
    use crate::store::{ClaimStore, MemoryStore};
    use chrono::{Duration as ChronoDuration, Utc};

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.store.backend = "memory".to_string();
        config.authority.use_mock = true;
        config.rate_limit.min_interval_ms = 0;
        config.rate_limit.max_requests = 1000;
        config.prompts.sweep_interval_seconds = 1;
        config.retry.sweep_interval_seconds = 1;
        config.poller.interval_seconds = 1;
        config.submission.batch_pause_ms = 0;
        config
    }

    fn pipeline(config: &Config, store: Arc<MemoryStore>) -> Arc<Pipeline> {
        let dir = std::env::temp_dir().join(format!("claimflow-{}", crate::model::new_id("t")));
        Arc::new(
            Pipeline::with_collaborators(
                config.clone(),
                store,
                Arc::new(FieldOverlapScorer),
                Arc::new(MockAuthorityClient::new()),
                Arc::new(TextRenderer::new(dir)),
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_loop_expires_prompts() {
        let config = fast_config();
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .put_claim(&Claim {
                id: "claim-1".to_string(),
                owner_id: "owner-1".to_string(),
                order_id: "ord-1".to_string(),
                sku: "SKU-1".to_string(),
                amount_cents: 1000,
                window_start: now - ChronoDuration::days(30),
                window_end: now,
                state: ClaimState::Open,
                created_at: now,
            })
            .unwrap();

        let p = pipeline(&config, store.clone());
        let prompt = p
            .create_prompt(
                "claim-1",
                "ev-1",
                "match?",
                vec![PromptOption {
                    id: "confirm".to_string(),
                    label: "Yes".to_string(),
                    action: MatchAction::AutoSubmit,
                    implied_confidence: 0.9,
                }],
                Some(1),
            )
            .unwrap();

        // Backdate the expiry so the first sweep pass flips it.
        let mut stale = prompt.clone();
        stale.expires_at = Utc::now() - ChronoDuration::minutes(1);
        store.put_prompt(&stale).unwrap();

        let schedulers = Schedulers::start(p, &config);
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        schedulers.shutdown().await;

        assert_eq!(
            store.get_prompt(&prompt.id).unwrap().unwrap().status,
            PromptStatus::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_loops() {
        let config = fast_config();
        let store = Arc::new(MemoryStore::new());
        let schedulers = Schedulers::start(pipeline(&config, store), &config);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        schedulers.shutdown().await;
    }
}
