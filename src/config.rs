use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub scoring: ScoringConfig,
    pub router: RouterConfig,
    pub authority: AuthorityConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub prompts: PromptConfig,
    pub poller: PollerConfig,
    pub submission: SubmissionConfig,
    pub proof: ProofConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" or "memory". Memory is for tests and demo runs only.
    pub backend: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub rule_weight: f64,
    pub ml_weight: f64,
}

/// Published decision thresholds. Inclusive lower bounds: a confidence equal
/// to a threshold lands in the higher bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub auto_threshold: f64,
    pub prompt_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub submit_timeout_seconds: u64,
    pub status_timeout_seconds: u64,
    /// Use the deterministic mock client instead of the HTTP client. This is
    /// the sandbox seam; it must never require touching source.
    pub use_mock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub default_ttl_hours: i64,
    pub expiring_soon_hours: i64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub interval_seconds: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    pub batch_size: usize,
    pub batch_pause_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofConfig {
    pub output_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: StoreConfig {
                backend: "sqlite".to_string(),
                path: "/var/lib/claimflow/claimflow.db".to_string(),
            },
            scoring: ScoringConfig {
                rule_weight: 0.4,
                ml_weight: 0.6,
            },
            router: RouterConfig {
                auto_threshold: 0.85,
                prompt_threshold: 0.50,
            },
            authority: AuthorityConfig {
                base_url: "https://claims.example.com/api/v1".to_string(),
                api_key: None,
                submit_timeout_seconds: 30,
                status_timeout_seconds: 10,
                use_mock: false,
            },
            rate_limit: RateLimitConfig {
                max_requests: 10,
                window_seconds: 60,
                min_interval_ms: 1000,
            },
            retry: RetryConfig {
                max_retries: 3,
                base_delay_seconds: 2,
                max_delay_seconds: 300,
                sweep_interval_seconds: 30,
            },
            prompts: PromptConfig {
                default_ttl_hours: 24,
                expiring_soon_hours: 1,
                sweep_interval_seconds: 60,
            },
            poller: PollerConfig {
                interval_seconds: 30,
                batch_size: 20,
            },
            submission: SubmissionConfig {
                batch_size: 10,
                batch_pause_ms: 250,
            },
            proof: ProofConfig {
                output_dir: "/var/lib/claimflow/proofs".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scoring.rule_weight < 0.0 || self.scoring.ml_weight < 0.0 {
            anyhow::bail!("scoring weights must be non-negative");
        }
        if self.scoring.rule_weight + self.scoring.ml_weight <= 0.0 {
            anyhow::bail!("scoring weights must not both be zero");
        }
        if !(0.0..=1.0).contains(&self.router.auto_threshold)
            || !(0.0..=1.0).contains(&self.router.prompt_threshold)
        {
            anyhow::bail!("router thresholds must be within [0, 1]");
        }
        if self.router.prompt_threshold > self.router.auto_threshold {
            anyhow::bail!("prompt_threshold must not exceed auto_threshold");
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_seconds == 0 {
            anyhow::bail!("rate limit window must allow at least one request");
        }
        if self.retry.base_delay_seconds == 0 {
            anyhow::bail!("retry base delay must be positive");
        }
        if self.retry.max_delay_seconds < self.retry.base_delay_seconds {
            anyhow::bail!("retry max delay must not be below the base delay");
        }
        if self.prompts.default_ttl_hours <= 0 {
            anyhow::bail!("prompt TTL must be positive");
        }
        if self.submission.batch_size == 0 {
            anyhow::bail!("submission batch size must be positive");
        }
        match self.store.backend.as_str() {
            "sqlite" | "memory" => {}
            other => anyhow::bail!("unknown store backend: {other}"),
        }
        Ok(())
    }
}
