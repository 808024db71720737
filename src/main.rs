use clap::{Arg, Command};
use claimflow::authority::{AuthorityStatus, MockAuthorityClient, ResolutionFields};
use claimflow::pipeline::Pipeline;
use claimflow::proof::TextRenderer;
use claimflow::scheduler::Schedulers;
use claimflow::scorer::FieldOverlapScorer;
use claimflow::store::{ClaimStore, MemoryStore};
use claimflow::Config;
use log::LevelFilter;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("claimflow")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Confidence-driven claims pipeline with automated external submission")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/claimflow.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .help("Run a sample claim end-to-end against the mock authority")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("audit")
                .long("audit")
                .value_name("N")
                .help("Print the N most recent audit events and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        generate_default_config(path);
        return;
    }

    if matches.get_flag("demo") {
        if let Err(e) = run_demo().await {
            eprintln!("Demo failed: {e}");
            process::exit(1);
        }
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration from {config_path}: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Configuration {config_path} is valid.");
        println!(
            "  router thresholds: auto {} / prompt {}",
            config.router.auto_threshold, config.router.prompt_threshold
        );
        println!(
            "  authority: {} ({})",
            config.authority.base_url,
            if config.authority.use_mock {
                "mock"
            } else {
                "live"
            }
        );
        println!("  store: {} at {}", config.store.backend, config.store.path);
        return;
    }

    if let Some(limit) = matches.get_one::<String>("audit") {
        let limit: usize = match limit.parse() {
            Ok(n) => n,
            Err(_) => {
                eprintln!("--audit expects a number");
                process::exit(1);
            }
        };
        if let Err(e) = print_audit(config, limit) {
            eprintln!("Error reading audit log: {e}");
            process::exit(1);
        }
        return;
    }

    if let Err(e) = run_service(config).await {
        eprintln!("Service error: {e}");
        process::exit(1);
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => println!("Default configuration written to {path}"),
        Err(e) => {
            eprintln!("Error writing configuration: {e}");
            process::exit(1);
        }
    }
}

fn print_audit(config: Config, limit: usize) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let records = pipeline.recent_audit(limit)?;
    if records.is_empty() {
        println!("Audit log is empty.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<28} {:<16} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.event_type,
            record.subject_id,
            record.payload
        );
    }
    Ok(())
}

async fn run_service(config: Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(config.clone())?);
    let schedulers = Schedulers::start(pipeline, &config);

    log::info!("claimflow started; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");

    schedulers.shutdown().await;
    Ok(())
}

/// Walk one high-confidence claim and one prompt-band claim through the full
/// pipeline against the mock authority.
async fn run_demo() -> anyhow::Result<()> {
    use chrono::{Duration, Utc};
    use claimflow::model::{Claim, ClaimState, Evidence};

    let mut config = Config::default();
    config.store.backend = "memory".to_string();
    config.authority.use_mock = true;
    config.rate_limit.min_interval_ms = 0;
    config.submission.batch_pause_ms = 0;
    config.proof.output_dir = std::env::temp_dir()
        .join("claimflow-demo")
        .to_string_lossy()
        .to_string();

    let store: Arc<dyn ClaimStore> = Arc::new(MemoryStore::new());
    let authority = Arc::new(MockAuthorityClient::new());
    let pipeline = Pipeline::with_collaborators(
        config.clone(),
        store.clone(),
        Arc::new(FieldOverlapScorer),
        authority.clone(),
        Arc::new(TextRenderer::new(&config.proof.output_dir)),
    )?;

    println!("claimflow demo (mock authority, in-memory store)");
    println!();

    let now = Utc::now();
    let claim = Claim {
        id: "claim-demo-1".to_string(),
        owner_id: "owner-demo".to_string(),
        order_id: "ord-1042".to_string(),
        sku: "KB-221".to_string(),
        amount_cents: 4599,
        window_start: now - Duration::days(30),
        window_end: now,
        state: ClaimState::Open,
        created_at: now,
    };
    store.put_claim(&claim)?;
    store.put_evidence(&Evidence {
        id: "ev-receipt".to_string(),
        source: "mail-connector".to_string(),
        order_id: Some("ord-1042".to_string()),
        sku: Some("KB-221".to_string()),
        amount_cents: Some(4599),
        document_date: Some(now - Duration::days(3)),
        description: Some("Order confirmation for KB-221".to_string()),
        resolved: false,
        created_at: now,
    })?;
    store.put_evidence(&Evidence {
        id: "ev-statement".to_string(),
        source: "statement-connector".to_string(),
        order_id: Some("ord-1042".to_string()),
        sku: Some("KB-221".to_string()),
        amount_cents: None,
        document_date: None,
        description: Some("Card statement line".to_string()),
        resolved: false,
        created_at: now,
    })?;

    println!("Matching evidence for {} ...", claim.id);
    let matches = pipeline.match_evidence(&claim.id).await?;
    for m in &matches {
        println!(
            "  {} -> confidence {:.2}, action {}",
            m.evidence_id,
            m.final_confidence,
            m.action.as_str()
        );
    }

    let submission = store
        .active_submission_for_claim(&claim.id)?
        .expect("demo claim should have auto-submitted");
    println!(
        "Submission {} is {} (external case {:?})",
        submission.id,
        submission.status.as_str(),
        submission.external_case_id
    );

    let external_id = submission
        .external_submission_id
        .clone()
        .expect("submitted submission has an external id");
    authority.set_status(
        &external_id,
        AuthorityStatus {
            status: "paid".to_string(),
            resolution: Some(ResolutionFields {
                outcome: Some("paid".to_string()),
                payout_amount_cents: Some(4599),
                paid_at: Some(Utc::now()),
                reference: Some("demo-payout-1".to_string()),
            }),
        },
    );

    println!("Polling authority status ...");
    let resolved = pipeline.check_status(&submission.id).await?;
    println!("Submission resolved as {}", resolved.status.as_str());

    let bundle = pipeline.get_proof_bundle(&claim.id)?;
    println!("Proof bundle {}:", bundle.id);
    for artifact in &bundle.artifact_refs {
        println!("  artifact: {artifact}");
    }

    println!();
    println!("Recent audit trail:");
    for record in pipeline.recent_audit(10)? {
        println!("  {:<24} {}", record.event_type, record.subject_id);
    }

    Ok(())
}
