//! remit-runner: headless driver for the remittance bucket engine.
//!
//! Usage:
//!   remit-runner --db remit.db --data-dir ./data --events claims.jsonl
//!   remit-runner --db remit.db --data-dir ./data --ipc-mode --monitor

mod outbox;

use anyhow::Result;
use chrono::{DateTime, Utc};
use outbox::{DirectoryTransport, OutboxComposer};
use remit_core::{
    approval_workflow::Actor,
    claim::ClaimEvent,
    claim_aggregator::ClaimOutcome,
    collaborators::{PartyRegistry, StaticPartyDirectory},
    config::{EngineConfig, PolicySet},
    engine::{BucketEngine, EngineBuilder},
    error::EngineError,
    model::{Bucket, BucketStatus, DeliveryStatus},
    scheduled_monitor::{MonitorHandle, MonitorSchedule},
    store::Store,
};
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    GetState,
    ApplyClaim {
        claim: ClaimEvent,
    },
    Approve {
        bucket_id: String,
        actor: Actor,
        #[serde(default)]
        comments: Option<String>,
        #[serde(default)]
        generate_at: Option<DateTime<Utc>>,
    },
    Reject {
        bucket_id: String,
        actor: Actor,
        reason: String,
    },
    BulkApprove {
        bucket_ids: Vec<String>,
        actor: Actor,
        #[serde(default)]
        comments: Option<String>,
    },
    Reset {
        bucket_id: String,
        actor: Actor,
        reason: String,
    },
    ConfigureParties {
        #[serde(default)]
        payers: Vec<String>,
        #[serde(default)]
        payees: Vec<String>,
    },
    ResolveConfiguration {
        bucket_id: String,
        actor: Actor,
    },
    Evaluate {
        #[serde(default)]
        bucket_id: Option<String>,
    },
    Sweep,
    Deliver {
        file_id: String,
    },
    MarkDelivered {
        file_id: String,
        actor: Actor,
    },
    RetryAllFailed,
    Quit,
}

#[derive(serde::Serialize)]
struct UiState {
    now: DateTime<Utc>,
    accumulating: i64,
    pending_approval: i64,
    missing_configuration: i64,
    completed: i64,
    failed: i64,
    files_pending: i64,
    files_retrying: i64,
    files_delivered: i64,
    files_failed: i64,
    awaiting_approval: Vec<Bucket>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let run_monitor = args.iter().any(|a| a == "--monitor");
    let db = flag_value(&args, "--db").unwrap_or("remit.db");
    let data_dir = flag_value(&args, "--data-dir").unwrap_or("./data");
    let outbox_dir = flag_value(&args, "--outbox").unwrap_or("./outbox");
    let events = flag_value(&args, "--events");

    let config = EngineConfig::load(data_dir)?;
    let policy = PolicySet::load(data_dir)?;
    let directory = Arc::new(StaticPartyDirectory::new(PartyRegistry::load(data_dir)?));
    let mut schedule = MonitorSchedule::from_config(&config);
    let interval = parse_arg(&args, "--interval-secs", config.monitor.sweep_interval_secs);
    schedule.bucket_interval = Duration::from_secs(interval.max(1));

    if !ipc_mode {
        println!("remit-runner: remittance bucket engine");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!("  outbox:    {outbox_dir}");
        println!("  rules:     {}", policy.rules.len());
        println!("  thresholds: {}", policy.thresholds.len());
        println!();
    }

    let store = Store::open_with(db, &config.store)?;
    let engine = EngineBuilder::new(store, policy)
        .config(config)
        .composer(Arc::new(OutboxComposer))
        .transport(Arc::new(DirectoryTransport::new(outbox_dir)))
        .directory(directory.clone())
        .build()?;

    let monitor = if run_monitor {
        Some(MonitorHandle::spawn(engine.fork()?, schedule)?)
    } else {
        None
    };

    if ipc_mode {
        run_ipc_loop(&engine, &directory)?;
    } else {
        if let Some(path) = events {
            ingest_events(&engine, path)?;
        }
        let sweep = engine.run_monitor_sweep()?;
        let delivery = engine.run_delivery_sweep()?;
        log::info!(
            "runner: sweep triggered={} generated={}, delivery delivered={}",
            sweep.triggered,
            sweep.generated,
            delivery.delivered
        );
        print_summary(&engine)?;
    }

    if let Some(monitor) = monitor {
        monitor.stop();
    }
    Ok(())
}

fn ingest_events(engine: &BucketEngine, path: &str) -> Result<()> {
    let reader = BufReader::new(File::open(path).map_err(|e| anyhow::anyhow!("Cannot open {path}: {e}"))?);
    let (mut processed, mut rejected, mut duplicates) = (0usize, 0usize, 0usize);
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: ClaimEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("runner: {path}:{}: unreadable event: {e}", n + 1);
                rejected += 1;
                continue;
            }
        };
        match engine.apply_claim(&event)?.outcome {
            ClaimOutcome::Processed { .. } => processed += 1,
            ClaimOutcome::Rejected { reason } => {
                log::warn!("runner: claim {} rejected: {reason}", event.claim_id);
                rejected += 1;
            }
            ClaimOutcome::Duplicate => duplicates += 1,
        }
    }
    println!("  events:    {processed} processed, {rejected} rejected, {duplicates} duplicate");
    Ok(())
}

fn run_ipc_loop(engine: &BucketEngine, directory: &StaticPartyDirectory) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({ "error": "BAD_COMMAND", "message": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let reply = match handle_command(engine, directory, cmd) {
            Ok(result) => serde_json::json!({ "ok": result, "state": build_ui_state(engine)? }),
            Err(e) => {
                if !e.is_client_error() {
                    log::error!("runner: command failed: {e}");
                }
                serde_json::json!({ "error": e.code(), "message": e.to_string() })
            }
        };
        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(
    engine: &BucketEngine,
    directory: &StaticPartyDirectory,
    cmd: IpcCommand,
) -> Result<serde_json::Value, EngineError> {
    let value = match cmd {
        IpcCommand::GetState | IpcCommand::Quit => serde_json::Value::Null,
        IpcCommand::ApplyClaim { claim } => serde_json::to_value(engine.apply_claim(&claim)?)?,
        IpcCommand::Approve {
            bucket_id,
            actor,
            comments,
            generate_at,
        } => {
            let receipt = match generate_at {
                Some(at) => engine.approve_scheduled(&bucket_id, &actor, comments.as_deref(), at)?,
                None => engine.approve(&bucket_id, &actor, comments.as_deref())?,
            };
            serde_json::to_value(receipt)?
        }
        IpcCommand::Reject {
            bucket_id,
            actor,
            reason,
        } => serde_json::to_value(engine.reject(&bucket_id, &actor, &reason)?)?,
        IpcCommand::BulkApprove {
            bucket_ids,
            actor,
            comments,
        } => serde_json::to_value(engine.bulk_approve(&bucket_ids, &actor, comments.as_deref()))?,
        IpcCommand::Reset {
            bucket_id,
            actor,
            reason,
        } => serde_json::to_value(engine.reset(&bucket_id, &actor, &reason)?)?,
        IpcCommand::ConfigureParties { payers, payees } => {
            for payer in &payers {
                directory.configure_payer(payer);
            }
            for payee in &payees {
                directory.configure_payee(payee);
            }
            log::info!("runner: configured {} payer(s), {} payee(s)", payers.len(), payees.len());
            serde_json::Value::Null
        }
        IpcCommand::ResolveConfiguration { bucket_id, actor } => {
            serde_json::to_value(engine.resolve_configuration(&bucket_id, &actor)?)?
        }
        IpcCommand::Evaluate { bucket_id: Some(id) } => serde_json::to_value(engine.evaluate_bucket(&id)?)?,
        IpcCommand::Evaluate { bucket_id: None } => serde_json::to_value(engine.evaluate_all()?)?,
        IpcCommand::Sweep => {
            let buckets = engine.run_monitor_sweep()?;
            let delivery = engine.run_delivery_sweep()?;
            serde_json::json!({ "buckets": buckets, "delivery": delivery })
        }
        IpcCommand::Deliver { file_id } => serde_json::to_value(engine.attempt_delivery(&file_id)?)?,
        IpcCommand::MarkDelivered { file_id, actor } => {
            serde_json::to_value(engine.mark_delivered(&file_id, &actor)?)?
        }
        IpcCommand::RetryAllFailed => serde_json::to_value(engine.retry_all_failed()?)?,
    };
    Ok(value)
}

fn build_ui_state(engine: &BucketEngine) -> Result<UiState, EngineError> {
    let store = engine.store();
    Ok(UiState {
        now: engine.now(),
        accumulating: store.bucket_count(Some(BucketStatus::Accumulating))?,
        pending_approval: store.bucket_count(Some(BucketStatus::PendingApproval))?,
        missing_configuration: store.bucket_count(Some(BucketStatus::MissingConfiguration))?,
        completed: store.bucket_count(Some(BucketStatus::Completed))?,
        failed: store.bucket_count(Some(BucketStatus::Failed))?,
        files_pending: store.file_count(Some(DeliveryStatus::Pending))?,
        files_retrying: store.file_count(Some(DeliveryStatus::Retry))?,
        files_delivered: store.file_count(Some(DeliveryStatus::Delivered))?,
        files_failed: store.file_count(Some(DeliveryStatus::Failed))?,
        awaiting_approval: engine.buckets_with_status(BucketStatus::PendingApproval)?,
    })
}

fn print_summary(engine: &BucketEngine) -> Result<()> {
    let state = build_ui_state(engine)?;

    println!();
    println!("=== BUCKETS ===");
    println!("  accumulating:          {}", state.accumulating);
    println!("  pending approval:      {}", state.pending_approval);
    println!("  missing configuration: {}", state.missing_configuration);
    println!("  completed:             {}", state.completed);
    println!("  failed:                {}", state.failed);

    println!();
    println!("=== FILES ===");
    println!("  pending:   {}", state.files_pending);
    println!("  retrying:  {}", state.files_retrying);
    println!("  delivered: {}", state.files_delivered);
    println!("  failed:    {}", state.files_failed);

    if !state.awaiting_approval.is_empty() {
        println!();
        println!("=== AWAITING APPROVAL ===");
        for b in &state.awaiting_approval {
            println!(
                "  {} | {} -> {} | {} claims | {}",
                b.bucket_id, b.payer_id, b.payee_id, b.claim_count, b.total_amount
            );
        }
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
