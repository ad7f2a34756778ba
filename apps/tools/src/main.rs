mod simulate;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use message_retrieval::{
    load_config, AccountFlags, AppLifecycleTracker, ChannelJobScheduler, ConnectionSupervisor,
    MessageBatchProcessor, NetworkStateAggregator, PassthroughDecryptor, ProcessingLocks,
    SupervisorDeps, TokioSleepTimer,
};
use shared::domain::ServiceId;
use storage::Storage;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::simulate::{generate_envelopes, SimulatedMonitor, SimulatedTransport};

const SENT_BASE_TIMESTAMP: i64 = 1_600_000_000_000;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://retrieval.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the retrieval loop against an in-process socket until the queue drains.
    Simulate {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 100)]
        messages: usize,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    RecordSent {
        timestamp: i64,
        recipient: String,
    },
    ShowReceipt {
        timestamp: i64,
        recipient: String,
    },
}

fn parse_service_id(raw: &str) -> Result<ServiceId> {
    match ServiceId::parse_or_none(raw) {
        Some(service_id) => Ok(service_id),
        None => bail!("invalid service id: {raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::Simulate {
            config,
            messages,
            timeout_secs,
        } => simulate(storage, config, messages, timeout_secs).await?,
        Command::RecordSent {
            timestamp,
            recipient,
        } => {
            let recipient = parse_service_id(&recipient)?;
            storage.record_sent_message(timestamp, recipient).await?;
            println!("recorded sent message timestamp={timestamp} recipient={recipient}");
        }
        Command::ShowReceipt {
            timestamp,
            recipient,
        } => {
            let recipient = parse_service_id(&recipient)?;
            match storage.delivery_receipt_state(timestamp, recipient).await? {
                Some(state) => println!(
                    "delivery_receipt_count={} last_receipt_at={}",
                    state.delivery_receipt_count,
                    state
                        .last_receipt_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "-".into())
                ),
                None => println!("no sent message for timestamp={timestamp} recipient={recipient}"),
            }
        }
    }

    Ok(())
}

async fn simulate(
    storage: Storage,
    config_path: Option<PathBuf>,
    messages: usize,
    timeout_secs: u64,
) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let storage = Arc::new(storage);

    let sender = ServiceId::Aci(Uuid::new_v4());
    let sent: Vec<i64> = (0..messages / 4)
        .map(|i| SENT_BASE_TIMESTAMP + i as i64)
        .collect();
    for timestamp in &sent {
        storage.record_sent_message(*timestamp, sender).await?;
    }

    let transport = Arc::new(SimulatedTransport::new(generate_envelopes(
        messages, sender, &sent,
    )));
    let lifecycle = Arc::new(AppLifecycleTracker::new());
    lifecycle.on_foreground();
    let network = Arc::new(NetworkStateAggregator::new(
        Arc::new(SimulatedMonitor),
        config.clone(),
    ));
    let (scheduler, mut jobs) = ChannelJobScheduler::new();
    let processor = Arc::new(MessageBatchProcessor::new(
        storage.clone(),
        Arc::new(PassthroughDecryptor),
        Arc::new(scheduler),
        Arc::new(ProcessingLocks::new()),
    ));
    let supervisor = ConnectionSupervisor::new(
        config,
        SupervisorDeps {
            transport: transport.clone(),
            lifecycle,
            network,
            account: Arc::new(AccountFlags::default()),
            processor,
            sleep_timer: Arc::new(TokioSleepTimer),
        },
    );

    let drained = Arc::new(Notify::new());
    let signal = Arc::clone(&drained);
    supervisor.add_decryption_drained_listener(Arc::new(move || signal.notify_one()));
    supervisor.start();

    let finished = tokio::time::timeout(Duration::from_secs(timeout_secs), drained.notified())
        .await
        .is_ok();
    supervisor.terminate().await;
    supervisor.join().await;

    let mut follow_ups = 0usize;
    while jobs.try_recv().is_ok() {
        follow_ups += 1;
    }
    info!(
        drained = finished,
        acked = transport.acked(),
        follow_ups,
        "sim: finished"
    );
    println!(
        "drained={finished} acked={} follow_ups={follow_ups}",
        transport.acked()
    );
    if !finished {
        bail!("queue did not drain within {timeout_secs}s");
    }
    Ok(())
}
