use clap::Parser;
use instance::identity::{self, IdentityReconciler, SqliteIdentityStore, SyncToken};
use instance::{AgentConfig, ClientSyncAgent, CoordinatorLink};
use log::{error, info, warn};
use shared::transport::Messenger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator address to connect to
    #[arg(short = 'c', long, default_value = "127.0.0.1:8080")]
    coordinator: String,

    /// Shared secret presented to the coordinator
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Logical name of this instance
    #[arg(short = 'n', long, default_value = "server")]
    name: String,

    /// Directory holding the persistent instance token
    #[arg(short = 'd', long, default_value = ".")]
    data_dir: PathBuf,

    /// SQLite report store used for identity reconciliation
    #[arg(long)]
    database: Option<PathBuf>,

    /// Name of the reporting player
    #[arg(long, requires_all = ["reported", "reason"])]
    reporter: Option<String>,

    /// Name of the reported player
    #[arg(long)]
    reported: Option<String>,

    /// Reason given for the report
    #[arg(long)]
    reason: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting instance {}...", args.name);

    let store = match &args.database {
        Some(path) => Some(open_store(path, &args).await?),
        None => None,
    };

    let mut link = CoordinatorLink::connect(&args.coordinator, Arc::new(Messenger::new())).await?;
    let config = AgentConfig {
        token: args.token.clone().map(SyncToken::new),
        ..AgentConfig::default()
    };
    let agent = ClientSyncAgent::new(config, link.channel());
    link.spawn_receiver();
    link.attach_carrier();

    if !agent.authenticate().await {
        error!("Could not authenticate with coordinator at {}", args.coordinator);
        agent.cleanup();
        return Ok(());
    }
    agent.spawn_health_check();

    if let (Some(reporter), Some(reported), Some(reason)) =
        (&args.reporter, &args.reported, &args.reason)
    {
        let id = match &store {
            Some(store) => store.record_report(reporter, reported, reason, &args.name)?,
            None => 0,
        };

        let id_text = id.to_string();
        let report = [
            ("id", id_text.as_str()),
            ("reporter_name", reporter.as_str()),
            ("reported_name", reported.as_str()),
            ("reason", reason.as_str()),
            ("server_name", args.name.as_str()),
            ("status", "PENDING"),
        ];

        if agent.send_message("NEW_REPORT", report).await {
            info!("Report #{} synced with coordinator", id);
        } else {
            warn!("Failed to sync report #{} with coordinator", id);
        }
    } else {
        info!("Connected, press Ctrl+C to disconnect");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    }

    agent.cleanup();
    Ok(())
}

/// Connects the report store and reconciles this instance's identity in it
async fn open_store(
    path: &Path,
    args: &Args,
) -> Result<SqliteIdentityStore, Box<dyn std::error::Error>> {
    let identity_token = identity::load_or_create(&args.data_dir)?;
    let store = SqliteIdentityStore::connect(path, 3, Duration::from_secs(1)).await?;

    let reconciler = IdentityReconciler::new(store);
    match reconciler.reconcile(&identity_token, &args.name) {
        Ok(outcome) => info!("Identity reconciled: {:?}", outcome),
        Err(e) => error!("Identity reconciliation failed: {}", e),
    }
    if reconciler.has_multiple_instances().unwrap_or(false) {
        info!("Report store is shared with other instances");
    }

    Ok(reconciler.into_store())
}
