use clap::Parser;
use coordinator::handlers::{LogSink, ReportBroadcaster, NEW_REPORT};
use coordinator::{CoordinatorSyncHub, HubConfig, RelayServer};
use log::{error, info};
use shared::transport::Messenger;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'b', long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Token instances must present to authenticate
    #[arg(short = 's', long)]
    secret: String,

    /// Name advertised to instances
    #[arg(short = 'n', long, default_value = coordinator::hub::DEFAULT_NAME)]
    name: String,

    /// Seconds of silence before a peer is dropped
    #[arg(long, default_value = "60")]
    peer_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = HubConfig {
        name: args.name.clone(),
        ..HubConfig::new(args.secret.clone())
    };
    let hub = CoordinatorSyncHub::new(config)
        .with_handler(NEW_REPORT, ReportBroadcaster::new(LogSink));

    info!("Starting coordinator {}...", args.name);

    let mut server = RelayServer::bind(
        &args.bind,
        Arc::new(hub),
        Arc::new(Messenger::new()),
        Duration::from_secs(args.peer_timeout),
    )
    .await?;

    tokio::select! {
        _ = server.run() => {
            error!("Relay loop stopped unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
