//! MAGIC gateway daemon — ARINC 839 control plane between client
//! applications and the aircraft's datalinks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use magic_gateway::config::GatewayConfig;
use magic_gateway::dataplane::{Dataplane, LinuxDataplane, RecordingDataplane};
use magic_gateway::dlm::UnixDlmTransport;
use magic_gateway::meter::{ConntrackCounterSource, CounterSource, NullCounterSource};
use magic_gateway::server::Gateway;

/// Multi-link aggregation gateway daemon.
#[derive(Parser, Debug)]
#[command(name = "magic-gateway", about = "ARINC 839 multi-link aggregation gateway")]
struct Args {
    /// Directory holding the three configuration documents.
    #[arg(long, default_value = "/etc/magic/config")]
    config_dir: PathBuf,

    /// Override the control socket bind address.
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Override the CDR storage directory.
    #[arg(long)]
    cdr_dir: Option<PathBuf>,

    /// Do not touch the kernel dataplane; record operations in memory.
    /// Useful on development hosts without the routing tooling.
    #[arg(long)]
    no_dataplane: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise structured logging (controlled via RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = GatewayConfig::load(&args.config_dir)?;
    if let Some(listen) = args.listen {
        config.settings.listen_addr = listen;
    }
    if let Some(cdr_dir) = args.cdr_dir {
        config.settings.cdr_base_dir = cdr_dir;
    }

    let dataplane: Arc<dyn Dataplane> = if args.no_dataplane {
        Arc::new(RecordingDataplane::new())
    } else {
        Arc::new(LinuxDataplane::new())
    };
    let transport = Arc::new(UnixDlmTransport::new(Duration::from_millis(
        config.settings.dlm_confirm_timeout_ms,
    )));
    let counters: Arc<dyn CounterSource> = if args.no_dataplane {
        Arc::new(NullCounterSource)
    } else {
        Arc::new(ConntrackCounterSource::new())
    };

    let gateway = Gateway::boot(config, dataplane, transport, counters)?;
    gateway.run().await?;
    Ok(())
}
