use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing::{error, info, warn};

use darknode::config::{self, LogLevel};
use darknode::host::Libp2pHost;
use darknode::net::boot;
use darknode::net::dial::dial_bootstrap_set;
use darknode::net::ip::{HttpIpResolver, IpResolver, StaticIpResolver};
use darknode::node_config::{self, GenerateOptions, Startup};

#[derive(Parser)]
#[command(name = "darknode")]
#[command(about = "Darknode: joins the republic overlay and serves the DHT.")]
struct Args {
    /// Configuration file, created on first start if missing
    #[arg(long, default_value_os_t = node_config::default_config_path())]
    config: PathBuf,

    /// TCP port to listen on when generating a configuration
    #[arg(long, default_value_t = node_config::DEFAULT_PORT)]
    port: u16,

    /// Public IPv4 address to advertise instead of querying an echo service
    #[arg(long)]
    public_ip: Option<Ipv4Addr>,

    /// Node key file; loaded if present, written after generation otherwise
    #[arg(long)]
    key: Option<PathBuf>,

    /// Extra bootstrap peers, one canonical address per line
    #[arg(long)]
    bootstrap_file: Option<PathBuf>,

    /// Stop after the configuration is active, without dialing the bootstrap set
    #[arg(long)]
    no_dial: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value_t = config::get_log_level())]
    log_level: LogLevel,
}

async fn start<R: IpResolver>(args: &Args, resolver: &R) -> Result<()> {
    let options = GenerateOptions {
        host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: args.port,
        key_path: args.key.clone(),
    };

    let extra_peers = match &args.bootstrap_file {
        Some(path) => boot::read_peer_list(path)?,
        None => Vec::new(),
    };

    let active = Startup::new(&args.config)
        .with_extra_peers(extra_peers)
        .run(&options, resolver)
        .await?;
    let config = active.config();
    info!(
        origin = ?active.origin(),
        address = %config.address(),
        multiaddress = %config.multiaddress(),
        bootstrap_peers = config.bootstrap().len(),
        "Configuration active"
    );

    if args.no_dial {
        return Ok(());
    }

    let host = Libp2pHost::new(config.clone())?;
    let dialer = host.dialer();
    let host_task = tokio::spawn(host.run());

    let report = dial_bootstrap_set(
        &dialer,
        config.bootstrap(),
        Some(config.multiaddress()),
        config.network(),
    )
    .await?;
    for peer in report.unreachable_peers() {
        warn!(peer = %peer, "Bootstrap peer unreachable");
    }
    dialer.bootstrap_dht().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    drop(dialer);
    host_task.await??;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    config::init_tracing(args.log_level);

    let result = match args.public_ip {
        Some(ip) => start(&args, &StaticIpResolver(ip)).await,
        None => start(&args, &HttpIpResolver::default()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Darknode failed to start: {e:#}");
            let _ = Args::command().print_help();
            ExitCode::FAILURE
        }
    }
}
