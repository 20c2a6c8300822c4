use std::time::Duration;

use clap::Parser;
use loopdns_domain::{CliOverrides, Config, ListenerMode};
use loopdns_infrastructure::resolver::ForwardingResolver;
use loopdns_infrastructure::stub::{nsid_string, StubDispatcher, StubListenerSet};
use loopdns_infrastructure::system::EtcMachineId;
use tracing::info;

mod bootstrap;

#[derive(Parser)]
#[command(name = "loopdns")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "loopdns - local DNS stub resolver")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// Primary stub listener mode (no, udp, tcp, yes)
    #[arg(short = 'l', long)]
    listener: Option<ListenerMode>,

    /// Extra listener spec, [udp:|tcp:]ADDRESS[:PORT]; repeatable
    #[arg(long = "extra", value_name = "SPEC")]
    extra: Vec<String>,

    /// Upstream DNS server, IP:PORT; repeatable
    #[arg(short = 'u', long = "upstream", value_name = "ADDR")]
    upstream: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

/// The whole stub runs on one thread: socket readiness, stream reads and
/// resolver completions interleave on a single event loop.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        listener_mode: cli.listener,
        extra_listeners: (!cli.extra.is_empty()).then_some(cli.extra),
        upstream_servers: (!cli.upstream.is_empty()).then_some(cli.upstream),
        log_level: cli.log_level,
    };
    let config = Config::load(cli.config.as_deref(), overrides)?;

    bootstrap::init_logging(&config);
    info!("Starting loopdns v{}", env!("CARGO_PKG_VERSION"));

    let servers = config
        .upstream
        .servers
        .iter()
        .map(|s| s.parse())
        .collect::<Result<Vec<_>, _>>()?;
    let resolver = ForwardingResolver::new(
        servers,
        Duration::from_secs(config.upstream.query_timeout),
    );

    let machine_id = EtcMachineId::new();
    let nsid = nsid_string(&machine_id);

    let dispatcher = StubDispatcher::new(resolver, nsid);
    let listeners = StubListenerSet::start(&config, dispatcher)?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    listeners.stop();
    Ok(())
}
