//! Command-line entry points for standalone broker and core processes.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use weave_broker::{Broker, BrokerConfig, Core, CoreConfig, NodeConfig};
use weave_core::CoreType;

#[derive(Parser)]
#[command(name = "weave", about = "weave co-simulation runtime")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter, e.g. "info" or "weave_broker=debug".
    #[arg(long, default_value = "info", global = true)]
    loglevel: String,

    /// Enable verbose internal logging.
    #[arg(long, global = true)]
    debugging: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a broker (the root, unless --broker points at a parent).
    Broker(BrokerArgs),
    /// Run a standalone core process.
    Core(CoreArgs),
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Participant name within the federation.
    #[arg(long)]
    name: String,

    /// Transport: tcp, tcpss, udp, inproc, test.
    #[arg(long = "coretype", default_value = "tcp")]
    core_type: CoreType,

    /// Parent broker address ("host:port").
    #[arg(long)]
    broker: Option<String>,

    /// Parent broker port, combined with a bare --broker host.
    #[arg(long)]
    brokerport: Option<u16>,

    /// Local listening port (0 picks one).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Local interface to bind.
    #[arg(long = "local_interface", default_value = "127.0.0.1")]
    local_interface: String,

    /// Connection/disconnection timeout in seconds.
    #[arg(long, default_value_t = 4.0)]
    timeout: f64,

    /// Escalate any local error to a federation-wide abort.
    #[arg(long = "terminate_on_error")]
    terminate_on_error: bool,
}

impl CommonArgs {
    fn node_config(&self) -> NodeConfig {
        let broker_address = self.broker.as_ref().map(|addr| {
            match (addr.contains(':'), self.brokerport) {
                (false, Some(port)) => format!("{addr}:{port}"),
                _ => addr.clone(),
            }
        });
        let timeout = Duration::from_secs_f64(self.timeout);
        let mut node = NodeConfig::new(&self.name, self.core_type);
        node.broker_address = broker_address;
        node.local_interface = self.local_interface.clone();
        node.port = self.port;
        node.connect_timeout = timeout;
        node.disconnect_timeout = timeout;
        node.terminate_on_error = self.terminate_on_error;
        node
    }
}

#[derive(clap::Args)]
struct BrokerArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Minimum direct children before the federation may initialize.
    #[arg(long = "minbrokers", default_value_t = 1)]
    min_brokers: usize,
}

#[derive(clap::Args)]
struct CoreArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of federates this core expects to host.
    #[arg(long, short = 'f', default_value_t = 1)]
    federates: usize,
}

/// Parse the command line and run until the participant disconnects.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debugging {
        "debug".to_string()
    } else {
        cli.loglevel.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Command::Broker(args) => {
            let mut config = BrokerConfig::new(args.common.node_config());
            config.min_children = args.min_brokers;
            let mut broker = Broker::connect(config)
                .await
                .context("failed to start broker")?;
            tracing::info!(
                name = %broker.name(),
                address = %broker.address(),
                "broker running"
            );
            while !broker.wait_for_disconnect(Duration::from_secs(3600)).await {}
            tracing::info!("broker disconnected");
        }
        Command::Core(args) => {
            tracing::debug!(expected_federates = args.federates, "starting core");
            let config = CoreConfig::new(args.common.node_config());
            let mut core = Core::connect(config).await.context("failed to start core")?;
            tracing::info!(name = %core.name(), address = %core.address(), "core running");
            while !core.wait_for_disconnect(Duration::from_secs(3600)).await {}
            tracing::info!("core disconnected");
        }
    }
    Ok(())
}
