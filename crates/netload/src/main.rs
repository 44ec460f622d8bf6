//! netload: background iperf3 traffic for networking self-tests.
//!
//! - `run` starts traffic, waits for a packet count on the local interface,
//!   then tears everything down
//! - `remote` runs a single client against a one-off server on the remote
//! - `check` validates the environment and the required tools

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use netload::stats::IfaceCounter;
use netload::{Config, Host, TrafficMonitor};
use tracing_subscriber::EnvFilter;

/// Background traffic generator for kernel networking tests.
#[derive(Parser, Debug)]
#[command(name = "netload", about = "iperf3 background traffic with ramp-up detection")]
struct Cli {
    /// TOML config file. NETIF, LOCAL_V4/6, REMOTE_V4/6, REMOTE_TYPE and
    /// REMOTE_ARGS override its values.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start traffic, wait for a packet count, stop.
    Run {
        /// Server port (random if unset).
        #[arg(long)]
        port: Option<u16>,

        /// Packets to observe on the interface before stopping.
        #[arg(long, default_value_t = 1000)]
        packets: u64,
    },
    /// One-shot exchange against a one-off server on the remote.
    Remote {
        /// Server port (random if unset).
        #[arg(long)]
        port: Option<u16>,

        /// Extra client arguments, e.g. `-- -u -t 1`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Resolve the config and check iperf3 is available on both ends.
    Check,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref()).context("loading configuration")?;

    tracing::info!(
        ifname = %cfg.env.ifname,
        addr = %cfg.env.addr,
        remote_addr = %cfg.env.remote_addr,
        remote = %cfg.env.remote,
        "netload starting"
    );

    match cli.command {
        Command::Run { port, packets } => {
            let counter = IfaceCounter::new(cfg.env.ifname.clone(), Host::Local);
            let monitor = TrafficMonitor::start_with(&cfg.env, port, cfg.tuning.clone(), Box::new(counter))
                .context("starting traffic")?;
            let port = monitor.port();
            let reached = monitor
                .wait_pkts_and_stop(packets)
                .context("stopping traffic")?;
            if !reached {
                anyhow::bail!("saw fewer than {packets} packets on {} (port {port})", cfg.env.ifname);
            }
            tracing::info!(packets, port, "traffic done");
        }
        Command::Remote { port, args } => {
            let proc = netload::load::run_remote_test(&cfg.env, port, &args.join(" "), &cfg.tuning)?;
            print!("{}", proc.stdout());
        }
        Command::Check => {
            cfg.env
                .require_cmd("iperf3", true)
                .context("checking for iperf3")?;
            tracing::info!("environment ok");
        }
    }

    Ok(())
}
