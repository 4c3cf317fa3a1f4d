// CLI entry point for the VRED networking relay.
//
// Starts a standalone relay and runs until Ctrl+C / SIGINT, then shuts down
// cleanly and exits 0. Settings come from defaults, then an optional JSON
// config file, then flags or their environment variables.
//
// Usage:
//   relay [OPTIONS]
//     -c, --config <FILE>        JSON config file               [VRED_CONFIG]
//     --bind <ADDR>              Bind address (default 0.0.0.0) [VRED_BIND]
//     --tcp-port <PORT>          Stream port (default 40305)    [VRED_TCP_PORT]
//     --udp-port <PORT>          Datagram port (default 40306)  [VRED_UDP_PORT]
//     --udp-timeout <SECS>       Datagram peer timeout (10)     [VRED_UDP_TIMEOUT]
//     --sweep-interval <SECS>    Liveness sweep period (1)      [VRED_SWEEP_INTERVAL]
//     --no-keep-state            Don't send state to joiners    [VRED_NO_KEEP_STATE]
//     -v, --verbose              Debug logging unless RUST_LOG is set

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vred_relay::{RelayConfig, start_relay};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "State-sync relay for VRED networking")]
struct Args {
    /// JSON config file; flags override its values.
    #[arg(short, long, env = "VRED_CONFIG")]
    config: Option<PathBuf>,

    /// Address both transports bind to.
    #[arg(long, env = "VRED_BIND")]
    bind: Option<String>,

    /// Stream (TCP) port.
    #[arg(long, env = "VRED_TCP_PORT")]
    tcp_port: Option<u16>,

    /// Datagram (UDP) port.
    #[arg(long, env = "VRED_UDP_PORT")]
    udp_port: Option<u16>,

    /// Seconds of silence before a datagram peer is dropped.
    #[arg(long, env = "VRED_UDP_TIMEOUT")]
    udp_timeout: Option<f64>,

    /// Seconds between liveness sweeps.
    #[arg(long, env = "VRED_SWEEP_INTERVAL")]
    sweep_interval: Option<f64>,

    /// Don't keep the latest sync state for joining clients.
    #[arg(long, env = "VRED_NO_KEEP_STATE")]
    no_keep_state: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig, vred_relay::ConfigError> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.tcp_port {
            config.stream_port = port;
        }
        if let Some(port) = self.udp_port {
            config.datagram_port = port;
        }
        if let Some(secs) = self.udp_timeout {
            config.datagram_timeout_secs = secs;
        }
        if let Some(secs) = self.sweep_interval {
            config.sweep_interval_secs = secs;
        }
        if self.no_keep_state {
            config.keep_state = false;
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let (stop_tx, stop_rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        error!(error = %e, "could not install Ctrl+C handler");
        return ExitCode::FAILURE;
    }

    let (handle, addrs) = match start_relay(config) {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            return ExitCode::FAILURE;
        }
    };
    info!(stream = %addrs.stream, datagram = %addrs.datagram, "press Ctrl+C to stop");

    // Blocks until the handler fires.
    let _ = stop_rx.recv();
    info!("interrupt received, shutting down");
    handle.stop();
    ExitCode::SUCCESS
}
