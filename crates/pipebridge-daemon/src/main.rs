//! `pipebridge` daemon
//!
//! Spawns one child process and serves its stdin/stdout/stderr to
//! websocket clients.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use pipebridge_core::Config;
use pipebridge_daemon::server::{Server, ServerConfig};
use pipebridge_daemon::shutdown;
use pipebridge_daemon::subprocess::{BridgeConfig, BridgeState, ProcessBridge};

/// Name of the bundled demo child, looked up next to this executable.
const TICKER_BIN: &str = "pipebridge-ticker";

#[derive(Parser, Debug)]
#[command(name = "pipebridge")]
#[command(version, about = "pipebridge - child process stdio over websocket")]
struct Args {
    /// Config file (JSON). Defaults to the global settings.json if present.
    #[arg(long, env = "PIPEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to bind
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent websocket connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum lines waiting for the child's stdin
    #[arg(long)]
    input_capacity: Option<usize>,

    /// What to do with input when the queue is full.
    #[arg(long, value_parser = ["block", "reject", "drop-oldest"])]
    overflow: Option<String>,

    /// How output is shared between connections.
    #[arg(long, value_parser = ["single-consumer", "broadcast"])]
    fanout: Option<String>,

    /// Seconds to wait for graceful child shutdown before escalating.
    #[arg(long)]
    terminate_timeout: Option<u64>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PIPEBRIDGE_LOG_JSON")]
    log_json: bool,

    /// Program to run, followed by its arguments. Defaults to the bundled
    /// `pipebridge-ticker` demo.
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    /// Apply CLI flags on top of the file/env configuration.
    fn merge_into(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(max) = self.max_connections {
            config.server.max_connections = max;
        }
        if let Some(capacity) = self.input_capacity {
            config.queues.input_capacity = capacity;
        }
        if let Some(overflow) = &self.overflow {
            config.queues.overflow = overflow.parse()?;
        }
        if let Some(fanout) = &self.fanout {
            config.fanout = fanout.parse()?;
        }
        if let Some(secs) = self.terminate_timeout {
            config.process.terminate_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        if let Some((program, args)) = self.command.split_first() {
            config.process.program = Some(PathBuf::from(program));
            config.process.args = args.to_vec();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = pipebridge_core::config::load_config(args.config.as_deref())?;
    args.merge_into(&mut config)?;
    config.validate()?;

    let level = &config.log_level;
    let log_filter = format!("pipebridge_daemon={level},pipebridge_core={level}");
    pipebridge_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let program = match &config.process.program {
        Some(program) => program.clone(),
        None => default_program()?,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        program = %program.display(),
        args = ?config.process.args,
        fanout = %config.fanout,
        overflow = %config.queues.overflow,
        "Starting pipebridge"
    );

    // Spawn failure is fatal: never listen without a process behind us.
    let bridge = Arc::new(ProcessBridge::start(BridgeConfig::from_config(&program, &config))?);

    let addr = tokio::net::lookup_host(config.bind_address())
        .await?
        .next()
        .with_context(|| format!("Cannot resolve {}", config.bind_address()))?;
    let server_config = ServerConfig::new(addr).with_max_connections(config.server.max_connections);
    let server = Server::bind(server_config, Arc::clone(&bridge)).await?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let mut server_task = tokio::spawn(server.serve(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so the bridged child
    // doesn't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let state = tokio::select! {
        result = &mut server_task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            let _ = shutdown_tx.send(true);
            server_task.await??
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            let _ = shutdown_tx.send(true);
            server_task.await??
        }
    };

    info!(?state, "pipebridge stopped");
    match state {
        BridgeState::Terminated {
            exit_code: Some(code),
        } if code != 0 => std::process::exit(code),
        _ => Ok(()),
    }
}

/// The demo ticker installed alongside this binary.
fn default_program() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot determine current executable")?;
    let mut ticker = exe.with_file_name(TICKER_BIN);
    if cfg!(windows) {
        ticker.set_extension("exe");
    }
    Ok(ticker)
}
