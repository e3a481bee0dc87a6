//! The Tincan dataplane process: one control channel, any number of virtual
//! networks, all configuration supplied by the controller at runtime.

mod dispatch;
mod logging;
mod supervisor;

use anyhow::{Context as _, Result};
use clap::Parser;
use tincan_control::{ControlChannel, DEFAULT_CONTROL_PORT};

use crate::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "tincan", disable_version_flag = true)]
struct Args {
    /// Print version information and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// UDP port the controller reaches us on.
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,
}

fn main() {
    let args = Args::parse();

    if args.version {
        println!("tincan {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let log = match logging::init() {
        Ok(log) => log,
        Err(e) => {
            eprintln!("tincan: {e:#}");
            std::process::exit(-1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building the tokio runtime");

    if let Err(e) = runtime.block_on(run(args, log)) {
        tracing::error!("Fatal: {e:#}");
        std::process::exit(-1);
    }
}

async fn run(args: Args, log: logging::LogController) -> Result<()> {
    let (channel, mut inbound) = ControlChannel::bind(args.port)
        .await
        .context("Failed to start the control channel")?;

    let supervisor = Supervisor::new(channel.responder(), log);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), port = args.port, "Tincan started");

    loop {
        tokio::select! {
            control = inbound.recv() => {
                match control {
                    Some(control) => dispatch::dispatch(&supervisor, control).await,
                    None => break,
                }
            }
            () = shutdown_signal() => break,
        }
    }

    supervisor.shutdown();

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).expect("installing the SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }

    tracing::info!("Shutdown signal received");
}
