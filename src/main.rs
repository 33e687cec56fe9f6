use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use clap_derive::Parser;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, Level};

use fifocast::broadcast::FifoBroadcastApp;
use fifocast::config::{Hosts, RunMode};
use fifocast::event_log::EventLog;
use fifocast::link::PerfectLinkApp;

#[derive(Parser)]
struct Args {
    /// this process' id in the hosts file
    #[clap(long)]
    id: u32,

    /// membership table, one `<id> <ip> <port>` line per process
    #[clap(long)]
    hosts: PathBuf,

    /// where to write the event log
    #[clap(long)]
    output: PathBuf,

    /// run config; the first line selects the mode
    config: PathBuf,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let hosts = Arc::new(Hosts::load(&args.hosts)?);
    let mode = RunMode::load(&args.config)?;
    let log = Arc::new(EventLog::new(&args.output));

    match mode {
        RunMode::PerfectLink { message_count, receiver_id } => {
            hosts.get(receiver_id)
                .context("config names a receiver that is not in the hosts file")?;

            let mut app =
                PerfectLinkApp::new(args.id, hosts.clone(), message_count, receiver_id, log).await?;
            app.start();

            select! {
                _ = app.wait_done() => {
                    info!("all messages acknowledged");
                }
                result = wait_for_stop_signal() => {
                    result?;
                }
            }
            app.shut_down().await;
        }
        RunMode::FifoBroadcast { message_count } => {
            let mut app =
                FifoBroadcastApp::new(args.id, hosts.clone(), message_count, log).await?;
            app.start();

            wait_for_stop_signal().await?;
            app.shut_down().await;
        }
        RunMode::LatticeAgreement { .. } => {
            bail!("lattice agreement runs are not supported");
        }
    }

    Ok(())
}

async fn wait_for_stop_signal() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    select! {
        _ = sigterm.recv() => info!("received SIGTERM - shutting down"),
        _ = sigint.recv() => info!("received SIGINT - shutting down"),
    }
    Ok(())
}
