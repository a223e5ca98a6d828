use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ping_ledger::config::{self, HostSource, OUTCOME_QUEUE_DEPTH};
use ping_ledger::{AppConfig, Cadence, Error, EventStore, Fleet, IcmpTransport, SqliteStore, Tracker};

/// Pings a list of hosts and records when each one was reachable.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Hosts to monitor. Falls back to $HOSTLIST, then the config file.
    hosts: Vec<String>,

    /// SQLite database receiving the history.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let app_config = AppConfig::load();
    if cli.hosts.is_empty() {
        // a missing .env is fine
        let _ = dotenvy::dotenv();
    }
    let env_hostlist = std::env::var(config::HOSTLIST_ENV).ok();
    let (hosts, source) = config::resolve_hosts(&cli.hosts, env_hostlist.as_deref(), &app_config);
    if source == HostSource::BuiltIn {
        log::warn!("neither HOSTLIST nor arglist given, using the default hostlist");
    }
    if hosts.is_empty() {
        return Err(Error::NoHosts);
    }
    log::info!("the next hosts will be monitored: {hosts:?}");

    let database = cli.database.unwrap_or(app_config.database);
    let store = SqliteStore::open(&database)?;
    log::info!("recording history into {}", database.display());

    let cadence = Cadence::default();
    let (outcomes, samples) = mpsc::channel(OUTCOME_QUEUE_DEPTH);
    let tracker_cancel = CancellationToken::new();
    let mut tracker = tokio::spawn(Tracker::new(store).run(samples, tracker_cancel.clone()));

    let fleet = Fleet::new(
        IcmpTransport::new(cadence.reap_interval),
        cadence,
        outcomes,
        CancellationToken::new(),
    );
    for host in &hosts {
        fleet.add_host(host);
    }

    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        // the tracker only stops on its own after a contract violation
        finished = &mut tracker => Some(finished),
    };
    log::info!("shutting down...");
    fleet.shutdown().await;

    let finished = match early_exit {
        Some(finished) => finished,
        None => {
            // a second signal abandons whatever is still queued
            let impatient = tokio::spawn(async move {
                shutdown_signal().await;
                tracker_cancel.cancel();
            });
            // the fleet held the last senders, so the tracker drains and returns
            let finished = tracker.await;
            impatient.abort();
            finished
        }
    };
    let tracker = finished??;
    tracker.log_status();
    tracker.into_store().close()?;
    log::info!("done.");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
