use std::{path::Path, process, time::Duration};

use archivist::{
    config::{self, Config, Telemetry},
    lifecycle::{self, ArchiveLifecycleManager},
    runner::{CommandRunner, ProcessRunner},
    schedule::{self, pending_archives, process_all},
};
use archivist_influx::Client;
use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    sync::watch,
    time,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const STORE_RETRY: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load archivist config: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Lifecycle(#[from] lifecycle::Error),
    #[error(transparent)]
    Schedule(#[from] schedule::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/archivist/archivist.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every archive currently in the watch directory, then exit
    Run(RunCommand),
    /// Process archives as they arrive until interrupted
    Watch(WatchCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// ignore the validated metric cache and validate every archive again
    #[clap(long)]
    force_revalidate: bool,
}

#[derive(Args)]
struct WatchCommand {
    #[command(flatten)]
    run: RunCommand,
    /// the time, in seconds, between scans of the watch directory
    #[clap(long, default_value_t = 10)]
    poll_interval_seconds: u64,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

enum Mode {
    Once,
    Poll(Duration),
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting archivist {version}.");

    let (run, mode) = match Cli::parse().command {
        Commands::Run(run) => (run, Mode::Once),
        Commands::Watch(cmd) => (
            cmd.run,
            Mode::Poll(Duration::from_secs(cmd.poll_interval_seconds.max(1))),
        ),
        Commands::ConfigCheck(cmd) => match config::load(Path::new(&cmd.config_path)) {
            Ok(_) => {
                info!("Configuration file is valid");
                process::exit(0)
            }
            Err(e) => {
                error!("Configuration validation failed: {e}");
                process::exit(1)
            }
        },
    };
    let config = config::load(Path::new(&run.config_path))?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, run.force_revalidate, mode));
    if let Err(e) = &res {
        error!("archivist failed: {e}");
    }
    res
}

async fn inner_main(config: Config, force_revalidate: bool, mode: Mode) -> Result<(), Error> {
    if let Some(Telemetry {
        prometheus: Some(prometheus),
    }) = &config.telemetry
    {
        PrometheusBuilder::new()
            .with_http_listener(prometheus.addr)
            .install()?;
        info!(addr = %prometheus.addr, "prometheus exporter listening");
    }

    let (shutdown_snd, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c");
            let _ = shutdown_snd.send(true);
        }
    });

    info!(
        product_type = %config.tags.product_type,
        serial_number = %config.tags.serial_number,
        "points will be tagged"
    );
    let watch_dir = config.directories.watch.clone();
    let suffixes = config.tools.archive_suffixes.clone();
    let runner = CommandRunner::new(config.tools.command_timeout());
    let mut manager = ArchiveLifecycleManager::new(config, runner, force_revalidate).await?;

    if !wait_for_store(manager.client(), shutdown.clone()).await {
        return Ok(());
    }

    match mode {
        Mode::Once => {
            pass(&mut manager, &watch_dir, &suffixes, &shutdown).await?;
        }
        Mode::Poll(interval) => loop {
            pass(&mut manager, &watch_dir, &suffixes, &shutdown).await?;
            if *shutdown.borrow() {
                break;
            }
            let mut stop = shutdown.clone();
            tokio::select! {
                Ok(()) = stop.changed() => break,
                () = time::sleep(interval) => {}
            }
        },
    }
    info!("archivist shutting down");
    Ok(())
}

async fn pass<R>(
    manager: &mut ArchiveLifecycleManager<R>,
    watch_dir: &Path,
    suffixes: &[String],
    shutdown: &watch::Receiver<bool>,
) -> Result<schedule::Summary, Error>
where
    R: ProcessRunner + Sync,
{
    let archives = pending_archives(watch_dir, suffixes).await?;
    let summary = process_all(manager, &archives, || *shutdown.borrow()).await;
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some archives failed, see the failed directory");
    }
    Ok(summary)
}

/// Ping the store until it answers. Returns `false` if interrupted first.
async fn wait_for_store(client: &Client, mut shutdown: watch::Receiver<bool>) -> bool {
    loop {
        match client.ping().await {
            Ok(status) => {
                info!(%status, "store is reachable");
                return true;
            }
            Err(e) => warn!("store unreachable, retrying in {STORE_RETRY:?}: {e}"),
        }
        tokio::select! {
            Ok(()) = shutdown.changed() => {
                info!("interrupted while waiting for the store");
                return false;
            }
            () = time::sleep(STORE_RETRY) => {}
        }
    }
}
