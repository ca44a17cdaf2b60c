//! CLI entry point for the arc velocity cluster.
//!
//! Provides subcommands for running the master and workers, submitting historical
//! batches and streaming windows, and running a whole cluster in one process.

use anyhow::{Context, Result, bail};
use arc_velocity::{
    config::Config,
    loader::{load_datagrams, load_topology, split_windows},
    master::{DistributedMaster, WorkerHandle},
    metrics::Metrics,
    model::{Datagram, VelocityResult, merge_arc_velocities},
    output::{append_arc_records, log_arc_table, log_task_results},
    persistence::{MemorySink, S3Sink, VelocitySink},
    rpc::{MasterClient, serve_master, serve_worker},
    worker::{VelocityWorker, Worker},
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const REGISTRATION_ATTEMPTS: u32 = 10;
const REGISTRATION_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const REGISTRATION_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "arc_velocity")]
#[command(about = "Distributed per-arc velocity computation for transit telemetry", long_about = None)]
struct Cli {
    /// Optional JSON configuration file; environment variables override it
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the topology and serve the master
    Master {
        /// Directory containing stops.csv and linestops.csv (defaults to DATA_PATH)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Serve a worker and register it with the master
    Worker {
        /// Worker id reported to the master
        #[arg(long)]
        id: String,

        /// Master address (host:port); defaults to MASTER_HOST:MASTER_PORT
        #[arg(short, long)]
        master: Option<String>,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:0")]
        listen: String,

        /// Host the master should use to reach this worker
        #[arg(long)]
        advertise: Option<String>,

        /// Optional: S3 bucket to persist per-arc velocities to
        #[arg(long)]
        s3_bucket: Option<String>,
    },
    /// Submit a historical batch to the master
    Process {
        /// Datagram CSV export
        #[arg(short, long)]
        datagrams: PathBuf,

        /// Maximum number of datagrams to load
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// CSV file to append per-arc results to
        #[arg(short, long, default_value = "arc_velocity.csv")]
        output: PathBuf,

        /// Master address (host:port)
        #[arg(short, long)]
        master: Option<String>,
    },
    /// Submit a datagram export as consecutive streaming windows
    Stream {
        /// Datagram CSV export
        #[arg(short, long)]
        datagrams: PathBuf,

        /// Window span; defaults to STREAMING_WINDOW_SECONDS
        #[arg(short, long)]
        window_seconds: Option<i64>,

        /// Maximum number of datagrams to load
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Master address (host:port)
        #[arg(short, long)]
        master: Option<String>,
    },
    /// Show the master's status line
    Status {
        /// Master address (host:port)
        #[arg(short, long)]
        master: Option<String>,
    },
    /// Run a master and in-process workers without networking
    Local {
        /// Directory containing stops.csv and linestops.csv (defaults to DATA_PATH)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Datagram CSV export
        #[arg(short, long)]
        datagrams: PathBuf,

        /// Number of in-process workers
        #[arg(short, long, default_value_t = 2)]
        workers: usize,

        /// Maximum number of datagrams to load
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Optional: CSV file to append per-arc results to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/arc_velocity.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("arc_velocity.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(LevelFilter::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive(LevelFilter::DEBUG.into()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Commands::Master { data_dir } => {
            let data_dir = data_dir.unwrap_or_else(|| config.data_path.clone());
            run_master(&config, &data_dir).await?;
        }
        Commands::Worker {
            id,
            master,
            listen,
            advertise,
            s3_bucket,
        } => {
            let master = master.unwrap_or_else(|| config.master_addr());
            run_worker(&config, id, &master, &listen, advertise, s3_bucket).await?;
        }
        Commands::Process {
            datagrams,
            limit,
            output,
            master,
        } => {
            let client = MasterClient::new(
                master.unwrap_or_else(|| config.master_addr()),
                config.submit_timeout(),
            );
            let datagrams = load_datagrams(&datagrams, limit)
                .with_context(|| format!("Failed to load datagrams from {}", datagrams.display()))?;

            let results = client.process_historical(&datagrams).await?;
            report(&results, Some(output.as_path()))?;
        }
        Commands::Stream {
            datagrams,
            window_seconds,
            limit,
            master,
        } => {
            let client = MasterClient::new(
                master.unwrap_or_else(|| config.master_addr()),
                config.submit_timeout(),
            );
            let datagrams = load_datagrams(&datagrams, limit)
                .with_context(|| format!("Failed to load datagrams from {}", datagrams.display()))?;
            let window_seconds = window_seconds.unwrap_or(config.streaming_window_seconds);

            stream_windows(&client, datagrams, window_seconds).await;
        }
        Commands::Status { master } => {
            let client = MasterClient::new(
                master.unwrap_or_else(|| config.master_addr()),
                config.rpc_timeout(),
            );
            let status = client.system_status().await?;
            info!(status = %status, "Master status");
        }
        Commands::Local {
            data_dir,
            datagrams,
            workers,
            limit,
            output,
        } => {
            let data_dir = data_dir.unwrap_or_else(|| config.data_path.clone());
            run_local(&config, &data_dir, &datagrams, workers, limit, output.as_deref()).await?;
        }
    }

    Ok(())
}

/// Serves the master until Ctrl+C, with the health monitor running alongside.
#[tracing::instrument(skip_all, fields(data_dir = %data_dir.display()))]
async fn run_master(config: &Config, data_dir: &Path) -> Result<()> {
    let catalog = load_topology(data_dir)
        .with_context(|| format!("Failed to load topology from {}", data_dir.display()))?;

    let metrics = Arc::new(Metrics::new());
    let master = Arc::new(DistributedMaster::new(
        Arc::new(catalog),
        metrics.clone(),
        config,
    ));

    let health = master
        .health_monitor(config.health_check_interval(), config.health_probe_timeout())
        .spawn();

    let listener = TcpListener::bind(config.master_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.master_addr()))?;

    info!(
        max_workers = config.max_workers,
        strategy = %config.load_balancing,
        streaming_routing = %config.streaming_routing,
        "Master ready. Press Ctrl+C to stop."
    );

    serve_master(listener, master, config.rpc_timeout(), async move {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    health.abort();
    info!("{}", serde_json::to_string(&metrics.snapshot())?);
    Ok(())
}

/// Serves a worker, registers it, and unregisters on Ctrl+C.
#[tracing::instrument(skip_all, fields(worker_id = %id, master = %master))]
async fn run_worker(
    config: &Config,
    id: String,
    master: &str,
    listen: &str,
    advertise: Option<String>,
    s3_bucket: Option<String>,
) -> Result<()> {
    let mut worker = VelocityWorker::new(id.clone());
    if let Some(bucket) = s3_bucket {
        info!(bucket = %bucket, "S3 persistence enabled");
        worker = worker.with_sink(Arc::new(S3Sink::from_env(bucket).await));
    }

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    let local = listener.local_addr()?;
    let host = advertise.unwrap_or_else(|| {
        if local.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            local.ip().to_string()
        }
    });
    let endpoint = format!("{}:{}", host, local.port());

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve_worker(listener, Arc::new(worker), async move {
        let _ = stop_rx.await;
    }));

    let client = MasterClient::new(master, config.rpc_timeout());
    if let Err(e) = register_with_backoff(&client, &id, &endpoint).await {
        let _ = stop_tx.send(());
        return Err(e);
    }

    info!(endpoint = %endpoint, "Worker ready. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    match client.unregister(&id, &endpoint).await {
        Ok(known) => info!(known, "Unregistered from master"),
        Err(e) => warn!(error = %e, "Failed to unregister from master"),
    }

    let _ = stop_tx.send(());
    server.await??;
    Ok(())
}

/// Retries registration with exponential backoff while the master is unreachable or full.
async fn register_with_backoff(client: &MasterClient, worker_id: &str, endpoint: &str) -> Result<()> {
    let mut delay = REGISTRATION_INITIAL_BACKOFF;

    for attempt in 1..=REGISTRATION_ATTEMPTS {
        match client.register(worker_id, endpoint).await {
            Ok(()) => {
                info!(attempt, "Registered with master");
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, error = %e, retry_in_secs = delay.as_secs(), "Registration failed");
            }
        }

        if attempt < REGISTRATION_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(REGISTRATION_MAX_BACKOFF);
        }
    }

    bail!(
        "Could not register with master after {} attempts",
        REGISTRATION_ATTEMPTS
    )
}

/// Sends each window in order. A failed window is logged and skipped.
async fn stream_windows(client: &MasterClient, datagrams: Vec<Datagram>, window_seconds: i64) {
    let windows = split_windows(datagrams, window_seconds);
    info!(windows = windows.len(), window_seconds, "Streaming windows");

    for window in &windows {
        match client.process_streaming(window).await {
            Ok(results) => {
                for r in &results {
                    info!(
                        window_id = %window.window_id,
                        arcs = r.arcs.len(),
                        samples = r.sample_count,
                        avg_mps = r.average_velocity,
                        "Window result"
                    );
                }
            }
            Err(e) => error!(window_id = %window.window_id, error = %e, "Window failed"),
        }
    }
}

/// Runs a master with `workers` in-process workers over one batch.
#[tracing::instrument(skip_all, fields(data_dir = %data_dir.display(), workers = workers))]
async fn run_local(
    config: &Config,
    data_dir: &Path,
    datagrams: &Path,
    workers: usize,
    limit: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    let catalog = load_topology(data_dir)
        .with_context(|| format!("Failed to load topology from {}", data_dir.display()))?;
    let datagrams = load_datagrams(datagrams, limit)
        .with_context(|| format!("Failed to load datagrams from {}", datagrams.display()))?;

    let metrics = Arc::new(Metrics::new());
    let master = DistributedMaster::new(Arc::new(catalog), metrics.clone(), config);
    let sink = Arc::new(MemorySink::new());

    for i in 0..workers.max(1) {
        let id = format!("local-{}", i);
        let worker: Arc<dyn Worker> = Arc::new(
            VelocityWorker::new(id.clone()).with_sink(sink.clone() as Arc<dyn VelocitySink>),
        );
        if !master.register_worker(WorkerHandle::new(id.clone(), id, worker)).await {
            warn!(max_workers = config.max_workers, "Worker limit reached, not starting more");
            break;
        }
    }

    let results = master.process_historical(datagrams).await?;
    report(&results, output)?;

    info!(
        rows = sink.len().await,
        status = %master.system_status().await,
        "Local run finished"
    );
    info!("{}", serde_json::to_string(&metrics.snapshot())?);
    Ok(())
}

/// Logs per-task results and the merged arc table, then appends the table to `output`.
fn report(results: &[VelocityResult], output: Option<&Path>) -> Result<()> {
    log_task_results(results);

    let arcs = merge_arc_velocities(results);
    log_arc_table(&arcs);

    if let Some(path) = output {
        append_arc_records(path, &arcs, Utc::now())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), rows = arcs.len(), "Arc velocities written");
    }
    Ok(())
}
