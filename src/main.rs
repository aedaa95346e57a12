use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scan_orchestrator::backend::{BackendRegistry, ScanType};
use scan_orchestrator::config::AppConfig;
use scan_orchestrator::engine::ScanEngine;
use scan_orchestrator::job::{JobStatusView, ScanRequest};
use scan_orchestrator::logging::init_tracing;
use scan_orchestrator::ports::load_ports_from_path;
use scan_orchestrator::scheduler::Scheduler;
use scan_orchestrator::server::{self, AppState};
use scan_orchestrator::types::ScanResult;

const DEFAULT_CONFIG: &str = "scan-orchestrator.toml";

/// scan-orchestrator: queue, throttle and schedule network scans behind an HTTP API.
#[derive(Debug, Clone, Parser)]
#[command(name = "scan-orchestrator", version, long_about = None)]
struct Cli {
    /// Config file. Defaults to ./scan-orchestrator.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP API bind address.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Jobs allowed to run at once.
    #[arg(long)]
    max_concurrent_scans: Option<usize>,

    /// Dispatcher worker tasks.
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,

    /// json or pretty.
    #[arg(long)]
    log_format: Option<String>,

    /// Do not run the schedule ticker.
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,

    /// Run one scan against these targets (comma separated) and exit instead of serving.
    #[arg(long, value_delimiter = ',')]
    targets: Option<Vec<String>>,

    /// Targets to leave out of a one-off scan.
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Ports list file (one port or range per line) for a one-off scan.
    #[arg(long)]
    ports: Option<PathBuf>,

    /// Backend for a one-off scan.
    #[arg(long)]
    scanner: Option<String>,

    #[arg(long, value_enum)]
    scan_type: Option<ScanType>,

    /// Job timeout in seconds for a one-off scan.
    #[arg(long)]
    timeout: Option<u64>,

    /// Write one-off results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(n) = self.max_concurrent_scans {
            config.engine.max_concurrent_scans = n;
        }
        if let Some(n) = self.workers {
            config.engine.workers = n;
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
        if self.no_scheduler {
            config.scheduler.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;
    init_tracing(&config.general)?;

    let engine = ScanEngine::builder(config.engine.clone())
        .backends(BackendRegistry::with_defaults(&config.backends))
        .start();
    info!(
        backends = ?engine.backend_names(),
        max_concurrent_scans = config.engine.max_concurrent_scans,
        workers = config.engine.workers,
        "engine started"
    );

    let outcome = match cli.targets.clone() {
        Some(targets) => run_once(&cli, &engine, targets).await,
        None => run_server(config, &engine).await,
    };
    engine.shutdown().await;
    outcome
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => AppConfig::load(DEFAULT_CONFIG)
            .with_context(|| format!("failed to load config {DEFAULT_CONFIG}")),
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

async fn run_server(config: AppConfig, engine: &ScanEngine) -> Result<()> {
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(engine.clone()),
        config.scheduler.tick_interval(),
    ));
    for draft in config.schedules {
        let name = draft.name.clone();
        let schedule = scheduler
            .create(draft)
            .with_context(|| format!("invalid schedule '{name}' in config"))?;
        info!(schedule_id = %schedule.id, name = %schedule.name, "schedule registered");
    }
    if config.scheduler.enabled {
        scheduler.start();
    }

    let shutdown = CancellationToken::new();
    let state = AppState {
        engine: engine.clone(),
        scheduler: Arc::clone(&scheduler),
    };
    let mut server = tokio::spawn(server::serve(config.server.bind, state, shutdown.clone()));

    let early_exit = tokio::select! {
        res = &mut server => Some(res),
        sig = tokio::signal::ctrl_c() => {
            sig.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            None
        }
    };

    shutdown.cancel();
    scheduler.stop().await;
    let joined = match early_exit {
        Some(res) => res,
        None => server.await,
    };
    joined.context("HTTP server task failed")?
}

async fn run_once(cli: &Cli, engine: &ScanEngine, targets: Vec<String>) -> Result<()> {
    let mut request = ScanRequest::new(targets).exclude(cli.exclude.clone());
    if let Some(scanner) = &cli.scanner {
        request = request.scanner(scanner.clone());
    }
    if let Some(scan_type) = cli.scan_type {
        request = request.scan_type(scan_type);
    }
    if let Some(secs) = cli.timeout {
        request = request.timeout_secs(secs);
    }
    if let Some(path) = &cli.ports {
        let ports = load_ports_from_path(path)?;
        request = request.ports(ports.into_iter().map(u32::from).collect());
    }

    let created = engine.create_job(request)?;
    let id = created.scan_id;
    info!(scan_id = %id, estimated_duration = created.estimated_duration, "scan queued");

    tokio::select! {
        status = engine.wait_for_terminal(id) => { status?; }
        sig = tokio::signal::ctrl_c() => {
            sig.context("failed to listen for ctrl-c")?;
            if let Err(e) = engine.cancel(id) {
                warn!(scan_id = %id, error = %e, "cancel after ctrl-c");
            }
            engine.wait_for_terminal(id).await?;
        }
    }

    let view = engine.status(id)?;
    let results = engine.results(id, usize::MAX, 0)?;
    print_results_table(&view, &results);
    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &view, &results)?;
        info!(path = %path.display(), "wrote JSON results");
    }
    Ok(())
}

fn print_results_table(view: &JobStatusView, results: &[ScanResult]) {
    let detail = |r: &ScanResult| -> String {
        let mut s = match &r.error {
            Some(err) => err.clone(),
            None => r
                .open_ports
                .iter()
                .find_map(|p| p.banner.clone())
                .unwrap_or_default(),
        };
        if s.len() > 60 {
            let mut cut = 60;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            s.truncate(cut);
        }
        s
    };
    let ports = |r: &ScanResult| -> String {
        r.open_ports
            .iter()
            .map(|p| p.port.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };

    let mut target_w = "target".len();
    let mut ports_w = "open_ports".len();
    let mut detail_w = "detail".len();
    for r in results {
        target_w = target_w.max(r.target.to_string().len());
        ports_w = ports_w.max(ports(r).len().min(40));
        detail_w = detail_w.max(detail(r).len());
    }
    let outcome_w = "succeeded".len();
    let time_w = "time_s".len().max(8);

    println!(
        "\nScan {} {}: {} of {} targets{}",
        view.scan_id,
        view.status,
        view.results_count,
        view.total_targets,
        view.error
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default()
    );
    println!(
        "{:<target_w$}  {:<outcome_w$}  {:<ports_w$}  {:>time_w$}  {:<detail_w$}",
        "target", "outcome", "open_ports", "time_s", "detail",
    );
    println!(
        "{:-<target_w$}  {:-<outcome_w$}  {:-<ports_w$}  {:-<time_w$}  {:-<detail_w$}",
        "", "", "", "", "",
    );
    for r in results {
        let mut open = ports(r);
        if open.len() > 40 {
            open.truncate(37);
            open.push_str("...");
        }
        println!(
            "{:<target_w$}  {:<outcome_w$}  {:<ports_w$}  {:>time_w$.2}  {:<detail_w$}",
            r.target.to_string(),
            r.outcome.as_str(),
            open,
            r.scan_time,
            detail(r),
        );
    }
}

#[derive(Serialize)]
struct Report<'a> {
    job: &'a JobStatusView,
    results: &'a [ScanResult],
}

fn write_results_json(path: &Path, view: &JobStatusView, results: &[ScanResult]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &Report { job: view, results })?;
    Ok(())
}
