//! Server entry point.
//!
//! Responsibilities:
//!
//! 1. **Initialization**: load settings (TOML + environment overrides),
//!    initialise tracing, build the driver registry and instrument manager
//!    from the instrument definitions, seed the plan repository from the
//!    configured plans directory, and wire the engine over its ports.
//! 2. **Serve**: expose the HTTP surface until interrupted.
//! 3. **Shutdown**: on SIGINT, cancel in-flight sessions (they finish as
//!    ABORTED with cleanup) and disconnect every instrument.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use webpdtool::config::Settings;
use webpdtool::engine::{DispatcherDeps, ExecutorDeps, TestEngine};
use webpdtool::handlers::sfc::{HttpSfcClient, SfcClient, UnconfiguredSfcClient};
use webpdtool::handlers::{AutoPassGate, HandlerRegistry};
use webpdtool::instruments::transport::StdTransportFactory;
use webpdtool::instruments::{DriverRegistry, InstrumentManager};
use webpdtool::model::PlanRecord;
use webpdtool::server::{router, AppState};
use webpdtool::storage::{
    CsvReportSink, InMemoryPlanRepository, InMemoryResultRepository, NoopReportSink, ReportSink,
};
use webpdtool::tracing_setup;

#[derive(Parser, Debug)]
#[command(name = "webpdtool", about = "End-of-line production test server")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config/webpdtool.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    settings
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid configuration: {reason}"))?;

    tracing_setup::init_from_settings(&settings)
        .map_err(|reason| anyhow::anyhow!("tracing init failed: {reason}"))?;
    info!(name = %settings.application.name, "starting");

    // Instrument broker over the configured registry.
    let instruments = Arc::new(InstrumentManager::new(
        DriverRegistry::with_defaults(),
        settings.instruments.clone(),
        Duration::from_millis(settings.engine.acquire_timeout_ms),
    ));

    // Plan repository, seeded from per-station CSV exports when configured.
    let plans = Arc::new(InMemoryPlanRepository::new());
    if let Some(dir) = &settings.application.plans_dir {
        seed_plans(&plans, dir).await?;
    }
    let repository = Arc::new(InMemoryResultRepository::new());

    let report: Arc<dyn ReportSink> = if settings.report.disabled {
        Arc::new(NoopReportSink)
    } else {
        Arc::new(CsvReportSink::new(settings.report.output_dir.clone()))
    };

    let sfc: Arc<dyn SfcClient> = match &settings.sfc.base_url {
        Some(base_url) => Arc::new(HttpSfcClient::new(base_url.clone())),
        None => Arc::new(UnconfiguredSfcClient),
    };

    let engine = TestEngine::new(ExecutorDeps {
        dispatcher: DispatcherDeps {
            handlers: Arc::new(HandlerRegistry::with_defaults()),
            instruments: instruments.clone(),
            transports: Arc::new(StdTransportFactory::default()),
            operator: Arc::new(AutoPassGate),
            sfc,
            repository: repository.clone(),
            default_timeout_ms: settings.engine.default_timeout_ms,
            max_timeout_ms: settings.engine.max_timeout_ms,
        },
        plans: plans.clone(),
        repository,
        report,
        repository_retries: settings.engine.repository_retries,
    });

    let state = AppState {
        engine: engine.clone(),
        progress_poll_ms: settings.server.progress_poll_ms,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.server.bind_addr))?;
    info!(addr = %settings.server.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c listener failed");
            }
            info!("shutdown requested");
        })
        .await
        .context("serving HTTP")?;

    engine.shutdown().await;
    info!("stopped");
    Ok(())
}

/// Load every `<station_id>.csv` plan export under `dir`.
async fn seed_plans(plans: &InMemoryPlanRepository, dir: &PathBuf) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading plans directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(station_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("opening plan {}", path.display()))?;
        let mut points = Vec::new();
        for (index, record) in reader.deserialize::<PlanRecord>().enumerate() {
            let record = record.with_context(|| format!("parsing {}", path.display()))?;
            let point = record
                .into_point(index as i32 + 1)
                .with_context(|| format!("converting row {} of {}", index + 1, path.display()))?;
            points.push(point);
        }
        info!(station = station_id, points = points.len(), "plan loaded");
        plans.set_plan(station_id, points).await;
    }
    Ok(())
}
