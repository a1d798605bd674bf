//! `su-reconcile`: periodic SU reconciliation service and one-shot operator
//! commands.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use hpc_allocations::config::{
    ConfigBuilder, ConfigError, LedgerKind, MemoryConfigProvider, Settings, SourceKind,
};
use hpc_allocations::ledger::{Ledger, MemoryLedger};
use hpc_allocations::observability::{MetricsRegistry, MetricsSummary, ObservabilityConfig};
use hpc_allocations::reconcile::Reconciler;
use hpc_allocations::scheduler::{PassReport, Scheduler};
use hpc_allocations::source::{MemorySource, ResilientSource, SlurmSource, UsageSource};
use hpc_allocations::Result;

#[derive(Parser)]
#[command(name = "su-reconcile", version, about = "Reconcile HPC SU allocations with scheduler usage")]
struct Cli {
    /// JSON settings file; environment variables prefixed SU_RECONCILE_ override it.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// JSON fixture seeding the in-memory ledger; written back after every pass.
    #[arg(long, global = true)]
    ledger_fixture: Option<PathBuf>,

    /// JSON fixture of accounts standing in for Slurm; written back after every pass.
    #[arg(long, global = true)]
    source_fixture: Option<PathBuf>,

    /// Compute and log, but write nothing.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pass every `schedule.interval_secs` until interrupted.
    Run,
    /// One pass over every enabled cluster.
    ReconcileAll,
    /// One pass over a single cluster.
    ReconcileCluster {
        #[arg(long)]
        cluster: String,
    },
    /// Reconcile a single account.
    ReconcileAccount {
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        account: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!(error = %e, "su-reconcile failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Command-line flags become the highest-priority configuration layer.
fn flag_overrides(cli: &Cli) -> MemoryConfigProvider {
    let mut flags = MemoryConfigProvider::named("flags");
    if cli.dry_run {
        flags = flags.value("reconcile.dry_run", "true");
    }
    if cli.json_logs {
        flags = flags.value("logging.json", "true");
    }
    if let Some(fixture) = &cli.ledger_fixture {
        flags = flags
            .value("ledger.kind", "memory")
            .value("ledger.fixture", fixture.display().to_string());
    }
    if let Some(fixture) = &cli.source_fixture {
        flags = flags
            .value("source.kind", "memory")
            .value("source.fixture", fixture.display().to_string());
    }
    flags
}

async fn run(cli: Cli) -> Result<bool> {
    let mut builder = ConfigBuilder::new().memory(flag_overrides(&cli)).env();
    if let Some(path) = &cli.config {
        builder = builder.file(path);
    }
    let settings = Settings::load(&builder.build()).await?;
    settings.validate()?;

    #[cfg(feature = "otel")]
    let otel = init_otel(&settings);
    #[cfg(not(feature = "otel"))]
    if let Err(e) = hpc_allocations::observability::init_logging(&settings.logging) {
        eprintln!("warning: logging not initialised: {}", e);
    }

    let observability = ObservabilityConfig::new().logging(settings.logging.clone());
    #[cfg(feature = "otel")]
    let observability = match &otel {
        Some(_) => observability.otel(hpc_allocations::observability::OtelConfig::from_env()),
        None => observability,
    };
    let metrics = observability.build_registry();

    let (ledger, memory_ledger) = open_ledger(&settings).await?;
    let (source, memory_source) = open_source(&settings).await?;
    let fixtures = if settings.reconcile.dry_run {
        Fixtures::default()
    } else {
        Fixtures {
            ledger: memory_ledger.zip(settings.ledger.fixture.clone()),
            source: memory_source.zip(settings.source.fixture.clone()),
        }
    };
    let reconciler = Arc::new(
        Reconciler::new(ledger, source)
            .with_options(settings.reconcile.options())
            .with_metrics(Arc::clone(&metrics)),
    );
    let scheduler = Scheduler::new(reconciler, settings.schedule.scheduler_config());

    tracing::info!(
        ledger = scheduler.reconciler().ledger().name(),
        source = scheduler.reconciler().source().name(),
        dry_run = settings.reconcile.dry_run,
        "su-reconcile starting"
    );

    let clean = match cli.command {
        Command::Run => {
            let shutdown = CancellationToken::new();
            tokio::spawn(watch_signals(shutdown.clone()));
            scheduler
                .run_with(shutdown, |_| {
                    let fixtures = fixtures.clone();
                    async move {
                        if let Err(e) = fixtures.save().await {
                            tracing::error!(error = %e, "Failed to save fixtures");
                        }
                    }
                })
                .await?;
            true
        }
        Command::ReconcileAll => print_pass(&scheduler.reconcile_all().await?)?,
        Command::ReconcileCluster { cluster } => {
            print_pass(&scheduler.reconcile_cluster(&cluster).await?)?
        }
        Command::ReconcileAccount { cluster, account } => {
            let unit = scheduler.reconcile_unit(&cluster, &account).await?;
            println!("{}", serde_json::to_string_pretty(&unit)?);
            !unit.status.is_failure()
        }
    };

    fixtures.save().await?;

    log_summary(&metrics);

    #[cfg(feature = "otel")]
    if let Some(runtime) = otel {
        runtime.shutdown();
    }

    Ok(clean)
}

/// The memory ledger is also returned by value so it can be saved back.
async fn open_ledger(settings: &Settings) -> Result<(Arc<dyn Ledger>, Option<MemoryLedger>)> {
    match settings.ledger.kind {
        LedgerKind::Memory => {
            let ledger = match &settings.ledger.fixture {
                Some(path) => MemoryLedger::from_fixture_file(path).await?,
                None => {
                    tracing::warn!("No ledger fixture configured; starting with an empty ledger");
                    MemoryLedger::new()
                }
            };
            Ok((Arc::new(ledger.clone()), Some(ledger)))
        }
        #[cfg(feature = "postgres")]
        LedgerKind::Postgres => {
            use hpc_allocations::ledger::{PostgresLedger, PostgresLedgerConfig};

            let url = settings
                .ledger
                .url
                .as_ref()
                .ok_or_else(|| ConfigError::NotFound {
                    key: "ledger.url".into(),
                })?;
            let ledger = PostgresLedger::connect(url, PostgresLedgerConfig::default()).await?;
            ledger.ensure_schema().await?;
            Ok((Arc::new(ledger), None))
        }
        #[cfg(not(feature = "postgres"))]
        LedgerKind::Postgres => Err(hpc_allocations::Error::Config(ConfigError::InvalidValue {
            key: "ledger.kind".into(),
            message: "built without the `postgres` feature".into(),
        })),
    }
}

/// The memory source is also returned on its own so it can be saved back.
async fn open_source(
    settings: &Settings,
) -> Result<(Arc<dyn UsageSource>, Option<Arc<MemorySource>>)> {
    let memory = match settings.source.kind {
        SourceKind::Slurm => None,
        SourceKind::Memory => {
            let path = settings
                .source
                .fixture
                .as_ref()
                .ok_or_else(|| ConfigError::NotFound {
                    key: "source.fixture".into(),
                })?;
            Some(Arc::new(MemorySource::from_fixture_file(path).await?))
        }
    };
    let inner: Arc<dyn UsageSource> = match &memory {
        Some(source) => source.clone(),
        None => Arc::new(SlurmSource::new(settings.source.slurm_config())),
    };
    let resilient = ResilientSource::new(inner, settings.source.resilience_config());
    Ok((Arc::new(resilient), memory))
}

/// In-memory backends and the files they are written back to.
#[derive(Clone, Default)]
struct Fixtures {
    ledger: Option<(MemoryLedger, PathBuf)>,
    source: Option<(Arc<MemorySource>, PathBuf)>,
}

impl Fixtures {
    async fn save(&self) -> Result<()> {
        if let Some((ledger, path)) = &self.ledger {
            ledger.write_fixture_file(path).await?;
            tracing::info!(path = %path.display(), "Ledger fixture saved");
        }
        if let Some((source, path)) = &self.source {
            source.write_fixture_file(path).await?;
            tracing::info!(path = %path.display(), "Accounting fixture saved");
        }
        Ok(())
    }
}

fn print_pass(report: &PassReport) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(report.is_clean())
}

fn log_summary(metrics: &MetricsRegistry) {
    let summary = MetricsSummary::from_registry(metrics);
    tracing::info!(
        passes = summary.passes,
        units_started = summary.units_started,
        units_failed = summary.units_failed,
        allocations_closed = summary.allocations_closed,
        su_apportioned = summary.su_apportioned,
        "Run summary"
    );
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, stopping"),
                    _ = term.recv() => tracing::info!("Received SIGTERM, stopping"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot watch SIGTERM; only SIGINT stops the service");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received SIGINT, stopping");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl-C, stopping");
    }
    shutdown.cancel();
}

/// OTLP export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, plain logging otherwise.
#[cfg(feature = "otel")]
fn init_otel(settings: &Settings) -> Option<hpc_allocations::observability::OtelRuntime> {
    use hpc_allocations::observability::{
        OtelConfig, OtelRuntime, init_logging, init_tracing_subscriber,
    };

    if std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT").is_none() {
        if let Err(e) = init_logging(&settings.logging) {
            eprintln!("warning: logging not initialised: {}", e);
        }
        return None;
    }

    let config = OtelConfig::from_env().with_service_version(env!("CARGO_PKG_VERSION"));
    if let Err(e) = init_tracing_subscriber(&config, &settings.logging) {
        eprintln!("warning: OTLP tracing unavailable: {}", e);
        let _ = init_logging(&settings.logging);
    }
    match OtelRuntime::init(&config) {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            tracing::warn!(error = %e, "OTLP metrics unavailable");
            None
        }
    }
}
