use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use runwatch_core::{AgentRun, Clock, OrganizationId, RunId, RunRef, SystemClock, TrackedRun};
use runwatch_storage::{KvStore, SqliteStore};
use runwatch_sync::{
    CommandNotifier, HttpRunSource, Notifier, OrgLocks, RunCache, RunSource, Scheduler,
    StatusChangeDetector, SyncEngine, TrackedRegistry, TracingNotifier, WatchConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STORE_NAMESPACE: &str = "runwatch";
const DEFAULT_API_BASE: &str = "https://api.codegen.com";

#[derive(Parser, Debug)]
#[command(name = "runwatch")]
#[command(about = "Watch remote agent runs and report status changes", long_about = None)]
struct Cli {
    /// SQLite database holding the cache and tracked runs.
    #[arg(long, global = true, env = "RUNWATCH_DB")]
    db: Option<PathBuf>,
    #[arg(long, global = true, env = "RUNWATCH_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,
    #[arg(long, global = true, env = "RUNWATCH_API_TOKEN", default_value = "", hide_env_values = true)]
    token: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll tracked runs until interrupted
    Watch {
        /// Seconds between passes.
        #[arg(long, default_value_t = 30)]
        interval: u64,
        /// Shell command run for each notification.
        #[arg(long, env = "RUNWATCH_NOTIFY_CMD")]
        notify_cmd: Option<String>,
        /// Run a single pass and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Start monitoring a run, given its id or web URL
    Track {
        organization: OrganizationId,
        run: String,
    },
    /// Stop monitoring a run
    Untrack {
        organization: OrganizationId,
        run: RunId,
    },
    /// Refresh every cached run of an organization
    Sync { organization: OrganizationId },
    /// Show cached runs of an organization
    List { organization: OrganizationId },
    /// Show tracked runs of an organization
    Tracked { organization: OrganizationId },
}

struct App {
    config: WatchConfig,
    clock: Arc<dyn Clock>,
    locks: Arc<OrgLocks>,
    store: Arc<dyn KvStore>,
    cache: RunCache,
    registry: TrackedRegistry,
    api_base: String,
    token: String,
}

impl App {
    fn open(cli: &Cli, config: WatchConfig) -> Result<Self> {
        let path = match &cli.db {
            Some(path) => path.clone(),
            None => default_db_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store: Arc<dyn KvStore> = Arc::new(
            SqliteStore::open(&path, STORE_NAMESPACE)
                .with_context(|| format!("failed to open {}", path.display()))?,
        );
        info!(event = "store_open", path = %path.display());

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            cache: RunCache::new(store.clone(), clock.clone(), config.run_ttl),
            registry: TrackedRegistry::new(store.clone(), clock.clone()),
            store,
            locks: Arc::new(OrgLocks::new()),
            clock,
            config,
            api_base: cli.api_base.clone(),
            token: cli.token.clone(),
        })
    }

    fn source(&self) -> Result<Arc<dyn RunSource>> {
        if self.token.trim().is_empty() {
            bail!("an API token is required (--token or RUNWATCH_API_TOKEN)");
        }
        let source: Arc<dyn RunSource> =
            Arc::new(HttpRunSource::new(&self.api_base, &self.token)?);
        Ok(source)
    }

    fn engine(&self, source: Arc<dyn RunSource>) -> SyncEngine {
        SyncEngine::new(
            self.cache.clone(),
            source,
            self.store.clone(),
            self.locks.clone(),
            self.clock.clone(),
        )
    }

    fn detector(&self, source: Arc<dyn RunSource>) -> StatusChangeDetector {
        StatusChangeDetector::new(
            self.registry.clone(),
            self.cache.clone(),
            source,
            self.locks.clone(),
            self.clock.clone(),
            self.config.tracked_retention,
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug || env_true("RUNWATCH_DEBUG"));
    if let Err(err) = run(cli).await {
        error!(event = "command_failed", error = %format!("{err:#}"));
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = WatchConfig::default();
    if let Commands::Watch { interval, .. } = &cli.command {
        config.poll_interval = Duration::from_secs((*interval).max(1));
    }
    let app = App::open(&cli, config)?;

    match &cli.command {
        Commands::Watch {
            notify_cmd, once, ..
        } => watch(&app, notify_cmd.as_deref(), *once).await,
        Commands::Track { organization, run } => track(&app, *organization, run).await,
        Commands::Untrack { organization, run } => {
            let _guard = app.locks.lock(*organization).await;
            if app.registry.untrack(*organization, *run)? {
                println!("Stopped tracking run #{run}");
            } else {
                println!("Run #{run} was not tracked");
            }
            Ok(())
        }
        Commands::Sync { organization } => {
            let engine = app.engine(app.source()?);
            let state = engine.sync_runs(*organization).await;
            match &state.error {
                Some(message) => bail!("sync failed: {message}"),
                None => {
                    println!(
                        "Synced {} cached runs",
                        app.cache.get_runs(*organization)?.len()
                    );
                    Ok(())
                }
            }
        }
        Commands::List { organization } => {
            let runs = app.cache.get_runs(*organization)?;
            if runs.is_empty() {
                println!("No cached runs for organization {organization}");
            }
            for run in &runs {
                println!("{}", format_run(run));
            }
            Ok(())
        }
        Commands::Tracked { organization } => {
            let tracked = app.registry.list(*organization)?;
            if tracked.is_empty() {
                println!("No tracked runs for organization {organization}");
            }
            for run in &tracked {
                println!("{}", format_tracked(run));
            }
            Ok(())
        }
    }
}

async fn watch(app: &App, notify_cmd: Option<&str>, once: bool) -> Result<()> {
    let source = app.source()?;
    let notifier: Arc<dyn Notifier> = match notify_cmd {
        Some(command) if !command.trim().is_empty() => Arc::new(CommandNotifier::new(command)),
        _ => Arc::new(TracingNotifier),
    };
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(app.detector(source.clone())),
        Arc::new(app.engine(source)),
        notifier,
        app.config.clone(),
    ));

    if once {
        let report = scheduler.run_pass().await;
        println!(
            "{} organizations, {} changes, {} notifications",
            report.organizations,
            report.changes.len(),
            report.notifications_sent
        );
        if !report.failed_organizations.is_empty() {
            bail!(
                "pass failed for organizations {:?}",
                report.failed_organizations
            );
        }
        return Ok(());
    }

    let handle = scheduler.start();
    let _ = tokio::signal::ctrl_c().await;
    info!(event = "shutdown_requested");
    handle.stop().await;
    Ok(())
}

async fn track(app: &App, organization_id: OrganizationId, reference: &str) -> Result<()> {
    let run_ref = RunRef::parse(reference)?;
    let source = app.source()?;
    let run = source
        .fetch_run(organization_id, run_ref.run_id)
        .await
        .with_context(|| format!("failed to fetch run #{}", run_ref.run_id))?;

    let _guard = app.locks.lock(organization_id).await;
    app.cache.update_run(organization_id, &run)?;
    let tracked = app.registry.track(&run)?;
    println!("Tracking {}", format_tracked(&tracked));
    Ok(())
}

fn format_run(run: &AgentRun) -> String {
    format!(
        "#{:<8} {:<22} {}  {}",
        run.id,
        run.status.as_str(),
        run.created_at.format("%Y-%m-%d %H:%M"),
        run.web_url
    )
}

fn format_tracked(run: &TrackedRun) -> String {
    format!(
        "#{:<8} {:<22} added {}  {}",
        run.id,
        run.last_known_status
            .map(|status| status.as_str())
            .unwrap_or("-"),
        run.added_at.format("%Y-%m-%d %H:%M"),
        run.web_url
    )
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no data directory for this platform; pass --db")?;
    Ok(base.join("runwatch").join("runwatch.db"))
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("RUNWATCH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
