#![deny(warnings)]

//! Command-line front end over the tracker's storage, integrity and rollback layers.

mod args;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use args::{Args, Command, USAGE};
use integrity::{
    HealthMonitor, HealthReport, MigrationRunner, MigrationValidator, RollbackManager,
    RollbackOptions, RollbackOutcome, RollbackRecord, RollbackStrategy, ValidationReport,
};
use persistence::{EventBus, FileStore, SharedStore, UnifiedStorage};
use tracker_core::{completion_percent, Project, TrackerConfig};

fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("reading config {}", p.display()))?;
            TrackerConfig::from_yaml_str(&text).with_context(|| format!("config {}", p.display()))
        }
        None => Ok(TrackerConfig::default()),
    }
}

struct App {
    config: TrackerConfig,
    store: SharedStore,
    storage: UnifiedStorage,
    rollback: RollbackManager,
}

impl App {
    fn open(args: &Args) -> Result<Self> {
        let config = load_config(args.config.as_deref())?;
        let file = FileStore::open(&args.store, Some(config.storage.quota_bytes))
            .with_context(|| format!("opening store {}", args.store.display()))?;
        let store: SharedStore = Arc::new(file);
        let events = EventBus::new();
        events.subscribe(|e| tracing::debug!(event = e.name(), "storage event"));
        let storage = UnifiedStorage::with_events(store.clone(), events.clone());
        let rollback = RollbackManager::new(
            store.clone(),
            config.rollback.clone(),
            config.validation.clone(),
        )
        .with_events(events);
        Ok(Self {
            config,
            store,
            storage,
            rollback,
        })
    }

    fn monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.store.clone(),
            self.config.health.clone(),
            self.config.validation.clone(),
        )
    }
}

fn print_status(app: &App) -> Result<()> {
    let version = app.storage.storage_version()?;
    println!(
        "storage version: {}",
        version.map_or("unknown".to_string(), |v| v.to_string())
    );
    let inventory = app.storage.inventory()?;
    println!("inventory ({} materials):", inventory.len());
    for (m, q) in &inventory {
        println!("  {m:<24} {q}");
    }
    let projects = app.storage.active_projects()?;
    println!("projects ({}):", projects.len());
    for p in &projects {
        println!("  {} [{}] {} material(s)", p.name, p.kind, p.requirements.len());
    }
    let nav = app.storage.navigation()?;
    if let Some(current) = nav.current {
        println!("current: {current} (trail: {})", nav.breadcrumbs.join(" > "));
    }
    Ok(())
}

fn print_requirements(app: &App) -> Result<()> {
    let totals = app.storage.aggregate_requirements()?;
    let inventory = app.storage.inventory()?;
    let missing = app.storage.shortfall()?;
    println!(
        "completion: {:.1}%",
        completion_percent(&totals, &inventory)
    );
    for (m, need) in &totals {
        let have = inventory.get(m).copied().unwrap_or(0);
        let short = missing.get(m).copied().unwrap_or(0);
        println!("  {m:<24} {have:>6} / {need:<6} missing {short}");
    }
    Ok(())
}

fn print_validation(report: &ValidationReport) {
    println!(
        "validation score: {:.1} ({} of {} checks failed)",
        report.score,
        report.failed_checks(),
        report.total_checks()
    );
    for issue in report.issues() {
        println!("  [{}] {}: {}", issue.severity, issue.check, issue.message);
    }
}

fn print_health(report: &HealthReport) {
    println!(
        "health: {} (score {:.1}, {} ms)",
        report.overall, report.score, report.metrics.check_duration_ms
    );
    for (category, r) in &report.categories {
        println!(
            "  {:<14} {:<8} {:>5.1}  {}",
            category.to_string(),
            r.status.to_string(),
            r.score,
            r.details.join("; ")
        );
    }
    for rem in &report.remediations {
        println!(
            "  -> [{}] p{} {}: {} ({})",
            rem.severity, rem.priority, rem.category, rem.action, rem.impact
        );
    }
}

fn print_rollback(record: &RollbackRecord) {
    match &record.outcome {
        RollbackOutcome::Success => println!(
            "rolled back to {} ({}), {} key(s) restored",
            record.point, record.strategy, record.restored_keys
        ),
        RollbackOutcome::Recovered { source, error } => {
            println!("rollback did not complete: {error}");
            println!("recovered from {source}");
        }
        RollbackOutcome::Pending => println!("rollback still pending"),
    }
    if let Some(id) = &record.checkpoint {
        println!("pre-rollback backup: {id}");
    }
}

async fn monitor(app: &App, count: Option<u32>) -> Result<()> {
    let mut health = app.monitor();
    let mut ticker = tokio::time::interval(health.interval());
    let mut seen = 0u32;
    loop {
        tokio::select! {
            at = ticker.tick() => {
                // Schedule on tick instants so every tick finds a check due.
                let at = at.into_std();
                if !health.is_running() {
                    health.start(at);
                }
                if let Some(report) = health.poll(at) {
                    print_health(&report);
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    health.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = args::parse(std::env::args().skip(1))?;
    match &args.command {
        Command::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Command::Version => {
            println!(
                "tracker {} ({} built {})",
                env!("CARGO_PKG_VERSION"),
                env!("GIT_SHA"),
                env!("BUILD_DATE")
            );
            return Ok(());
        }
        _ => {}
    }

    let app = App::open(&args)?;
    info!(store = %args.store.display(), "store opened");
    match args.command {
        Command::Status => print_status(&app)?,
        Command::Set { material, qty } => {
            let stored = app.storage.set_material_quantity(&material, qty)?;
            if stored as i64 != qty {
                warn!(%material, requested = qty, stored, "quantity clamped");
            }
            println!("{material} = {stored}");
        }
        Command::AddProject {
            name,
            kind,
            requirements,
        } => {
            app.storage.add_project(Project::new(&name, kind, requirements))?;
            println!("tracking {name}");
        }
        Command::RemoveProject { name } => {
            app.storage.remove_project(&name)?;
            println!("removed {name}");
        }
        Command::Requirements => print_requirements(&app)?,
        Command::Validate => {
            let validator = MigrationValidator::new(app.store.clone(), app.config.validation.clone());
            print_validation(&validator.validate()?);
        }
        Command::Health => print_health(&app.monitor().run_check()),
        Command::Monitor { count } => monitor(&app, count).await?,
        Command::Checkpoint { name, description } => {
            let point = app.rollback.create_point(&name, description.as_deref())?;
            println!(
                "rollback point {} created: {} key(s), {} bytes",
                point.name, point.metadata.key_count, point.metadata.size_bytes
            );
        }
        Command::Points => {
            for p in app.rollback.list_points()? {
                let score = p
                    .validation_score
                    .map_or("-".to_string(), |s| format!("{s:.1}"));
                println!(
                    "{:<28} {}  {:>4} keys  {:>8} bytes  score {score}",
                    p.name,
                    p.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    p.key_count,
                    p.size_bytes
                );
            }
        }
        Command::Rollback {
            name,
            strategy,
            components,
            skip_checkpoint,
        } => {
            let strategy = RollbackStrategy::parse(&strategy, &components)?;
            let record = app
                .rollback
                .rollback(&name, strategy, RollbackOptions { skip_checkpoint })?;
            print_rollback(&record);
        }
        Command::Emergency => print_rollback(&app.rollback.recover("requested from command line")?),
        Command::Migrate => {
            let outcome = MigrationRunner::new(app.store.clone(), &app.config)
                .with_rollback(app.rollback.clone())
                .run()?;
            if outcome.migrated() {
                for step in &outcome.steps {
                    println!(
                        "v{} -> v{}: {} key(s) moved, {} skipped",
                        step.from,
                        step.to,
                        step.moved,
                        step.skipped.len()
                    );
                }
                if let Some(report) = &outcome.validation {
                    print_validation(report);
                }
            } else {
                println!("storage is already current");
            }
        }
        Command::Help | Command::Version => {}
    }
    Ok(())
}
