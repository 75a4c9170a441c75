//! Periodic health sampling of the shared store.
//!
//! A check samples storage usage, runs the validator, exercises a
//! write/read/remove workflow on a throwaway key and times itself. The
//! scheduler is cooperative: the caller drives [`HealthMonitor::poll`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use persistence::keys::is_rollback_storage;
use persistence::{
    detect_generation, is_application_key, MigrationError, RecordKey, SharedStore, StorageError,
    StorageGeneration, StoreError, UnifiedStorage, CURRENT_GENERATION,
};
use tracker_core::{HealthConfig, ValidationConfig};

use crate::report::Severity;
use crate::validator::{MigrationValidator, ValidationReport};

/// Status of a category or a whole report, least to most severe.
///
/// `Error` means the category could not be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Critical,
}

impl HealthStatus {
    /// Score assigned to a category that has no finer measure.
    pub fn base_score(self) -> f64 {
        match self {
            HealthStatus::Healthy => 100.0,
            HealthStatus::Warning => 70.0,
            HealthStatus::Error => 40.0,
            HealthStatus::Critical => 0.0,
        }
    }

    fn severity(self) -> Severity {
        match self {
            HealthStatus::Healthy => Severity::Info,
            HealthStatus::Warning => Severity::Warning,
            HealthStatus::Error => Severity::Error,
            HealthStatus::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
            HealthStatus::Critical => "critical",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Storage,
    DataIntegrity,
    ApiHealth,
    Performance,
    Migration,
}

impl Category {
    /// Categories that decide the overall status.
    pub const CORE: [Category; 3] = [
        Category::Storage,
        Category::DataIntegrity,
        Category::ApiHealth,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Storage => "storage",
            Category::DataIntegrity => "dataIntegrity",
            Category::ApiHealth => "apiHealth",
            Category::Performance => "performance",
            Category::Migration => "migration",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub status: HealthStatus,
    pub score: f64,
    pub details: Vec<String>,
}

impl CategoryReport {
    fn with_status(status: HealthStatus, details: Vec<String>) -> Self {
        Self {
            status,
            score: status.base_score(),
            details,
        }
    }
}

/// A suggested fix; lower `priority` comes first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub severity: Severity,
    pub category: Category,
    pub action: String,
    pub impact: String,
    pub priority: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub size_bytes: u64,
    pub quota_bytes: Option<u64>,
    pub total_keys: usize,
    pub application_keys: usize,
    pub check_duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub overall: HealthStatus,
    pub score: f64,
    pub categories: BTreeMap<Category, CategoryReport>,
    pub remediations: Vec<Remediation>,
    pub metrics: HealthMetrics,
}

impl HealthReport {
    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.get(&category)
    }
}

/// Worst of the core categories, escalated to critical when any category is.
pub fn overall_status(categories: &BTreeMap<Category, CategoryReport>) -> HealthStatus {
    if categories.values().any(|c| c.status == HealthStatus::Critical) {
        return HealthStatus::Critical;
    }
    Category::CORE
        .iter()
        .filter_map(|c| categories.get(c))
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

/// Mean of the category scores.
pub fn overall_score(categories: &BTreeMap<Category, CategoryReport>) -> f64 {
    if categories.is_empty() {
        return 100.0;
    }
    categories.values().map(|c| c.score).sum::<f64>() / categories.len() as f64
}

pub struct HealthMonitor {
    store: SharedStore,
    storage: UnifiedStorage,
    validator: MigrationValidator,
    config: HealthConfig,
    history: VecDeque<HealthReport>,
    checks_run: u64,
    next_due: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(store: SharedStore, config: HealthConfig, validation: ValidationConfig) -> Self {
        Self {
            validator: MigrationValidator::new(store.clone(), validation),
            storage: UnifiedStorage::new(store.clone()),
            store,
            config,
            history: VecDeque::new(),
            checks_run: 0,
            next_due: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    /// Schedule the first check for `now`.
    pub fn start(&mut self, now: Instant) {
        info!(interval_secs = self.config.interval_secs, "health monitor started");
        self.next_due = Some(now);
    }

    pub fn stop(&mut self) {
        if self.next_due.take().is_some() {
            info!("health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    /// Run a check when one is due; reschedules one interval after `now`.
    pub fn poll(&mut self, now: Instant) -> Option<HealthReport> {
        let due = self.next_due?;
        if now < due {
            return None;
        }
        let report = self.run_check();
        self.next_due = Some(now + self.interval());
        Some(report)
    }

    /// Reports retained in memory, oldest first.
    pub fn history(&self) -> &VecDeque<HealthReport> {
        &self.history
    }

    /// Reports persisted by earlier runs; a corrupt history reads as empty.
    pub fn load_persisted_history(&self) -> Result<Vec<HealthReport>, StorageError> {
        self.storage.read_or_default(&RecordKey::HealthHistory)
    }

    /// Sample every category. Failures become statuses, never errors.
    pub fn run_check(&mut self) -> HealthReport {
        let started = Instant::now();
        let mut metrics = HealthMetrics::default();
        let mut categories = BTreeMap::new();

        categories.insert(Category::Storage, self.check_storage(&mut metrics));
        categories.insert(Category::DataIntegrity, self.check_integrity());
        categories.insert(Category::ApiHealth, self.check_api());
        categories.insert(Category::Migration, self.check_migration());

        let elapsed = started.elapsed();
        metrics.check_duration_ms = elapsed.as_millis() as u64;
        categories.insert(Category::Performance, self.check_performance(elapsed));

        let remediations = remediations(&categories);
        let report = HealthReport {
            timestamp: Utc::now(),
            overall: overall_status(&categories),
            score: overall_score(&categories),
            categories,
            remediations,
            metrics,
        };
        match report.overall {
            HealthStatus::Healthy => debug!(score = report.score, "health check"),
            status => warn!(%status, score = report.score, "health check degraded"),
        }
        self.record(report.clone());
        report
    }

    fn record(&mut self, report: HealthReport) {
        self.history.push_back(report);
        while self.history.len() > self.config.memory_history {
            self.history.pop_front();
        }
        self.checks_run += 1;
        let every = u64::from(self.config.persist_every);
        if every > 0 && self.checks_run % every == 0 {
            if let Err(e) = self.persist_history() {
                warn!(error = %e, "failed to persist health history");
            }
        }
    }

    fn persist_history(&self) -> Result<(), StorageError> {
        let skip = self.history.len().saturating_sub(self.config.persisted_history);
        let tail: Vec<&HealthReport> = self.history.iter().skip(skip).collect();
        self.storage.write_system(&RecordKey::HealthHistory, &tail)
    }

    fn check_storage(&self, metrics: &mut HealthMetrics) -> CategoryReport {
        let store = &self.store;
        let sampled = store.keys().and_then(|keys| Ok((keys, store.size_bytes()?)));
        let (keys, size) = match sampled {
            Ok(v) => v,
            Err(e) => {
                return CategoryReport::with_status(
                    HealthStatus::Critical,
                    vec![format!("storage unavailable: {e}")],
                )
            }
        };
        metrics.total_keys = keys.len();
        metrics.application_keys = keys
            .iter()
            .filter(|k| is_application_key(k) && !is_rollback_storage(k))
            .count();
        metrics.size_bytes = size;
        metrics.quota_bytes = store.quota_bytes();

        let mut details = vec![format!("{} keys, {size} bytes", keys.len())];
        let Some(quota) = metrics.quota_bytes.filter(|q| *q > 0) else {
            return CategoryReport::with_status(HealthStatus::Healthy, details);
        };
        let ratio = size as f64 / quota as f64;
        details.push(format!("{:.1}% of {quota} byte quota used", ratio * 100.0));
        let status = if ratio >= self.config.storage_critical_ratio {
            HealthStatus::Critical
        } else if ratio >= self.config.storage_warning_ratio {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        CategoryReport {
            status,
            score: ((1.0 - ratio) * 100.0).clamp(0.0, 100.0),
            details,
        }
    }

    fn check_integrity(&self) -> CategoryReport {
        match self.validator.validate() {
            Ok(report) => integrity_from_validation(&report),
            Err(e) => CategoryReport {
                status: HealthStatus::Error,
                score: 0.0,
                details: vec![format!("validation could not run: {e}")],
            },
        }
    }

    /// Write, read back and remove the canary key, then read inventory through the facade.
    fn check_api(&self) -> CategoryReport {
        let mut details = Vec::new();
        let mut failures = Vec::new();
        let checks = 2;

        match self.canary_round_trip() {
            Ok(()) => details.push("canary round trip ok".to_string()),
            Err(e) => failures.push(e),
        }
        match self.storage.inventory() {
            Ok(inv) => details.push(format!("inventory read ok ({} materials)", inv.len())),
            Err(e) => failures.push(format!("inventory read failed: {e}")),
        }

        let status = if failures.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Critical
        };
        let score = (checks - failures.len()) as f64 / checks as f64 * 100.0;
        details.extend(failures);
        CategoryReport {
            status,
            score,
            details,
        }
    }

    fn canary_round_trip(&self) -> Result<(), String> {
        let store = &self.store;
        let key = RecordKey::HealthCanary.to_string();
        let value = Utc::now().to_rfc3339();
        let result = (|| -> Result<Option<String>, StoreError> {
            store.set(&key, &value)?;
            store.get(&key)
        })();
        // Best effort: the canary must not linger even when the read failed.
        let _ = store.remove(&key);
        match result {
            Ok(Some(read)) if read == value => Ok(()),
            Ok(_) => Err("canary read back a different value".to_string()),
            Err(e) => Err(format!("canary failed: {e}")),
        }
    }

    fn check_migration(&self) -> CategoryReport {
        match detect_generation(&*self.store) {
            Ok(None) => {
                CategoryReport::with_status(HealthStatus::Healthy, vec!["empty store".into()])
            }
            Ok(Some(g)) if g == CURRENT_GENERATION => CategoryReport::with_status(
                HealthStatus::Healthy,
                vec![format!("storage generation {}", g.version())],
            ),
            Ok(Some(g)) => CategoryReport::with_status(
                HealthStatus::Warning,
                vec![format!(
                    "storage generation {} needs migration to {}",
                    g.version(),
                    StorageGeneration::Unified.version()
                )],
            ),
            Err(MigrationError::UnknownVersion(v)) => CategoryReport::with_status(
                HealthStatus::Critical,
                vec![format!("storage version {v} is newer than this build understands")],
            ),
            Err(e) => CategoryReport::with_status(HealthStatus::Error, vec![e.to_string()]),
        }
    }

    fn check_performance(&self, elapsed: Duration) -> CategoryReport {
        let ms = elapsed.as_millis() as u64;
        let status = if ms > self.config.slow_check_ms {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        CategoryReport::with_status(status, vec![format!("check took {ms} ms")])
    }
}

fn integrity_from_validation(report: &ValidationReport) -> CategoryReport {
    let status = if report.is_clean() {
        HealthStatus::Healthy
    } else if report.score < 50.0 {
        HealthStatus::Critical
    } else {
        HealthStatus::Warning
    };
    let details = report
        .checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| format!("{}: {} issue(s)", c.name, c.issues.len()))
        .collect();
    CategoryReport {
        status,
        score: report.score,
        details,
    }
}

fn remediations(categories: &BTreeMap<Category, CategoryReport>) -> Vec<Remediation> {
    let mut out: Vec<Remediation> = categories
        .iter()
        .filter(|(_, r)| r.status != HealthStatus::Healthy)
        .map(|(category, r)| {
            let (action, impact) = remediation_text(*category, r.status);
            let base = match r.status {
                HealthStatus::Critical => 1,
                HealthStatus::Error => 2,
                _ => 3,
            };
            Remediation {
                severity: r.status.severity(),
                category: *category,
                action: action.to_string(),
                impact: impact.to_string(),
                priority: if Category::CORE.contains(category) {
                    base
                } else {
                    base + 1
                },
            }
        })
        .collect();
    out.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.severity.cmp(&a.severity)));
    out
}

fn remediation_text(category: Category, status: HealthStatus) -> (&'static str, &'static str) {
    match (category, status) {
        (Category::Storage, HealthStatus::Critical) => (
            "free storage space or restore from a rollback point",
            "further changes may not be saved",
        ),
        (Category::Storage, _) => (
            "delete old rollback points and unused materials",
            "storage is close to its quota",
        ),
        (Category::DataIntegrity, HealthStatus::Critical) => (
            "roll back to the latest rollback point",
            "tracked projects and navigation disagree widely",
        ),
        (Category::DataIntegrity, _) => (
            "run validation and resolve the reported issues",
            "some views may show stale or orphaned data",
        ),
        (Category::ApiHealth, _) => (
            "check that storage is enabled and writable",
            "reads and writes are failing",
        ),
        (Category::Performance, _) => (
            "reduce stored data or the number of rollback points",
            "checks and saves are slow",
        ),
        (Category::Migration, HealthStatus::Critical) => (
            "use a newer build or restore an older rollback point",
            "stored data was written by an unknown version",
        ),
        (Category::Migration, _) => (
            "run the storage migration",
            "legacy data is not visible in unified views",
        ),
    }
}
