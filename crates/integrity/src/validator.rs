//! Point-in-time consistency checks over related storage keys.
//!
//! Every check either passes or fails; the report score is the share of
//! passing checks, `(total - failed) / total * 100`, with no weighting by
//! severity.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use persistence::keys::is_rollback_storage;
use persistence::legacy::is_legacy_key;
use persistence::unified::decode;
use persistence::{
    is_application_key, Dependencies, Priorities, RecordKey, SharedStore, StorageError, StoreError,
    UnifiedStorage, CURRENT_GENERATION,
};
use tracker_core::{MaterialMap, NavigationState, Project, ValidationConfig};

use crate::report::Severity;

pub const CHECK_CROSS_REFERENCE: &str = "cross_reference";
pub const CHECK_NAVIGATION_CURRENT: &str = "navigation_current";
pub const CHECK_DUPLICATE_PROJECTS: &str = "duplicate_projects";
pub const CHECK_ORPHANED_PRIORITIES: &str = "orphaned_priorities";
pub const CHECK_ORPHANED_DEPENDENCIES: &str = "orphaned_dependencies";
pub const CHECK_CORRUPTED_RECORDS: &str = "corrupted_records";
pub const CHECK_MATERIAL_QUANTITIES: &str = "material_quantities";
pub const CHECK_CIRCULAR_DEPENDENCIES: &str = "circular_dependencies";
pub const CHECK_STORAGE_VERSION: &str = "storage_version";
pub const CHECK_MIGRATION_PRESERVATION: &str = "migration_preservation";

/// One problem found by a check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub check: String,
    pub severity: Severity,
    pub message: String,
    /// Storage key or entity the issue is about.
    pub subject: Option<String>,
}

/// Result of a single check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub issues: Vec<Issue>,
}

impl CheckResult {
    fn new(name: &str, issues: Vec<Issue>) -> Self {
        Self {
            name: name.to_string(),
            passed: issues.is_empty(),
            issues,
        }
    }
}

/// Full validation pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
    /// 0..=100, linear in the number of failed checks.
    pub score: f64,
}

impl ValidationReport {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let score = score(&checks);
        Self {
            timestamp: Utc::now(),
            checks,
            score,
        }
    }

    pub fn total_checks(&self) -> usize {
        self.checks.len()
    }

    pub fn failed_checks(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_checks() == 0
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.checks.iter().flat_map(|c| c.issues.iter())
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Worst severity among all issues.
    pub fn worst_severity(&self) -> Option<Severity> {
        self.issues().map(|i| i.severity).max()
    }

    /// Add a check and recompute the score.
    pub fn push(&mut self, check: CheckResult) {
        self.checks.push(check);
        self.score = score(&self.checks);
    }
}

/// `(total - failed) / total * 100`; an empty check list scores 100.
pub fn score(checks: &[CheckResult]) -> f64 {
    if checks.is_empty() {
        return 100.0;
    }
    let failed = checks.iter().filter(|c| !c.passed).count();
    (checks.len() - failed) as f64 / checks.len() as f64 * 100.0
}

/// Runs the consistency checks against a shared store.
#[derive(Clone)]
pub struct MigrationValidator {
    store: SharedStore,
    storage: UnifiedStorage,
    config: ValidationConfig,
}

/// A typed input that may be missing, present or corrupt.
enum Loaded<T> {
    Ok(T),
    Corrupt(String),
}

impl MigrationValidator {
    pub fn new(store: SharedStore, config: ValidationConfig) -> Self {
        Self {
            storage: UnifiedStorage::new(store.clone()),
            store,
            config,
        }
    }

    /// Run every check. Only an unusable store is an error.
    pub fn validate(&self) -> Result<ValidationReport, StoreError> {
        let projects = self.load::<Vec<Project>>(&RecordKey::ActiveProjects)?;
        let nav_active = self.load::<Vec<String>>(&RecordKey::NavigationActive)?;
        let nav_current = self.load::<Option<String>>(&RecordKey::NavigationCurrent)?;
        let priorities = self.load::<Priorities>(&RecordKey::ProjectPriorities)?;
        let dependencies = self.load::<Dependencies>(&RecordKey::ProjectDependencies)?;

        let checks = vec![
            match (&projects, &nav_active) {
                (Loaded::Ok(p), Loaded::Ok(n)) => {
                    let names: Vec<String> = p.iter().map(|p| p.name.clone()).collect();
                    self.check_cross_reference(&names, n)
                }
                _ => unevaluable(
                    CHECK_CROSS_REFERENCE,
                    &[&err_of(&projects), &err_of(&nav_active)],
                ),
            },
            match (&nav_current, &nav_active) {
                (Loaded::Ok(current), Loaded::Ok(active)) => {
                    check_navigation_current(&NavigationState {
                        current: current.clone(),
                        breadcrumbs: Vec::new(),
                        active: active.clone(),
                    })
                }
                _ => unevaluable(
                    CHECK_NAVIGATION_CURRENT,
                    &[&err_of(&nav_current), &err_of(&nav_active)],
                ),
            },
            match &projects {
                Loaded::Ok(p) => check_duplicate_projects(p),
                Loaded::Corrupt(e) => unevaluable(CHECK_DUPLICATE_PROJECTS, &[&Some(e.clone())]),
            },
            match (&projects, &priorities) {
                (Loaded::Ok(p), Loaded::Ok(map)) => self.check_orphans(
                    CHECK_ORPHANED_PRIORITIES,
                    &active_set(p),
                    map.keys().cloned(),
                    "priority",
                ),
                _ => unevaluable(
                    CHECK_ORPHANED_PRIORITIES,
                    &[&err_of(&projects), &err_of(&priorities)],
                ),
            },
            match (&projects, &dependencies) {
                (Loaded::Ok(p), Loaded::Ok(map)) => {
                    let referenced: BTreeSet<String> = map
                        .iter()
                        .flat_map(|(k, v)| std::iter::once(k.clone()).chain(v.iter().cloned()))
                        .collect();
                    self.check_orphans(
                        CHECK_ORPHANED_DEPENDENCIES,
                        &active_set(p),
                        referenced.into_iter(),
                        "dependency",
                    )
                }
                _ => unevaluable(
                    CHECK_ORPHANED_DEPENDENCIES,
                    &[&err_of(&projects), &err_of(&dependencies)],
                ),
            },
            self.check_corrupted_records()?,
            self.check_material_quantities()?,
            match (&projects, &dependencies) {
                (Loaded::Ok(p), Loaded::Ok(deps)) => {
                    check_circular_dependencies(&dependency_graph(p, deps))
                }
                _ => unevaluable(
                    CHECK_CIRCULAR_DEPENDENCIES,
                    &[&err_of(&projects), &err_of(&dependencies)],
                ),
            },
            self.check_storage_version()?,
        ];
        let report = ValidationReport::from_checks(checks);
        info!(
            score = report.score,
            failed = report.failed_checks(),
            total = report.total_checks(),
            "validation complete"
        );
        Ok(report)
    }

    fn load<T: serde::de::DeserializeOwned + Default>(
        &self,
        key: &RecordKey,
    ) -> Result<Loaded<T>, StoreError> {
        match self.storage.read::<T>(key) {
            Ok(v) => Ok(Loaded::Ok(v.unwrap_or_default())),
            Err(StorageError::Store(e)) => Err(e),
            Err(e) => Ok(Loaded::Corrupt(e.to_string())),
        }
    }

    /// Symmetric difference between the tracker's project names and the
    /// navigation layer's active list. One issue per differing name.
    pub fn check_cross_reference(&self, projects: &[String], nav_active: &[String]) -> CheckResult {
        let a: BTreeSet<&str> = projects.iter().map(String::as_str).collect();
        let b: BTreeSet<&str> = nav_active.iter().map(String::as_str).collect();
        let diff: Vec<(&str, bool)> = a
            .difference(&b)
            .map(|n| (*n, true))
            .chain(b.difference(&a).map(|n| (*n, false)))
            .collect();
        let severity = threshold_severity(diff.len(), self.config.cross_reference_error_threshold);
        let issues = diff
            .into_iter()
            .map(|(name, in_projects)| Issue {
                check: CHECK_CROSS_REFERENCE.into(),
                severity,
                message: if in_projects {
                    format!("project {name} is missing from the navigation active list")
                } else {
                    format!("navigation lists {name} which is not an active project")
                },
                subject: Some(name.to_string()),
            })
            .collect();
        CheckResult::new(CHECK_CROSS_REFERENCE, issues)
    }

    fn check_orphans(
        &self,
        check: &str,
        active: &BTreeSet<&str>,
        referenced: impl Iterator<Item = String>,
        what: &str,
    ) -> CheckResult {
        let orphans: Vec<String> = referenced.filter(|n| !active.contains(n.as_str())).collect();
        let severity = threshold_severity(orphans.len(), self.config.orphan_error_threshold);
        let issues = orphans
            .into_iter()
            .map(|name| Issue {
                check: check.into(),
                severity,
                message: format!("orphaned {what} entry references inactive project {name}"),
                subject: Some(name),
            })
            .collect();
        CheckResult::new(check, issues)
    }

    /// Values that look like JSON but do not parse, and known records that do
    /// not decode as their type.
    fn check_corrupted_records(&self) -> Result<CheckResult, StoreError> {
        let store = &self.store;
        let mut issues = Vec::new();
        for key in store.keys()? {
            if !is_application_key(&key) || is_rollback_storage(&key) || is_legacy_key(&key) {
                continue;
            }
            let Some(raw) = store.get(&key)? else {
                continue;
            };
            if looks_like_json(&raw) && serde_json::from_str::<Value>(&raw).is_err() {
                issues.push(corrupt_issue(&key, "value is not valid JSON"));
                continue;
            }
            if let Some(record) = RecordKey::parse(&key) {
                if let Err(e) = decode_as_record(&record, &raw) {
                    issues.push(corrupt_issue(&key, &e));
                }
            }
        }
        debug!(corrupt = issues.len(), "corruption scan");
        Ok(CheckResult::new(CHECK_CORRUPTED_RECORDS, issues))
    }

    fn check_material_quantities(&self) -> Result<CheckResult, StoreError> {
        let store = &self.store;
        let mut issues = Vec::new();
        for key in store.keys()? {
            let Some(RecordKey::Material(name)) = RecordKey::parse(&key) else {
                continue;
            };
            let Some(raw) = store.get(&key)? else {
                continue;
            };
            let message = match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Number(n)) if n.as_u64().is_some() => continue,
                Ok(Value::Number(n)) if n.as_i64().is_some() => {
                    format!("{name} has negative quantity {n}")
                }
                _ => format!("{name} quantity is not a non-negative integer: {raw}"),
            };
            issues.push(Issue {
                check: CHECK_MATERIAL_QUANTITIES.into(),
                severity: Severity::Error,
                message,
                subject: Some(key),
            });
        }
        Ok(CheckResult::new(CHECK_MATERIAL_QUANTITIES, issues))
    }

    fn check_storage_version(&self) -> Result<CheckResult, StoreError> {
        let store = &self.store;
        let keys = store.keys()?;
        let mut issues = Vec::new();
        let legacy: Vec<&String> = keys.iter().filter(|k| is_legacy_key(k)).collect();
        let has_data = keys.iter().any(|k| is_application_key(k));
        match self.storage.storage_version() {
            Ok(Some(v)) if v == CURRENT_GENERATION.version() => {}
            Ok(Some(v)) => issues.push(Issue {
                check: CHECK_STORAGE_VERSION.into(),
                severity: Severity::Error,
                message: format!(
                    "storage generation {v} has not been migrated to {}",
                    CURRENT_GENERATION.version()
                ),
                subject: Some(RecordKey::StorageVersion.to_string()),
            }),
            Ok(None) if has_data => issues.push(Issue {
                check: CHECK_STORAGE_VERSION.into(),
                severity: Severity::Warning,
                message: "storage version is not recorded".into(),
                subject: Some(RecordKey::StorageVersion.to_string()),
            }),
            Ok(None) => {}
            Err(StorageError::Store(e)) => return Err(e),
            Err(e) => issues.push(corrupt_issue(
                &RecordKey::StorageVersion.to_string(),
                &e.to_string(),
            )),
        }
        for key in legacy {
            issues.push(Issue {
                check: CHECK_STORAGE_VERSION.into(),
                severity: Severity::Warning,
                message: format!("legacy key {key} is still present"),
                subject: Some(key.clone()),
            });
        }
        Ok(CheckResult::new(CHECK_STORAGE_VERSION, issues))
    }
}

/// Current selection must be one of the navigation layer's active crafts.
pub fn check_navigation_current(nav: &NavigationState) -> CheckResult {
    let mut issues = Vec::new();
    if !nav.current_is_active() {
        let current = nav.current.clone().unwrap_or_default();
        issues.push(Issue {
            check: CHECK_NAVIGATION_CURRENT.into(),
            severity: Severity::Warning,
            message: format!("current selection {current} is not an active craft"),
            subject: Some(current),
        });
    }
    CheckResult::new(CHECK_NAVIGATION_CURRENT, issues)
}

pub fn check_duplicate_projects(projects: &[Project]) -> CheckResult {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for p in projects {
        *counts.entry(p.name.as_str()).or_insert(0) += 1;
    }
    let issues = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(name, n)| Issue {
            check: CHECK_DUPLICATE_PROJECTS.into(),
            severity: Severity::Error,
            message: format!("project {name} is tracked {n} times"),
            subject: Some(name.to_string()),
        })
        .collect();
    CheckResult::new(CHECK_DUPLICATE_PROJECTS, issues)
}

/// Project -> projects it depends on, from explicit dependencies and from
/// requirements that name another active craft.
pub fn dependency_graph(
    projects: &[Project],
    deps: &Dependencies,
) -> BTreeMap<String, Vec<String>> {
    let crafts: BTreeSet<&str> = active_set(projects);
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for p in projects {
        let edges = graph.entry(p.name.clone()).or_default();
        edges.extend(p.craft_dependencies(&crafts).map(str::to_string));
    }
    for (from, targets) in deps {
        let edges = graph.entry(from.clone()).or_default();
        for t in targets {
            if !edges.contains(t) {
                edges.push(t.clone());
            }
        }
    }
    graph
}

pub fn check_circular_dependencies(graph: &BTreeMap<String, Vec<String>>) -> CheckResult {
    let issues = find_cycles(graph)
        .into_iter()
        .map(|cycle| {
            let mut shown = cycle.clone();
            shown.push(cycle[0].clone());
            Issue {
                check: CHECK_CIRCULAR_DEPENDENCIES.into(),
                severity: Severity::Error,
                message: format!("circular dependency: {}", shown.join(" -> ")),
                subject: Some(cycle[0].clone()),
            }
        })
        .collect();
    CheckResult::new(CHECK_CIRCULAR_DEPENDENCIES, issues)
}

/// Depth-first search from every root with an explicit path stack.
///
/// At most one cycle is reported per root; cycles reached from several roots
/// are reported once, rotated to start at their smallest member.
pub fn find_cycles(graph: &BTreeMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut found: BTreeSet<Vec<String>> = BTreeSet::new();
    let mut cycles = Vec::new();
    for root in graph.keys() {
        let mut path: Vec<&str> = Vec::new();
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        if let Some(cycle) = dfs(graph, root, &mut path, &mut visited) {
            let canonical = canonical_cycle(cycle);
            if found.insert(canonical.clone()) {
                cycles.push(canonical);
            }
        }
    }
    cycles
}

fn dfs<'g>(
    graph: &'g BTreeMap<String, Vec<String>>,
    node: &'g str,
    path: &mut Vec<&'g str>,
    visited: &mut BTreeSet<&'g str>,
) -> Option<Vec<String>> {
    path.push(node);
    visited.insert(node);
    for next in graph.get(node).into_iter().flatten() {
        if let Some(start) = path.iter().position(|p| *p == next.as_str()) {
            return Some(path[start..].iter().map(|s| s.to_string()).collect());
        }
        if !visited.contains(next.as_str()) {
            if let Some(cycle) = dfs(graph, next.as_str(), path, visited) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    None
}

fn canonical_cycle(mut cycle: Vec<String>) -> Vec<String> {
    if let Some(min_idx) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_idx);
    }
    cycle
}

/// Materials and project names must survive a migration unchanged.
pub fn check_migration_preservation(
    before: &(MaterialMap, Vec<String>),
    after: &(MaterialMap, Vec<String>),
) -> CheckResult {
    let mut issues = Vec::new();
    let (mat_before, proj_before) = before;
    let (mat_after, proj_after) = after;
    for (name, q) in mat_before {
        let now = mat_after.get(name).copied().unwrap_or(0);
        if now != *q {
            issues.push(Issue {
                check: CHECK_MIGRATION_PRESERVATION.into(),
                severity: Severity::Error,
                message: format!("{name} changed from {q} to {now} during migration"),
                subject: Some(name.clone()),
            });
        }
    }
    for name in proj_before.iter().filter(|n| !proj_after.contains(n)) {
        issues.push(Issue {
            check: CHECK_MIGRATION_PRESERVATION.into(),
            severity: Severity::Error,
            message: format!("project {name} was lost during migration"),
            subject: Some(name.clone()),
        });
    }
    CheckResult::new(CHECK_MIGRATION_PRESERVATION, issues)
}

fn threshold_severity(count: usize, error_threshold: usize) -> Severity {
    if count >= error_threshold {
        Severity::Error
    } else {
        Severity::Warning
    }
}

fn active_set(projects: &[Project]) -> BTreeSet<&str> {
    projects.iter().map(|p| p.name.as_str()).collect()
}

fn looks_like_json(raw: &str) -> bool {
    matches!(raw.trim_start().chars().next(), Some('{' | '[' | '"'))
}

fn decode_as_record(key: &RecordKey, raw: &str) -> Result<(), String> {
    let result = match key {
        RecordKey::ActiveProjects => decode::<Vec<Project>>(key, raw).map(drop),
        RecordKey::ProjectPriorities => decode::<Priorities>(key, raw).map(drop),
        RecordKey::ProjectDependencies => decode::<Dependencies>(key, raw).map(drop),
        RecordKey::NavigationActive | RecordKey::NavigationBreadcrumbs => {
            decode::<Vec<String>>(key, raw).map(drop)
        }
        RecordKey::NavigationCurrent => decode::<Option<String>>(key, raw).map(drop),
        RecordKey::StorageVersion => decode::<u32>(key, raw).map(drop),
        // Quantities are covered by their own check; others are free-form JSON.
        _ => Ok(()),
    };
    result.map_err(|e| e.to_string())
}

fn corrupt_issue(key: &str, reason: &str) -> Issue {
    Issue {
        check: CHECK_CORRUPTED_RECORDS.into(),
        severity: Severity::Error,
        message: format!("corrupted record {key}: {reason}"),
        subject: Some(key.to_string()),
    }
}

fn unevaluable(check: &str, reasons: &[&Option<String>]) -> CheckResult {
    let reason = reasons
        .iter()
        .filter_map(|r| r.as_deref())
        .collect::<Vec<_>>()
        .join("; ");
    CheckResult::new(
        check,
        vec![Issue {
            check: check.into(),
            severity: Severity::Error,
            message: format!("check could not run: {reason}"),
            subject: None,
        }],
    )
}

fn err_of<T>(loaded: &Loaded<T>) -> Option<String> {
    match loaded {
        Loaded::Ok(_) => None,
        Loaded::Corrupt(e) => Some(e.clone()),
    }
}
