#![deny(warnings)]

//! Core domain models and invariants for the shipyard tracker.
//!
//! This crate defines the serializable records kept in storage (materials,
//! crafting projects, navigation state), the generated exchange-table shape,
//! requirement aggregation across projects and validation helpers that guard
//! the basic invariants.

pub mod config;
pub mod exchange;
pub mod requirements;

pub use config::{
    ConfigError, HealthConfig, RollbackConfig, StorageConfig, TrackerConfig, ValidationConfig,
};
pub use exchange::{Exchange, ExchangeIndex, ExchangeInput, ExchangeKind, ExchangeTable};
pub use requirements::{aggregate_requirements, completion_percent, shortfall};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Material name -> owned or needed count.
pub type MaterialMap = BTreeMap<String, u64>;

/// A crafting project the player is actively tracking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Craft name, unique within the active set.
    pub name: String,
    /// Craft category, e.g. "ship" or "module".
    #[serde(rename = "type")]
    pub kind: String,
    /// Materials needed to finish the craft.
    pub requirements: MaterialMap,
    /// Last time the project was created or edited.
    pub last_updated: DateTime<Utc>,
}

impl Project {
    /// New project stamped with the current time.
    pub fn new(name: impl Into<String>, kind: impl Into<String>, requirements: MaterialMap) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            requirements,
            last_updated: Utc::now(),
        }
    }

    /// Requirement keys that name another craft rather than a raw material.
    pub fn craft_dependencies<'a>(
        &'a self,
        crafts: &'a BTreeSet<&str>,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.requirements
            .keys()
            .map(String::as_str)
            .filter(move |m| crafts.contains(m) && *m != self.name)
    }
}

/// Navigation layer state: selection, breadcrumb trail and its own active list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationState {
    /// Currently selected craft, if any.
    pub current: Option<String>,
    /// Trail of crafts visited to reach the current one.
    pub breadcrumbs: Vec<String>,
    /// Crafts the navigation layer considers active.
    pub active: Vec<String>,
}

impl NavigationState {
    /// Whether the current selection (if any) is one of the active crafts.
    pub fn current_is_active(&self) -> bool {
        match &self.current {
            Some(c) => self.active.iter().any(|a| a == c),
            None => true,
        }
    }
}

/// Clamp a signed quantity to the stored non-negative range.
pub fn clamp_quantity(qty: i64) -> u64 {
    qty.max(0) as u64
}

/// Validation errors for domain invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Names must contain something besides whitespace.
    #[error("name must not be empty")]
    EmptyName,
    /// Material names inside a requirement map must not be empty.
    #[error("project {0} has a requirement with an empty material name")]
    EmptyMaterial(String),
    /// Project names must be unique in the active set.
    #[error("duplicate project: {0}")]
    DuplicateProject(String),
    /// An exchange references a material missing from the table's material list.
    #[error("exchange for {output} uses unknown material {material}")]
    UnknownMaterial { output: String, material: String },
    /// Exchange inputs must need at least one unit.
    #[error("exchange for {0} has an input with zero quantity")]
    ZeroInput(String),
}

/// Validate a single project record.
pub fn validate_project(p: &Project) -> Result<(), ValidationError> {
    if p.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if p.requirements.keys().any(|m| m.trim().is_empty()) {
        return Err(ValidationError::EmptyMaterial(p.name.clone()));
    }
    Ok(())
}

/// Validate an active-project list, including name uniqueness.
pub fn validate_projects(projects: &[Project]) -> Result<(), ValidationError> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for p in projects {
        validate_project(p)?;
        if !seen.insert(p.name.as_str()) {
            return Err(ValidationError::DuplicateProject(p.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn project(name: &str, reqs: &[(&str, u64)]) -> Project {
        Project::new(
            name,
            "ship",
            reqs.iter().map(|(m, q)| (m.to_string(), *q)).collect(),
        )
    }

    #[test]
    fn project_serializes_with_camel_case_keys() {
        let p = project("Brig", &[("Plywood", 10)]);
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "ship");
        assert!(v.get("lastUpdated").is_some());
        let back: Project = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn duplicate_names_rejected() {
        let list = vec![project("Brig", &[]), project("Brig", &[("Iron", 1)])];
        assert_eq!(
            validate_projects(&list),
            Err(ValidationError::DuplicateProject("Brig".into()))
        );
    }

    #[test]
    fn empty_name_rejected() {
        assert_eq!(
            validate_project(&project("  ", &[])),
            Err(ValidationError::EmptyName)
        );
        assert_eq!(
            validate_project(&project("Brig", &[("", 3)])),
            Err(ValidationError::EmptyMaterial("Brig".into()))
        );
    }

    #[test]
    fn craft_dependencies_skip_raw_materials_and_self() {
        let brig = project("Brig", &[("Cannon", 2), ("Plywood", 10), ("Brig", 1)]);
        let crafts: BTreeSet<&str> = ["Brig", "Cannon"].into_iter().collect();
        let deps: Vec<&str> = brig.craft_dependencies(&crafts).collect();
        assert_eq!(deps, vec!["Cannon"]);
    }

    #[test]
    fn navigation_current_membership() {
        let mut nav = NavigationState::default();
        assert!(nav.current_is_active());
        nav.current = Some("Brig".into());
        assert!(!nav.current_is_active());
        nav.active.push("Brig".into());
        assert!(nav.current_is_active());
    }

    proptest! {
        #[test]
        fn clamp_never_negative(q in any::<i64>()) {
            let c = clamp_quantity(q);
            if q >= 0 {
                prop_assert_eq!(c, q as u64);
            } else {
                prop_assert_eq!(c, 0);
            }
        }
    }
}
