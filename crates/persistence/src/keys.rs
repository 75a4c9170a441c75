//! Closed schema of the unified storage keys.
//!
//! Key strings are a compatibility surface with data already stored by users;
//! they must not change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::legacy;

pub const INVENTORY_PREFIX: &str = "inventory:";
pub const PROJECTS_PREFIX: &str = "projects:";
pub const NAVIGATION_PREFIX: &str = "navigation:";
pub const PREFERENCES_PREFIX: &str = "preferences:";
pub const META_PREFIX: &str = "meta:";
pub const SYSTEM_PREFIX: &str = "system:";

/// Every prefix owned by the application.
pub const APP_PREFIXES: [&str; 6] = [
    INVENTORY_PREFIX,
    PROJECTS_PREFIX,
    NAVIGATION_PREFIX,
    PREFERENCES_PREFIX,
    META_PREFIX,
    SYSTEM_PREFIX,
];

const ROLLBACK_POINT_PREFIX: &str = "system:rollback:";

/// Key-name fragments marking a foreign key as a user preference.
pub const PREFERENCE_FRAGMENTS: [&str; 3] = ["theme", "settings", "ui_"];

/// A logical record in unified storage.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    /// Owned count of one material.
    Material(String),
    ActiveProjects,
    ProjectPriorities,
    ProjectDependencies,
    /// Navigation layer's own list of active crafts.
    NavigationActive,
    NavigationCurrent,
    NavigationBreadcrumbs,
    Preference(String),
    StorageVersion,
    RollbackPoint(String),
    EmergencyBackups,
    RollbackHistory,
    HealthHistory,
    /// Throwaway key written by the health monitor's workflow canary.
    HealthCanary,
}

impl RecordKey {
    /// Parse a raw key; `None` for keys outside the unified schema.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = match raw {
            "projects:active" => Self::ActiveProjects,
            "projects:priorities" => Self::ProjectPriorities,
            "projects:dependencies" => Self::ProjectDependencies,
            "navigation:active" => Self::NavigationActive,
            "navigation:current" => Self::NavigationCurrent,
            "navigation:breadcrumbs" => Self::NavigationBreadcrumbs,
            "meta:storage_version" => Self::StorageVersion,
            "system:emergency_backups" => Self::EmergencyBackups,
            "system:rollback_history" => Self::RollbackHistory,
            "system:health_history" => Self::HealthHistory,
            "system:health_canary" => Self::HealthCanary,
            _ => {
                if let Some(name) = non_empty_suffix(raw, INVENTORY_PREFIX) {
                    Self::Material(name.to_string())
                } else if let Some(name) = non_empty_suffix(raw, PREFERENCES_PREFIX) {
                    Self::Preference(name.to_string())
                } else if let Some(name) = non_empty_suffix(raw, ROLLBACK_POINT_PREFIX) {
                    Self::RollbackPoint(name.to_string())
                } else {
                    return None;
                }
            }
        };
        Some(key)
    }

    /// Logical component the key belongs to.
    pub fn component(&self) -> Component {
        match self {
            Self::Material(_) => Component::Inventory,
            Self::ActiveProjects | Self::ProjectPriorities | Self::ProjectDependencies => {
                Component::Projects
            }
            Self::NavigationActive | Self::NavigationCurrent | Self::NavigationBreadcrumbs => {
                Component::Navigation
            }
            Self::Preference(_) => Component::Preferences,
            Self::StorageVersion => Component::Meta,
            Self::RollbackPoint(_)
            | Self::EmergencyBackups
            | Self::RollbackHistory
            | Self::HealthHistory
            | Self::HealthCanary => Component::System,
        }
    }
}

fn non_empty_suffix<'a>(raw: &'a str, prefix: &str) -> Option<&'a str> {
    raw.strip_prefix(prefix).filter(|s| !s.is_empty())
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Material(name) => write!(f, "{INVENTORY_PREFIX}{name}"),
            Self::ActiveProjects => f.write_str("projects:active"),
            Self::ProjectPriorities => f.write_str("projects:priorities"),
            Self::ProjectDependencies => f.write_str("projects:dependencies"),
            Self::NavigationActive => f.write_str("navigation:active"),
            Self::NavigationCurrent => f.write_str("navigation:current"),
            Self::NavigationBreadcrumbs => f.write_str("navigation:breadcrumbs"),
            Self::Preference(name) => write!(f, "{PREFERENCES_PREFIX}{name}"),
            Self::StorageVersion => f.write_str("meta:storage_version"),
            Self::RollbackPoint(name) => write!(f, "{ROLLBACK_POINT_PREFIX}{name}"),
            Self::EmergencyBackups => f.write_str("system:emergency_backups"),
            Self::RollbackHistory => f.write_str("system:rollback_history"),
            Self::HealthHistory => f.write_str("system:health_history"),
            Self::HealthCanary => f.write_str("system:health_canary"),
        }
    }
}

/// Logical groups of keys, used by selective restores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Inventory,
    Projects,
    Navigation,
    Preferences,
    Meta,
    System,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::Inventory,
        Component::Projects,
        Component::Navigation,
        Component::Preferences,
        Component::Meta,
        Component::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Inventory => "inventory",
            Component::Projects => "projects",
            Component::Navigation => "navigation",
            Component::Preferences => "preferences",
            Component::Meta => "meta",
            Component::System => "system",
        }
    }

    /// Whether `raw` belongs to this component, legacy keys included.
    pub fn owns(&self, raw: &str) -> bool {
        if let Some(key) = RecordKey::parse(raw) {
            return key.component() == *self;
        }
        legacy::component_of(raw) == Some(*self)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown component: {s}"))
    }
}

/// Keys the application owns: unified prefixes plus every legacy generation.
pub fn is_application_key(raw: &str) -> bool {
    APP_PREFIXES.iter().any(|p| raw.starts_with(p)) || legacy::is_legacy_key(raw)
}

/// Keys holding rollback machinery state; never part of a snapshot.
pub fn is_rollback_storage(raw: &str) -> bool {
    raw.starts_with(ROLLBACK_POINT_PREFIX)
        || raw == "system:emergency_backups"
        || raw == "system:rollback_history"
}

/// Preference keys: the `preferences:` namespace, plus keys outside every
/// tracker namespace whose name carries a preference fragment.
///
/// Material, project and navigation names never make a key a preference.
pub fn is_preference_key(raw: &str) -> bool {
    if raw.starts_with(PREFERENCES_PREFIX) {
        return true;
    }
    if is_application_key(raw) {
        return false;
    }
    PREFERENCE_FRAGMENTS.iter().any(|p| raw.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_keys_roundtrip() {
        let keys = [
            RecordKey::ActiveProjects,
            RecordKey::ProjectPriorities,
            RecordKey::ProjectDependencies,
            RecordKey::NavigationActive,
            RecordKey::NavigationCurrent,
            RecordKey::NavigationBreadcrumbs,
            RecordKey::StorageVersion,
            RecordKey::EmergencyBackups,
            RecordKey::RollbackHistory,
            RecordKey::HealthHistory,
            RecordKey::HealthCanary,
            RecordKey::RollbackPoint("p1".into()),
            RecordKey::Preference("theme".into()),
        ];
        for k in keys {
            assert_eq!(RecordKey::parse(&k.to_string()), Some(k));
        }
    }

    #[test]
    fn unknown_and_empty_names_rejected() {
        assert_eq!(RecordKey::parse("inventory:"), None);
        assert_eq!(RecordKey::parse("somethingElse"), None);
        assert_eq!(RecordKey::parse("projects:other"), None);
    }

    #[test]
    fn components_cover_legacy_keys() {
        assert!(Component::Inventory.owns("inventory:Plywood"));
        assert!(Component::Inventory.owns("material_Plywood"));
        assert!(Component::Inventory.owns("inventory_Plywood"));
        assert!(Component::Projects.owns("craftTracker_projects"));
        assert!(Component::Navigation.owns("currentCraft"));
        assert!(!Component::Projects.owns("navigation:current"));
        assert_eq!("Navigation".parse::<Component>(), Ok(Component::Navigation));
        assert!("ships".parse::<Component>().is_err());
    }

    #[test]
    fn rollback_keys_are_internal() {
        assert!(is_rollback_storage("system:rollback:p1"));
        assert!(is_rollback_storage("system:rollback_history"));
        assert!(!is_rollback_storage("system:health_history"));
        assert!(is_application_key("system:health_history"));
        assert!(!is_application_key("unrelated"));
    }

    #[test]
    fn preference_fragments_only_mark_foreign_keys() {
        assert!(is_preference_key("preferences:layout"));
        assert!(is_preference_key("ui_scale"));
        assert!(is_preference_key("dark_theme"));
        assert!(!is_preference_key("inventory:ui_frame"));
        assert!(!is_preference_key("projects:active"));
        assert!(!is_preference_key("navigation:current"));
        assert!(!is_preference_key("material_settings_crate"));
        assert!(!is_preference_key("system:health_history"));
    }

    proptest! {
        #[test]
        fn material_keys_roundtrip(name in "[A-Za-z][A-Za-z0-9 _-]{0,20}") {
            let key = RecordKey::Material(name.clone());
            prop_assert_eq!(RecordKey::parse(&key.to_string()), Some(RecordKey::Material(name)));
        }
    }
}
