//! Key-level snapshots of a store, with checksums and pairwise diffs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{entry_size, KeyValueStore, StoreError};

/// Hex-encoded Blake3 digest of a raw stored value.
pub fn checksum(raw: &str) -> String {
    hex::encode(blake3::hash(raw.as_bytes()).as_bytes())
}

/// One captured key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Value exactly as stored.
    pub raw: String,
    /// Decoded JSON, when the value parses.
    pub parsed: Option<Value>,
    /// Key plus value bytes.
    pub size: u64,
    pub checksum: String,
}

impl SnapshotEntry {
    pub fn capture(key: &str, raw: String) -> Self {
        Self {
            parsed: serde_json::from_str(&raw).ok(),
            size: entry_size(key, &raw),
            checksum: checksum(&raw),
            raw,
        }
    }
}

/// Captured keys, ordered.
pub type StoreSnapshot = BTreeMap<String, SnapshotEntry>;

/// Capture every key accepted by `include`.
pub fn capture(
    store: &dyn KeyValueStore,
    include: impl Fn(&str) -> bool,
) -> Result<StoreSnapshot, StoreError> {
    let mut snap = StoreSnapshot::new();
    for key in store.keys()?.into_iter().filter(|k| include(k.as_str())) {
        if let Some(raw) = store.get(&key)? {
            let entry = SnapshotEntry::capture(&key, raw);
            snap.insert(key, entry);
        }
    }
    Ok(snap)
}

/// Key-level difference between two snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Keys only in the newer snapshot.
    pub added: Vec<String>,
    /// Keys only in the older snapshot.
    pub removed: Vec<String>,
    /// Keys in both whose checksums differ.
    pub changed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

/// Compare `older` against `newer` by checksum.
pub fn diff(older: &StoreSnapshot, newer: &StoreSnapshot) -> SnapshotDiff {
    let mut out = SnapshotDiff::default();
    for (key, entry) in newer {
        match older.get(key) {
            None => out.added.push(key.clone()),
            Some(old) if old.checksum != entry.checksum => out.changed.push(key.clone()),
            Some(_) => {}
        }
    }
    out.removed = older
        .keys()
        .filter(|k| !newer.contains_key(*k))
        .cloned()
        .collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn checksum_is_stable_and_sensitive() {
        assert_eq!(checksum("10"), checksum("10"));
        assert_ne!(checksum("10"), checksum("10 "));
        assert_eq!(checksum("").len(), 64);
    }

    #[test]
    fn capture_filters_and_parses() {
        let store = MemoryStore::from_entries([
            ("inventory:Plywood", "10"),
            ("navigation:current", "Brig"),
            ("other", "x"),
        ]);
        let snap = capture(&store, |k| k != "other").unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["inventory:Plywood"].parsed, Some(Value::from(10)));
        assert_eq!(snap["navigation:current"].parsed, None);
        assert_eq!(snap["inventory:Plywood"].size, 19);
    }

    #[test]
    fn diff_reports_all_kinds() {
        let a = MemoryStore::from_entries([("k1", "1"), ("k2", "2"), ("k3", "3")]);
        let older = capture(&a, |_| true).unwrap();
        a.set("k2", "22").unwrap();
        a.remove("k3").unwrap();
        a.set("k4", "4").unwrap();
        let newer = capture(&a, |_| true).unwrap();
        let d = diff(&older, &newer);
        assert_eq!(d.added, vec!["k4".to_string()]);
        assert_eq!(d.removed, vec!["k3".to_string()]);
        assert_eq!(d.changed, vec!["k2".to_string()]);
        assert_eq!(d.len(), 3);
        assert!(diff(&newer, &newer).is_empty());
    }
}
