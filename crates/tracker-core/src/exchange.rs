//! Generated exchange tables (barter and craft) and their lookup index.
//!
//! The data pipeline flattens static recipe and barter tables into this shape;
//! the tracker only consumes it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ValidationError;

/// How an output is obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Traded with an NPC merchant.
    Barter,
    /// Crafted at a workshop.
    Craft,
}

/// One input line of an exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeInput {
    /// Tier/level of the recipe row the input belongs to.
    pub level: u32,
    pub material: String,
    pub needed: u64,
}

/// A single way of producing `output` from `inputs`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    pub inputs: Vec<ExchangeInput>,
    pub output: String,
}

/// Flattened lookup table emitted by the generators.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeTable {
    /// Sorted, de-duplicated material names referenced by any exchange.
    pub materials: Vec<String>,
    pub exchanges: Vec<Exchange>,
}

impl ExchangeTable {
    /// Every input material must appear in `materials` and need at least one unit.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let known: BTreeSet<&str> = self.materials.iter().map(String::as_str).collect();
        for ex in &self.exchanges {
            for input in &ex.inputs {
                if input.needed == 0 {
                    return Err(ValidationError::ZeroInput(ex.output.clone()));
                }
                if !known.contains(input.material.as_str()) {
                    return Err(ValidationError::UnknownMaterial {
                        output: ex.output.clone(),
                        material: input.material.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Output -> exchanges and material -> outputs lookups over a table.
#[derive(Debug)]
pub struct ExchangeIndex<'a> {
    table: &'a ExchangeTable,
    by_output: BTreeMap<&'a str, Vec<usize>>,
    by_material: BTreeMap<&'a str, BTreeSet<&'a str>>,
}

impl<'a> ExchangeIndex<'a> {
    pub fn new(table: &'a ExchangeTable) -> Self {
        let mut by_output: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        let mut by_material: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (i, ex) in table.exchanges.iter().enumerate() {
            by_output.entry(ex.output.as_str()).or_default().push(i);
            for input in &ex.inputs {
                by_material
                    .entry(input.material.as_str())
                    .or_default()
                    .insert(ex.output.as_str());
            }
        }
        Self {
            table,
            by_output,
            by_material,
        }
    }

    /// Exchanges producing `output`, in table order.
    pub fn exchanges_for(&self, output: &str) -> impl Iterator<Item = &'a Exchange> + '_ {
        let table = self.table;
        self.by_output
            .get(output)
            .into_iter()
            .flatten()
            .map(move |&i| &table.exchanges[i])
    }

    /// Outputs that consume `material` in any exchange.
    pub fn outputs_using(&self, material: &str) -> Vec<&'a str> {
        self.by_material
            .get(material)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Inputs needed for `output` at `level`, summed over its exchanges of `kind`.
    pub fn inputs_at_level(&self, output: &str, kind: ExchangeKind, level: u32) -> crate::MaterialMap {
        let mut out = crate::MaterialMap::new();
        for ex in self.exchanges_for(output).filter(|e| e.kind == kind) {
            for input in ex.inputs.iter().filter(|i| i.level == level) {
                let total = out.entry(input.material.clone()).or_insert(0);
                *total = total.saturating_add(input.needed);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ExchangeTable {
        ExchangeTable {
            materials: vec!["Iron".into(), "Plywood".into(), "Resin".into()],
            exchanges: vec![
                Exchange {
                    kind: ExchangeKind::Craft,
                    inputs: vec![
                        ExchangeInput { level: 1, material: "Plywood".into(), needed: 10 },
                        ExchangeInput { level: 2, material: "Iron".into(), needed: 4 },
                    ],
                    output: "Brig".into(),
                },
                Exchange {
                    kind: ExchangeKind::Barter,
                    inputs: vec![ExchangeInput { level: 1, material: "Resin".into(), needed: 3 }],
                    output: "Plywood".into(),
                },
            ],
        }
    }

    #[test]
    fn wire_shape_uses_type_field() {
        let json = serde_json::to_value(table()).unwrap();
        assert_eq!(json["exchanges"][0]["type"], "craft");
        assert_eq!(json["exchanges"][1]["type"], "barter");
        assert_eq!(json["exchanges"][0]["inputs"][1]["needed"], 4);
    }

    #[test]
    fn index_lookups() {
        let t = table();
        let idx = ExchangeIndex::new(&t);
        assert_eq!(idx.exchanges_for("Brig").count(), 1);
        assert_eq!(idx.exchanges_for("Nothing").count(), 0);
        assert_eq!(idx.outputs_using("Plywood"), vec!["Brig"]);
        let lvl2 = idx.inputs_at_level("Brig", ExchangeKind::Craft, 2);
        assert_eq!(lvl2.get("Iron"), Some(&4));
        assert!(lvl2.get("Plywood").is_none());
    }

    #[test]
    fn level_totals_saturate() {
        let mut t = table();
        for needed in [u64::MAX, 5] {
            t.exchanges.push(Exchange {
                kind: ExchangeKind::Craft,
                inputs: vec![ExchangeInput { level: 1, material: "Iron".into(), needed }],
                output: "Galleon".into(),
            });
        }
        let idx = ExchangeIndex::new(&t);
        let lvl1 = idx.inputs_at_level("Galleon", ExchangeKind::Craft, 1);
        assert_eq!(lvl1.get("Iron"), Some(&u64::MAX));
    }

    #[test]
    fn validate_catches_unknown_material() {
        let mut t = table();
        t.validate().unwrap();
        t.materials.retain(|m| m != "Resin");
        assert_eq!(
            t.validate(),
            Err(ValidationError::UnknownMaterial {
                output: "Plywood".into(),
                material: "Resin".into()
            })
        );
    }
}
