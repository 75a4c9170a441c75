#![deny(warnings)]

//! Offline flattening of static barter and craft tables.
//!
//! The raw tables are grouped by merchant and by recipe level; the tracker
//! wants one flat list of exchanges per output. Each generator reads its
//! table from the data directory and writes the flattened
//! [`ExchangeTable`] under `generated/`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use tracker_core::{
    Exchange, ExchangeInput, ExchangeKind, ExchangeTable, MaterialMap, ValidationError,
};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TRACKER_DATA_DIR";
pub const BARTER_INPUT: &str = "barter_table.json";
pub const CRAFT_INPUT: &str = "craft_table.json";
pub const GENERATED_DIR: &str = "generated";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode table: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("flattened table is invalid: {0}")]
    Invalid(#[from] ValidationError),
}

impl PipelineError {
    /// Whether the input table could not be loaded at all.
    pub fn is_load_failure(&self) -> bool {
        matches!(self, PipelineError::Read { .. } | PipelineError::Parse { .. })
    }
}

/// Raw barter table: merchants and the trades they offer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarterTable {
    pub merchants: Vec<Merchant>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub name: String,
    #[serde(default)]
    pub trades: Vec<Trade>,
}

/// Items handed over at merchant `level` in exchange for `receive`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub level: u32,
    pub give: MaterialMap,
    pub receive: String,
}

/// Raw craft table: recipes with per-level material lists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CraftTable {
    pub recipes: Vec<Recipe>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub output: String,
    pub levels: Vec<RecipeLevel>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeLevel {
    pub level: u32,
    pub materials: MaterialMap,
}

/// `$TRACKER_DATA_DIR`, or `data` in the working directory.
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PipelineError> {
    let text = fs::read_to_string(path).map_err(|source| PipelineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| PipelineError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_barter(path: &Path) -> Result<BarterTable, PipelineError> {
    load(path)
}

pub fn load_craft(path: &Path) -> Result<CraftTable, PipelineError> {
    load(path)
}

/// One barter exchange per trade; zero-amount items are dropped.
pub fn flatten_barter(table: &BarterTable) -> Result<ExchangeTable, PipelineError> {
    let mut exchanges = Vec::new();
    for merchant in &table.merchants {
        for trade in &merchant.trades {
            let inputs = inputs_at(trade.level, &trade.give, &trade.receive);
            if inputs.is_empty() {
                warn!(merchant = %merchant.name, output = %trade.receive, "trade gives nothing, skipped");
                continue;
            }
            exchanges.push(Exchange {
                kind: ExchangeKind::Barter,
                inputs,
                output: trade.receive.clone(),
            });
        }
    }
    finish(exchanges)
}

/// One craft exchange per recipe, inputs tagged with their level.
pub fn flatten_craft(table: &CraftTable) -> Result<ExchangeTable, PipelineError> {
    let mut exchanges = Vec::new();
    for recipe in &table.recipes {
        let mut levels: Vec<&RecipeLevel> = recipe.levels.iter().collect();
        levels.sort_by_key(|l| l.level);
        let inputs: Vec<ExchangeInput> = levels
            .into_iter()
            .flat_map(|l| inputs_at(l.level, &l.materials, &recipe.output))
            .collect();
        if inputs.is_empty() {
            warn!(output = %recipe.output, "recipe needs nothing, skipped");
            continue;
        }
        exchanges.push(Exchange {
            kind: ExchangeKind::Craft,
            inputs,
            output: recipe.output.clone(),
        });
    }
    finish(exchanges)
}

fn inputs_at(level: u32, items: &MaterialMap, output: &str) -> Vec<ExchangeInput> {
    items
        .iter()
        .filter(|(material, needed)| {
            if **needed == 0 {
                warn!(%output, %material, level, "zero-amount input dropped");
            }
            **needed > 0
        })
        .map(|(material, needed)| ExchangeInput {
            level,
            material: material.clone(),
            needed: *needed,
        })
        .collect()
}

fn finish(exchanges: Vec<Exchange>) -> Result<ExchangeTable, PipelineError> {
    let materials: BTreeSet<String> = exchanges
        .iter()
        .flat_map(|e| {
            e.inputs
                .iter()
                .map(|i| i.material.clone())
                .chain(std::iter::once(e.output.clone()))
        })
        .collect();
    let table = ExchangeTable {
        materials: materials.into_iter().collect(),
        exchanges,
    };
    table.validate()?;
    Ok(table)
}

/// Write `table` as pretty JSON, creating parent directories.
pub fn write_table(table: &ExchangeTable, path: &Path) -> Result<(), PipelineError> {
    let text = serde_json::to_string_pretty(table)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PipelineError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, text).map_err(|source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Load, flatten and write the `kind` table under `dir`. Returns the output path.
pub fn generate(kind: ExchangeKind, dir: &Path) -> Result<PathBuf, PipelineError> {
    let (input, table) = match kind {
        ExchangeKind::Barter => {
            let input = dir.join(BARTER_INPUT);
            let table = flatten_barter(&load_barter(&input)?)?;
            (input, table)
        }
        ExchangeKind::Craft => {
            let input = dir.join(CRAFT_INPUT);
            let table = flatten_craft(&load_craft(&input)?)?;
            (input, table)
        }
    };
    let name = match kind {
        ExchangeKind::Barter => "barter.json",
        ExchangeKind::Craft => "craft.json",
    };
    let output = dir.join(GENERATED_DIR).join(name);
    write_table(&table, &output)?;
    info!(
        input = %input.display(),
        output = %output.display(),
        materials = table.materials.len(),
        exchanges = table.exchanges.len(),
        "exchange table generated"
    );
    Ok(output)
}

/// Shared entry point of the generator binaries: exit code 1 on any failure.
pub fn run_generator(kind: ExchangeKind) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match generate(kind, &data_dir()) {
        Ok(path) => {
            println!("wrote {}", path.display());
            Ok(())
        }
        Err(e) => {
            if e.is_load_failure() {
                eprintln!("failed to load input data: {e}");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracker_core::ExchangeIndex;

    fn barter_json() -> &'static str {
        r#"{
          "merchants": [
            { "name": "Harbor", "trades": [
              { "level": 1, "give": { "Plywood": 10, "Iron": 0 }, "receive": "Sloop Hull" },
              { "level": 2, "give": { "Sloop Hull": 1, "Tar": 4 }, "receive": "Brig Hull" }
            ]},
            { "name": "Empty" }
          ]
        }"#
    }

    fn craft_json() -> &'static str {
        r#"{
          "recipes": [
            { "output": "Brig", "levels": [
              { "level": 2, "materials": { "Canvas": 8 } },
              { "level": 1, "materials": { "Plywood": 20, "Iron": 5 } }
            ]}
          ]
        }"#
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "data-pipeline-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn barter_flattens_one_exchange_per_trade() {
        let table: BarterTable = serde_json::from_str(barter_json()).unwrap();
        let out = flatten_barter(&table).unwrap();
        assert_eq!(out.exchanges.len(), 2);
        assert!(out.exchanges.iter().all(|e| e.kind == ExchangeKind::Barter));
        // Zero-amount Iron is dropped and so never listed.
        assert_eq!(out.materials, vec!["Brig Hull", "Plywood", "Sloop Hull", "Tar"]);
        let index = ExchangeIndex::new(&out);
        assert_eq!(index.outputs_using("Sloop Hull"), vec!["Brig Hull"]);
    }

    #[test]
    fn craft_inputs_keep_levels_in_order() {
        let table: CraftTable = serde_json::from_str(craft_json()).unwrap();
        let out = flatten_craft(&table).unwrap();
        assert_eq!(out.exchanges.len(), 1);
        let levels: Vec<u32> = out.exchanges[0].inputs.iter().map(|i| i.level).collect();
        assert_eq!(levels, vec![1, 1, 2]);
        let index = ExchangeIndex::new(&out);
        let l1 = index.inputs_at_level("Brig", ExchangeKind::Craft, 1);
        assert_eq!(l1.get("Plywood"), Some(&20));
    }

    #[test]
    fn generated_shape_matches_consumer() {
        let table: CraftTable = serde_json::from_str(craft_json()).unwrap();
        let json = serde_json::to_value(flatten_craft(&table).unwrap()).unwrap();
        assert_eq!(json["exchanges"][0]["type"], "craft");
        assert_eq!(json["exchanges"][0]["inputs"][0]["needed"], 5);
        assert!(json["materials"].is_array());
    }

    #[test]
    fn generate_writes_output_and_reports_missing_input() {
        let dir = temp_dir("gen");
        fs::write(dir.join(CRAFT_INPUT), craft_json()).unwrap();
        let path = generate(ExchangeKind::Craft, &dir).unwrap();
        assert_eq!(path, dir.join("generated").join("craft.json"));
        let written: ExchangeTable =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.exchanges[0].output, "Brig");

        let err = generate(ExchangeKind::Barter, &dir).unwrap_err();
        assert!(err.is_load_failure());
        fs::write(dir.join(BARTER_INPUT), "{ not json").unwrap();
        assert!(matches!(
            generate(ExchangeKind::Barter, &dir),
            Err(PipelineError::Parse { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    proptest! {
        #[test]
        fn flattened_tables_always_validate(
            trades in proptest::collection::vec(
                (1u32..5, proptest::collection::btree_map("[a-e]", 0u64..20, 0..4), "[v-z]"),
                0..12,
            )
        ) {
            let table = BarterTable {
                merchants: vec![Merchant {
                    name: "m".into(),
                    trades: trades
                        .into_iter()
                        .map(|(level, give, receive)| Trade { level, give, receive })
                        .collect(),
                }],
            };
            let out = flatten_barter(&table).unwrap();
            prop_assert!(out.validate().is_ok());
            prop_assert!(out.exchanges.iter().all(|e| !e.inputs.is_empty()));
        }
    }
}
