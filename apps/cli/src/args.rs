//! Hand-rolled argument parsing for the `tracker` binary.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use persistence::{default_store_path, Component};
use tracker_core::MaterialMap;

#[derive(Debug, PartialEq)]
pub struct Args {
    pub store: PathBuf,
    pub config: Option<PathBuf>,
    pub command: Command,
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Status,
    Set {
        material: String,
        qty: i64,
    },
    AddProject {
        name: String,
        kind: String,
        requirements: MaterialMap,
    },
    RemoveProject {
        name: String,
    },
    Requirements,
    Validate,
    Health,
    Monitor {
        count: Option<u32>,
    },
    Checkpoint {
        name: String,
        description: Option<String>,
    },
    Points,
    Rollback {
        name: String,
        strategy: String,
        components: Vec<Component>,
        skip_checkpoint: bool,
    },
    Emergency,
    Migrate,
    Version,
    Help,
}

pub const USAGE: &str = "\
usage: tracker [--store <path>] [--config <yaml>] <command>

commands:
  status                               inventory, projects and storage version
  set <material> <qty>                 set an owned quantity (negative clamps to 0)
  add-project <name> <type> [m=qty..]  track a crafting project
  remove-project <name>                stop tracking a project
  requirements                         totals and shortfall across projects
  validate                             run consistency checks
  health                               run one health check
  monitor [--count <n>]                run health checks on the configured interval
  checkpoint <name> [--note <text>]    create a rollback point
  points                               list rollback points
  rollback <name> [--strategy complete|selective|data-only|emergency]
                  [--components inventory,projects,..] [--no-checkpoint]
  emergency                            run emergency recovery
  migrate                              migrate legacy storage behind a checkpoint
  version                              print build information";

pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Args> {
    let mut store = PathBuf::from(default_store_path());
    let mut config = None;
    let mut rest = Vec::new();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--store" => store = PathBuf::from(value(&mut it, "--store")?),
            "--config" => config = Some(PathBuf::from(value(&mut it, "--config")?)),
            _ => rest.push(arg),
        }
    }
    Ok(Args {
        store,
        config,
        command: command(rest)?,
    })
}

fn value(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    it.next().ok_or_else(|| anyhow!("{flag} needs a value"))
}

fn command(words: Vec<String>) -> Result<Command> {
    let mut it = words.into_iter();
    let Some(name) = it.next() else {
        return Ok(Command::Help);
    };
    let cmd = match name.as_str() {
        "status" => Command::Status,
        "set" => {
            let material = positional(&mut it, "material")?;
            let qty = positional(&mut it, "qty")?;
            Command::Set {
                material,
                qty: qty.parse().map_err(|_| anyhow!("qty must be an integer: {qty}"))?,
            }
        }
        "add-project" => {
            let name = positional(&mut it, "name")?;
            let kind = positional(&mut it, "type")?;
            let mut requirements = MaterialMap::new();
            for pair in it.by_ref() {
                let (m, q) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("requirement must be material=qty: {pair}"))?;
                let q: u64 = q.parse().map_err(|_| anyhow!("bad quantity in {pair}"))?;
                requirements.insert(m.to_string(), q);
            }
            Command::AddProject {
                name,
                kind,
                requirements,
            }
        }
        "remove-project" => Command::RemoveProject {
            name: positional(&mut it, "name")?,
        },
        "requirements" => Command::Requirements,
        "validate" => Command::Validate,
        "health" => Command::Health,
        "monitor" => {
            let mut count = None;
            while let Some(flag) = it.next() {
                match flag.as_str() {
                    "--count" => {
                        let v = value(&mut it, "--count")?;
                        count = Some(v.parse().map_err(|_| anyhow!("bad --count: {v}"))?);
                    }
                    other => bail!("unknown monitor option: {other}"),
                }
            }
            Command::Monitor { count }
        }
        "checkpoint" => {
            let name = positional(&mut it, "name")?;
            let mut description = None;
            while let Some(flag) = it.next() {
                match flag.as_str() {
                    "--note" => description = Some(value(&mut it, "--note")?),
                    other => bail!("unknown checkpoint option: {other}"),
                }
            }
            Command::Checkpoint { name, description }
        }
        "points" => Command::Points,
        "rollback" => {
            let name = positional(&mut it, "name")?;
            let mut strategy = "complete".to_string();
            let mut components = Vec::new();
            let mut skip_checkpoint = false;
            while let Some(flag) = it.next() {
                match flag.as_str() {
                    "--strategy" => strategy = value(&mut it, "--strategy")?,
                    "--components" => {
                        for c in value(&mut it, "--components")?.split(',') {
                            components.push(c.parse::<Component>().map_err(|e| anyhow!(e))?);
                        }
                    }
                    "--no-checkpoint" => skip_checkpoint = true,
                    other => bail!("unknown rollback option: {other}"),
                }
            }
            Command::Rollback {
                name,
                strategy,
                components,
                skip_checkpoint,
            }
        }
        "emergency" => Command::Emergency,
        "migrate" => Command::Migrate,
        "version" | "--version" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        other => bail!("unknown command: {other}\n\n{USAGE}"),
    };
    if let Some(extra) = it.next() {
        bail!("unexpected argument: {extra}");
    }
    Ok(cmd)
}

fn positional(it: &mut impl Iterator<Item = String>, what: &str) -> Result<String> {
    it.next().ok_or_else(|| anyhow!("missing <{what}>\n\n{USAGE}"))
}
