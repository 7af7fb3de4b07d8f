//! Inventory files: one `<environment>.toml` per environment.
//!
//! ```toml
//! [desired]
//! version = "7.0.5"
//!
//! [desired.replica_set]
//! name = "rs0"
//!
//! [[nodes]]
//! id = "db1"
//! host = "10.0.0.11"
//! ```

use fleetkit::inventory::is_valid_name;
use fleetkit::{DesiredConfig, Environment, Error, InventorySource, Node, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InventoryFile {
    desired: DesiredConfig,
    #[serde(default)]
    nodes: Vec<Node>,
}

/// Reads `<dir>/<environment>.toml` fresh on every call.
#[derive(Debug, Clone)]
pub struct TomlInventory {
    dir: PathBuf,
}

impl TomlInventory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }
}

impl InventorySource for TomlInventory {
    fn load(&self, name: &str) -> Result<Option<Environment>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let file: InventoryFile = toml::from_str(&content).map_err(|e| Error::Config {
            path: path.display().to_string(),
            message: e.to_string().trim().to_string(),
        })?;

        if let Some(node) = file.nodes.iter().find(|n| n.host.trim().is_empty()) {
            return Err(Error::Config {
                path: path.display().to_string(),
                message: format!("node '{}' has an empty host", node.id),
            });
        }

        log::debug!("Loaded inventory {}", path.display());
        Ok(Some(Environment {
            name: name.to_string(),
            nodes: file.nodes,
            desired: file.desired,
        }))
    }

    fn environments(&self) -> Result<Vec<String>> {
        list_toml_stems(&self.dir)
    }
}

/// File stems of `*.toml` directly under `dir` that are valid environment
/// names, sorted.
fn list_toml_stems(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
        .filter(|name| is_valid_name(name))
        .collect();
    names.sort();
    Ok(names)
}
