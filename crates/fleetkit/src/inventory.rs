//! Inventory resolution: environment name → ordered nodes.

use crate::error::{Error, Result};
use crate::types::Environment;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("valid regex"));

/// Where environments come from (inventory files, a CMDB, a fixture).
pub trait InventorySource: Send + Sync {
    /// Load one environment, `None` if it is not declared.
    fn load(&self, name: &str) -> Result<Option<Environment>>;

    /// Names of every declared environment.
    fn environments(&self) -> Result<Vec<String>>;
}

/// An inventory held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    environments: Vec<Environment>,
}

impl StaticInventory {
    pub fn new(environments: Vec<Environment>) -> Self {
        Self { environments }
    }
}

impl InventorySource for StaticInventory {
    fn load(&self, name: &str) -> Result<Option<Environment>> {
        Ok(self.environments.iter().find(|e| e.name == name).cloned())
    }

    fn environments(&self) -> Result<Vec<String>> {
        Ok(self.environments.iter().map(|e| e.name.clone()).collect())
    }
}

/// Resolves environment names against an [`InventorySource`].
///
/// Nothing is cached: every call goes back to the source, so a new run
/// always sees the current inventory.
pub struct InventoryResolver {
    source: Box<dyn InventorySource>,
}

impl InventoryResolver {
    pub fn new(source: Box<dyn InventorySource>) -> Self {
        Self { source }
    }

    /// Resolve `name` to a validated environment.
    pub fn resolve(&self, name: &str) -> Result<Environment> {
        if !is_valid_name(name) {
            return Err(Error::not_found(format!(
                "environment '{name}' (names may only contain letters, digits, '-' and '_')"
            )));
        }

        let Some(env) = self.source.load(name)? else {
            let mut known = self.environments().unwrap_or_default();
            known.sort();
            return Err(Error::not_found(if known.is_empty() {
                format!("environment '{name}'")
            } else {
                format!("environment '{name}' (known: {})", known.join(", "))
            }));
        };

        if env.nodes.is_empty() {
            return Err(Error::not_found(format!(
                "environment '{name}' has no nodes"
            )));
        }

        let mut seen = HashSet::new();
        for node in &env.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(Error::precondition(format!(
                    "environment '{name}' declares node '{}' twice",
                    node.id
                )));
            }
        }

        log::debug!("Resolved environment {} ({} nodes)", name, env.nodes.len());
        Ok(env)
    }

    /// Names of every declared environment.
    pub fn environments(&self) -> Result<Vec<String>> {
        self.source.environments()
    }
}

/// Whether `name` is usable as an environment name (and artifact prefix).
pub fn is_valid_name(name: &str) -> bool {
    ENV_NAME.is_match(name)
}
