pub mod backup;
pub mod deploy;
pub mod list_backups;
pub mod restore;
pub mod status;

use crate::Context;
use crate::inventory::TomlInventory;
use crate::{progress, transport, ui};
use anyhow::Result;
use fleetkit::{InventoryResolver, LocalStore, OperationRequest, OperationResult, Orchestrator};
use std::sync::Arc;

/// How a command finished, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every node ok, changed, or skipped
    Success,
    /// At least one node failed
    NodesFailed,
}

/// Build an orchestrator from the loaded settings.
pub fn orchestrator(ctx: &Context) -> Orchestrator {
    let config = &ctx.config;
    log::debug!(
        "inventory {}, backups {}",
        config.inventory_path().display(),
        config.backup_root_path().display()
    );
    Orchestrator::new(
        InventoryResolver::new(Box::new(TomlInventory::new(config.inventory_path()))),
        transport::backends(config.ssh_options()),
        Arc::new(LocalStore::new(config.backup_root_path())),
        config.settings(),
    )
}

/// Run one request per environment, render every result, and report the
/// first request-level error after the rest have been shown.
pub fn run_requests(ctx: &Context, verb: &str, requests: &[OperationRequest]) -> Result<Outcome> {
    let orchestrator = orchestrator(ctx);
    let names: Vec<&str> = requests.iter().map(|r| r.environment.as_str()).collect();

    let pb = progress::spinner(&format!("{verb} {}...", names.join(", ")), ctx.quiet || ctx.json);
    let results = orchestrator.run_all(requests);
    progress::finish_clear(&pb);

    let mut completed: Vec<OperationResult> = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(result) => completed.push(result),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(e) => ui::error(&e.to_string()),
        }
    }

    if ctx.json {
        print_json(&completed)?;
    } else {
        for result in &completed {
            ui::result(result);
        }
    }

    if let Some(e) = first_error {
        return Err(e.into());
    }
    Ok(if completed.iter().all(OperationResult::is_success) {
        Outcome::Success
    } else {
        Outcome::NodesFailed
    })
}

/// A single value as an object, several as an array.
pub fn print_json<T: serde::Serialize>(items: &[T]) -> Result<()> {
    let json = match items {
        [single] => serde_json::to_string_pretty(single)?,
        _ => serde_json::to_string_pretty(items)?,
    };
    println!("{json}");
    Ok(())
}
