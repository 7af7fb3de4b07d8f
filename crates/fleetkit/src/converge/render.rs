//! Renders the database configuration file for one node.

use crate::types::{DesiredConfig, Node};

/// Data directory inside the container; `DesiredConfig::data_path` is
/// mounted here.
pub const CONTAINER_DATA_DIR: &str = "/data/db";

/// Render `mongod.conf` for `node`.
///
/// The output is deterministic so that comparing it byte for byte with the
/// file on the node tells whether a rewrite is needed.
pub fn render_config(desired: &DesiredConfig, node: &Node) -> String {
    let mut out = String::from("# Managed by dbfleet. Local edits are overwritten on deploy.\n");

    out.push_str("storage:\n");
    out.push_str(&format!("  dbPath: {CONTAINER_DATA_DIR}\n"));
    out.push_str(&format!("  engine: {}\n", desired.storage.engine));
    if let Some(cache_mb) = desired.storage.cache_size_mb {
        out.push_str("  wiredTiger:\n    engineConfig:\n");
        out.push_str(&format!("      cacheSizeGB: {:.2}\n", cache_mb as f64 / 1024.0));
    }

    out.push_str("net:\n");
    out.push_str(&format!("  port: {}\n", node.port));
    out.push_str("  bindIp: 0.0.0.0\n");

    if desired.auth.enabled {
        out.push_str("security:\n  authorization: enabled\n");
        if let Some(keyfile) = &desired.auth.keyfile_path {
            out.push_str(&format!("  keyFile: {keyfile}\n"));
        }
    }

    if let Some(replica) = &desired.replica_set {
        out.push_str("replication:\n");
        out.push_str(&format!("  replSetName: {}\n", replica.name));
        if let Some(oplog_mb) = desired.storage.oplog_size_mb {
            out.push_str(&format!("  oplogSizeMB: {oplog_mb}\n"));
        }
    }

    out
}

/// Line diff between the current and the desired file, `-`/`+` prefixed.
pub fn config_diff(current: Option<&str>, desired: &str) -> String {
    let current = current.unwrap_or("");
    let diff = similar::TextDiff::from_lines(current, desired);
    let mut out = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => '-',
            similar::ChangeTag::Insert => '+',
            similar::ChangeTag::Equal => continue,
        };
        out.push(sign);
        out.push(' ');
        out.push_str(change.value());
        if change.missing_newline() {
            out.push('\n');
        }
    }
    out
}
