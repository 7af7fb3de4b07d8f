use chrono::Utc;
use colored::{ColoredString, Colorize};
use fleetkit::status::format_age;
use fleetkit::{BackupArtifact, CheckStatus, NodeOutcome, NodeStatus, OperationResult};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Operation Results
// ============================================================================

fn status_symbol(status: NodeStatus) -> ColoredString {
    match status {
        NodeStatus::Ok => "✓".green(),
        NodeStatus::Changed => "✓".cyan(),
        NodeStatus::Skipped => "-".dimmed(),
        NodeStatus::Failed => "✗".red(),
    }
}

fn check_symbol(status: CheckStatus) -> ColoredString {
    match status {
        CheckStatus::Pass => "✓".green(),
        CheckStatus::Warn => "⚠".yellow(),
        CheckStatus::Fail => "✗".red(),
    }
}

/// Print a full operation result.
pub fn result(result: &OperationResult) {
    header(&format!("{} · {}", result.operation, result.environment));

    for node in &result.nodes {
        node_outcome(node);
    }

    if let Some(artifact) = &result.artifact {
        println!();
        kv("artifact", &artifact.file_name);
        kv("size", &format_size(artifact.size));
        if let Some(checksum) = &artifact.checksum {
            kv("blake3", &checksum[..checksum.len().min(16)]);
        }
        if !artifact.databases.is_empty() {
            kv("databases", &artifact.databases.join(", "));
        }
    }

    if !result.notes.is_empty() {
        println!();
        for note in &result.notes {
            info(note);
        }
    }

    println!();
    let summary = summary_line(result);
    match result.overall() {
        NodeStatus::Failed => error(&summary),
        _ => success(&summary),
    }
}

fn node_outcome(node: &NodeOutcome) {
    println!(
        "  {} {} {}",
        status_symbol(node.status),
        node.node.bold(),
        node.message
    );
    for check in &node.checks {
        println!(
            "      {} {} {}",
            check_symbol(check.status),
            format!("{}:", check.name).dimmed(),
            check.value
        );
    }
    if let Some(detail) = &node.detail {
        for line in detail.lines() {
            println!("      {}", detail_line(line));
        }
    }
}

/// Diff lines colored the way dry-run config diffs read best.
fn detail_line(line: &str) -> ColoredString {
    if line.starts_with("+ ") {
        line.green()
    } else if line.starts_with("- ") {
        line.red()
    } else {
        line.dimmed()
    }
}

/// `2 changed, 1 ok` style tally, in severity order.
pub fn summary_line(result: &OperationResult) -> String {
    let parts: Vec<String> = [
        NodeStatus::Failed,
        NodeStatus::Changed,
        NodeStatus::Skipped,
        NodeStatus::Ok,
    ]
    .into_iter()
    .map(|status| (status, result.count(status)))
    .filter(|(_, count)| *count > 0)
    .map(|(status, count)| format!("{count} {status}"))
    .collect();

    if parts.is_empty() {
        "no nodes".to_string()
    } else {
        parts.join(", ")
    }
}

/// Print a backup listing, newest last.
pub fn backups(environment: &str, artifacts: &[BackupArtifact]) {
    header(&format!("backups · {environment}"));
    if artifacts.is_empty() {
        dim("no backups");
        return;
    }
    let now = Utc::now();
    for artifact in artifacts {
        println!(
            "  {}  {:>9}  {}  {}",
            artifact.file_name,
            format_size(artifact.size),
            format!("{} ago", format_age(artifact.age(now))).dimmed(),
            artifact.databases.join(",").dimmed()
        );
    }
}

// ============================================================================
// Size Formatting
// ============================================================================

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

// ============================================================================
// Tests
// ============================================================================
