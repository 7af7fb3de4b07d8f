use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dbfleet")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Deploy, back up, restore, and inspect database fleets", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Settings file (default: ~/.config/dbfleet/config.toml)
    #[arg(long, global = true, env = "DBFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Converge an environment onto its declared state
    Deploy(DeployArgs),

    /// Take a backup of an environment
    Backup(EnvArgs),

    /// Restore an environment from a backup
    Restore(RestoreArgs),

    /// Report health of every node in an environment
    Status(EnvArgs),

    /// List backups of an environment
    ListBackups(EnvArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct EnvArgs {
    /// Environment name (one or more, comma-separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub environment: Vec<String>,
}

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub env: EnvArgs,

    /// Show planned actions and config diffs without applying them
    #[arg(long)]
    pub check: bool,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Environment to restore into
    #[arg(short, long)]
    pub environment: String,

    /// Backup file name, path, or "latest"
    #[arg(short, long, default_value = "latest")]
    pub file: String,

    /// Restore only this database
    #[arg(short, long)]
    pub database: Option<String>,

    /// Drop existing data before restoring (requires --confirm)
    #[arg(long)]
    pub drop_existing: bool,

    /// Confirmation token: the environment name
    #[arg(long, value_name = "ENV")]
    pub confirm: Option<String>,

    /// Restore onto this node instead of the primary
    #[arg(long, value_name = "NODE")]
    pub target: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_environment_list_splits_on_commas() {
        let cli = Cli::try_parse_from(["dbfleet", "status", "-e", "staging,qa"]).unwrap();
        let Command::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert_eq!(args.environment, vec!["staging".to_string(), "qa".to_string()]);
    }

    #[test]
    fn test_restore_defaults_to_latest() {
        let cli =
            Cli::try_parse_from(["dbfleet", "restore", "-e", "staging", "--database", "appdb"])
                .unwrap();
        let Command::Restore(args) = cli.command else {
            panic!("expected restore");
        };
        assert_eq!(args.file, "latest");
        assert_eq!(args.database.as_deref(), Some("appdb"));
        assert!(!args.drop_existing);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dbfleet", "deploy", "-e", "staging", "--check", "-vv", "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
    }
}
