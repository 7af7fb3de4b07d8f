mod cli;
mod commands;
mod config;
mod inventory;
mod progress;
mod transport;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use colored::Colorize;
use commands::Outcome;
use config::Config;
use std::io;
use std::process::ExitCode;

/// Exit status when at least one node failed
const EXIT_NODES_FAILED: u8 = 1;
/// Exit status when the request was refused before touching any node
const EXIT_PRECONDITION: u8 = 2;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub json: bool,
    pub config: Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::NodesFailed) => ExitCode::from(EXIT_NODES_FAILED),
        Err(e) => {
            report(&e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<Outcome> {
    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "dbfleet", &mut io::stdout());
        return Ok(Outcome::Success);
    }

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json: cli.json,
        config: Config::load(cli.config.as_deref())?,
    };
    log::debug!("verbosity {}", ctx.verbose);

    match cli.command {
        Command::Deploy(args) => commands::deploy::run(&ctx, args),
        Command::Backup(args) => commands::backup::run(&ctx, args),
        Command::Restore(args) => commands::restore::run(&ctx, args),
        Command::Status(args) => commands::status::run(&ctx, args),
        Command::ListBackups(args) => commands::list_backups::run(&ctx, args),
        Command::Completions { .. } => Ok(Outcome::Success),
    }
}

fn fleet_error(e: &anyhow::Error) -> Option<&fleetkit::Error> {
    e.chain().find_map(|cause| cause.downcast_ref::<fleetkit::Error>())
}

fn exit_code(e: &anyhow::Error) -> u8 {
    match fleet_error(e) {
        Some(err) if err.category().is_precondition() => EXIT_PRECONDITION,
        _ => EXIT_NODES_FAILED,
    }
}

fn report(e: &anyhow::Error) {
    ui::error(&format!("{e:#}"));
    if let Some(err) = fleet_error(e) {
        let category = err.category();
        eprintln!(
            "  {} {}",
            format!("{}:", category.description()).dimmed(),
            category.advice()
        );
    }
}
