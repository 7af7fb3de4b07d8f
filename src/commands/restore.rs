use super::Outcome;
use crate::Context;
use crate::cli::RestoreArgs;
use crate::ui;
use anyhow::{Context as _, Result};
use dialoguer::Input;
use fleetkit::{ConfirmationToken, OperationKind, OperationRequest, RestoreOptions};
use std::io::IsTerminal;

pub fn run(ctx: &Context, args: RestoreArgs) -> Result<Outcome> {
    let confirmation = match (&args.confirm, args.drop_existing) {
        (Some(token), _) => Some(ConfirmationToken::new(token.as_str())),
        (None, true) if can_prompt(ctx) => prompt_token(&args.environment)?,
        // the engine rejects the missing token before touching any node
        (None, _) => None,
    };

    let request = OperationRequest::new(
        &args.environment,
        OperationKind::Restore(RestoreOptions {
            artifact: args.file,
            database_filter: args.database,
            drop_existing: args.drop_existing,
            target: args.target,
            confirmation,
        }),
    );
    super::run_requests(ctx, "Restoring", &[request])
}

fn can_prompt(ctx: &Context) -> bool {
    !ctx.json && std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn prompt_token(environment: &str) -> Result<Option<ConfirmationToken>> {
    ui::warn(&format!(
        "--drop-existing removes the current data of '{environment}' before restoring"
    ));
    let typed: String = Input::new()
        .with_prompt(format!("Type '{environment}' to confirm"))
        .allow_empty(true)
        .interact_text()
        .context("Failed to read confirmation")?;

    let typed = typed.trim();
    if typed.is_empty() {
        return Ok(None);
    }
    Ok(Some(ConfirmationToken::new(typed)))
}
