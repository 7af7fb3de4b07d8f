use super::Outcome;
use crate::Context;
use crate::cli::DeployArgs;
use crate::ui;
use anyhow::Result;
use fleetkit::{OperationKind, OperationRequest};

pub fn run(ctx: &Context, args: DeployArgs) -> Result<Outcome> {
    let requests: Vec<_> = args
        .env
        .environment
        .iter()
        .map(|env| OperationRequest::new(env, OperationKind::Deploy { dry_run: args.check }))
        .collect();

    let verb = if args.check { "Planning" } else { "Deploying" };
    let outcome = super::run_requests(ctx, verb, &requests)?;

    if args.check && !ctx.json && !ctx.quiet {
        ui::dim("Check mode: nothing was applied. Re-run without --check to converge.");
    }
    Ok(outcome)
}
