use super::Outcome;
use crate::Context;
use crate::cli::EnvArgs;
use anyhow::Result;
use fleetkit::{OperationKind, OperationRequest};

pub fn run(ctx: &Context, args: EnvArgs) -> Result<Outcome> {
    let requests: Vec<_> = args
        .environment
        .iter()
        .map(|env| OperationRequest::new(env, OperationKind::Backup))
        .collect();
    super::run_requests(ctx, "Backing up", &requests)
}
