use super::Outcome;
use crate::Context;
use crate::cli::EnvArgs;
use crate::ui;
use anyhow::{Context as _, Result};

pub fn run(ctx: &Context, args: EnvArgs) -> Result<Outcome> {
    let orchestrator = super::orchestrator(ctx);

    let mut listings = Vec::new();
    for env in &args.environment {
        let artifacts = orchestrator
            .list_backups(env)
            .with_context(|| format!("Could not list backups of {env}"))?;
        listings.push((env.clone(), artifacts));
    }

    if ctx.json {
        let all: Vec<_> = listings.into_iter().flat_map(|(_, a)| a).collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
    } else {
        for (env, artifacts) in &listings {
            ui::backups(env, artifacts);
        }
    }
    Ok(Outcome::Success)
}
