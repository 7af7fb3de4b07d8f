//! Credential references resolved from the local environment.
//!
//! Supported references:
//! - `env:NAME` - value of environment variable `NAME`
//! - `file:PATH` - contents of `PATH`, trailing newline trimmed
//! - `path:PATH` - `PATH` itself with `~` expanded (SSH identity files)

use fleetkit::{Error, Result, Secret, SecretResolver};
use std::fs;

#[derive(Debug, Default)]
pub struct LocalSecrets;

impl SecretResolver for LocalSecrets {
    fn resolve(&self, reference: &str) -> Result<Secret> {
        let (scheme, target) = reference
            .split_once(':')
            .ok_or_else(|| {
                Error::not_found(format!(
                    "secret '{reference}' (expected env:, file:, or path:)"
                ))
            })?;

        match scheme {
            "env" => std::env::var(target)
                .map(Secret::new)
                .map_err(|_| Error::not_found(format!("secret '{reference}' (variable not set)"))),
            "file" => {
                let path = shellexpand::tilde(target);
                let contents = fs::read_to_string(path.as_ref())
                    .map_err(|e| Error::not_found(format!("secret '{reference}' ({e})")))?;
                Ok(Secret::new(contents.trim_end_matches(['\r', '\n'])))
            }
            "path" => Ok(Secret::new(shellexpand::tilde(target).into_owned())),
            _ => Err(Error::not_found(format!(
                "secret '{reference}' (unknown scheme '{scheme}')"
            ))),
        }
    }
}
