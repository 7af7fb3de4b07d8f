//! Adapters from fleetkit's collaborator traits to real infrastructure.

mod docker;
mod mongo;
mod secrets;
mod ssh;

pub use docker::DockerRuntime;
pub use mongo::MongoClient;
pub use secrets::LocalSecrets;
pub use ssh::{SshOptions, SshTransport};

use fleetkit::{Backends, RemoteExec, SecretResolver};
use std::sync::Arc;

/// Wire ssh, docker, mongo tooling, and local secrets together.
pub fn backends(ssh: SshOptions) -> Backends {
    let secrets: Arc<dyn SecretResolver> = Arc::new(LocalSecrets);
    let remote: Arc<dyn RemoteExec> = Arc::new(SshTransport::new(ssh, Arc::clone(&secrets)));
    Backends {
        database: Arc::new(MongoClient::new(Arc::clone(&remote))),
        containers: Arc::new(DockerRuntime::new(Arc::clone(&remote))),
        remote,
        secrets,
    }
}
