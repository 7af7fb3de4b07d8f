//! # Fleetkit
//!
//! Operation orchestration for containerized database fleets.
//!
//! Given an environment's declared desired state and an operation request,
//! fleetkit computes the steps needed, applies them node by node, enforces
//! the safety gates around destructive work, and reports a structured
//! result per node.
//!
//! ## Operations
//!
//! - **Deploy**: converge every node onto the desired image, config, auth,
//!   and replica-set membership ([`converge`])
//! - **Backup**: consistent dump, compression, transfer into an
//!   [`ArtifactStore`], retention rotation ([`backup`], [`retention`])
//! - **Restore**: validated artifact, confirmation gate, phased restore with
//!   verification ([`restore`])
//! - **Maintenance**: read-only probe battery with partial reports ([`status`])
//!
//! ## Collaborator Traits
//!
//! Nothing here talks to a network directly. Engines reach nodes through
//! traits supplied by the caller:
//!
//! - [`RemoteExec`]: run commands and move files on a node
//! - [`DatabaseClient`]: database primitives (dump, restore, users, replica set)
//! - [`ContainerRuntime`]: container lifecycle
//! - [`SecretResolver`]: credential references to plaintext, at the moment of use
//! - [`InventorySource`]: where environments are declared
//!
//! ## Example
//!
//! ```ignore
//! use fleetkit::{InventoryResolver, OperationKind, OperationRequest, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(inventory, backends, store, Settings::default());
//! let result = orchestrator.run(&OperationRequest::new(
//!     "staging",
//!     OperationKind::Deploy { dry_run: true },
//! ))?;
//! for node in &result.nodes {
//!     println!("{}: {} {}", node.node, node.status, node.message);
//! }
//! ```

pub mod backend;
pub mod backup;
pub mod cancel;
pub mod clock;
pub mod converge;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod orchestrator;
pub mod outcome;
pub mod pool;
pub mod request;
pub mod restore;
pub mod retention;
pub mod retry;
pub mod status;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use backend::{
    Backends, CommandOutput, ContainerRuntime, ContainerSpec, Credentials, DatabaseClient,
    DbConn, DumpScope, RemoteExec, Secret, SecretResolver, shell_quote,
};
pub use cancel::CancellationToken;
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Error, ErrorCategory, Result};
pub use executor::{CallPolicy, NodeExecutor, UnitOfWork};
pub use inventory::{InventoryResolver, InventorySource, StaticInventory};
pub use orchestrator::{Orchestrator, Settings};
pub use outcome::{Check, CheckStatus, NodeOutcome, NodeStatus, OperationName, OperationResult};
pub use request::{ConfirmationToken, OperationKind, OperationRequest, RestoreOptions};
pub use retry::RetryConfig;
pub use store::{ArtifactStore, BackupArtifact, LocalStore};
pub use types::{
    AuthPolicy, BackupPolicy, ContainerState, DesiredConfig, Environment, Health, Node, NodeRole,
    ReplicaRole, ReplicaSetSpec, ReplicaStatus, StorageParams,
};
