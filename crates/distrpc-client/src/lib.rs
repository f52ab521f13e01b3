//! Connection management, retrying RPC calls, and typed client façades for
//! the distributed RPC transport layer.
//!
//! This is the orchestrator/worker-facing half of the transport: it owns
//! the long-lived peer connection (the Connection Manager), drives bounded
//! retries over it (the Retrying Caller), and exposes the two directions of
//! traffic (the Client Façades) that a build orchestrator and its workers
//! actually call.

#![warn(missing_docs)]

mod cancellation;
mod caller;
mod config;
mod facade;
mod failure;
mod manager;

pub use cancellation::CancellationToken;
pub use caller::{AttemptFuture, CallOptions, RetryingCaller};
pub use config::ClientConfig;
pub use facade::{OrchestratorFacade, WorkerFacade};
pub use failure::{failure_channel, FailureEmitter, FailureSubscriber};
pub use manager::ConnectionManager;
