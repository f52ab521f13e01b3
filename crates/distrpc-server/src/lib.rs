//! The inbound side of the distributed RPC transport: a call interceptor
//! that validates identity and authentication, and a server host that binds
//! service handlers, enforces message-size limits, and manages TLS/mTLS and
//! graceful shutdown.
//!
//! This crate is symmetrical with [`distrpc_client`]: where that crate
//! drives outbound calls through a Connection Manager and Retrying Caller,
//! this one accepts them, tags them with sender/trace identity, and hands
//! them to whatever worker/orchestrator service layer the embedding process
//! provides.

#![warn(missing_docs)]

mod dispatch;
mod host;
mod interceptor;

pub use dispatch::{dispatch, guarded};
pub use host::{ServerConfig, ServerHost, ServerHostError, ShutdownHandle, UNLIMITED_MESSAGE_SIZE};
pub use interceptor::{parsed_headers, InterceptorConfig, ServerInterceptor};
