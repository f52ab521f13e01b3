//! Wire schema and identity/metadata codecs for the distributed RPC transport.
//!
//! The generated client/server stubs live in [`wire`]; everything else here
//! is hand-written plumbing around them (the invocation id tuple, the
//! metadata codec, and the trailer helpers) that the rest of the workspace
//! builds on.

#![warn(missing_docs)]

mod identity;
mod metadata;
mod trailers;

pub use identity::DistributedInvocationId;
pub use metadata::{
    build_headers, parse_headers, ParsedHeaders, TraceId, AUTHORIZATION_KEY, ENGINE_VERSION_KEY, ENVIRONMENT_KEY,
    RELATED_ACTIVITY_ID_KEY, SENDER_KEY, TRACE_ID_KEY,
};
pub use trailers::{
    flag_is_set, invocation_id_mismatch_trailers, is_invocation_id_mismatch, is_unrecoverable_error, set_flag,
    unrecoverable_trailers, INVOCATION_ID_MISMATCH_KEY, IS_UNRECOVERABLE_ERROR_KEY,
};

/// Generated gRPC client/server stubs and message types.
///
/// `Envelope` wraps an opaque payload: the pip execution graph, result
/// records, and log entries are owned by the build scheduler, not by this
/// crate, so every RPC here just moves bytes.
pub mod wire {
    #![allow(missing_docs)]
    tonic::include_proto!("distrpc");
}

/// Every RPC message exchanged by this transport must be acceptable
/// regardless of size; the build scheduler, not this crate, decides what's
/// reasonable for a pip graph or a log batch. Applied to both the generated
/// clients (see `distrpc-client`'s façades) and the generated servers (see
/// `distrpc_server::ServerHost`'s callers).
pub const UNLIMITED_MESSAGE_SIZE: usize = usize::MAX;
