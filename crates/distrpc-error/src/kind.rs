//! Classification of errors arising from calls on the transport layer.

/// A coarse classification of an error from this crate, suitable for
/// programmatic handling.
///
/// Callers should match on [`ErrorKind`] rather than on the concrete error
/// type returned by a given function: the concrete type may grow variants,
/// but its `.kind()` will keep meaning the same thing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A non-deadline RPC error that is safe to retry.
    TransientRpc,
    /// The per-call deadline was hit.
    DeadlineExceeded,
    /// The caller cancelled the call, or the channel was shut down under it.
    Cancelled,
    /// The peer rejected the call because its invocation id did not match
    /// ours. Retrying this call is pointless; other calls on the same
    /// channel may still succeed.
    InvocationIdMismatch,
    /// The peer told us (via trailer) that this failure is unrecoverable.
    Unrecoverable,
    /// The connection monitor gave up: the channel spent too long
    /// reconnecting, or failed to leave the idle state.
    ConnectionLost,
    /// Authentication failed (bad or missing token).
    Auth,
    /// A bug in this crate or its caller.
    Internal,
}

/// A type that can report its [`ErrorKind`].
pub trait HasKind {
    /// Return the kind of error that this is.
    fn kind(&self) -> ErrorKind;
}

impl HasKind for std::convert::Infallible {
    fn kind(&self) -> ErrorKind {
        match *self {}
    }
}
