//! The single-shot connection failure event emitted by a Connection Manager.

use std::fmt;

/// The kind of problem that made a Connection Manager give up on its peer.
///
/// A manager emits at most one of these before it terminates; see
/// [`crate::ErrorKind::ConnectionLost`] and [`crate::ErrorKind::Unrecoverable`]
/// for how these map onto the caller-visible error taxonomy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionFailureKind {
    /// A single attempt failed with a plain, retryable RPC error (not a
    /// deadline, not a trailer-flagged rejection). Recorded as the call's
    /// `lastFailure` while the attempt loop keeps retrying; never emitted as
    /// a manager-level failure event on its own.
    TransientRpc,
    /// A call's deadline was exceeded `MaxAttempts` times in a row while the
    /// peer was attached; it is presumed dead.
    CallDeadlineExceeded,
    /// The reconnection watchdog fired: the channel spent too long cycling
    /// through `Connecting`/`TransientFailure`, or a reconnect attempt from
    /// `Idle` failed outright.
    ReconnectionTimeout,
    /// The peer never became ready within `WorkerAttachTimeout`.
    AttachmentTimeout,
    /// A remote pip exceeded its allotted time (surfaced by the scheduler
    /// through this channel's failure event, not generated internally).
    RemotePipTimeout,
    /// The peer told us, via trailer, that a failure cannot be retried.
    UnrecoverableFailure,
}

impl fmt::Display for ConnectionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionFailureKind::TransientRpc => "transient rpc error",
            ConnectionFailureKind::CallDeadlineExceeded => "call deadline exceeded repeatedly",
            ConnectionFailureKind::ReconnectionTimeout => "reconnection timed out",
            ConnectionFailureKind::AttachmentTimeout => "attachment timed out",
            ConnectionFailureKind::RemotePipTimeout => "remote pip timed out",
            ConnectionFailureKind::UnrecoverableFailure => "unrecoverable failure reported by peer",
        };
        f.write_str(s)
    }
}

/// A single, terminal failure reported by a Connection Manager.
///
/// Subscribers interpret `kind` to decide whether to retry elsewhere, mark
/// the worker lost, or tear down the whole build; `details` is a
/// human-readable elaboration meant for logs, not for programmatic matching.
#[derive(Debug, Clone)]
pub struct ConnectionFailure {
    /// What kind of failure this was.
    pub kind: ConnectionFailureKind,
    /// Free-form detail, e.g. the last RPC status or the elapsed watchdog
    /// duration.
    pub details: String,
}

impl ConnectionFailure {
    /// Construct a new failure record.
    pub fn new(kind: ConnectionFailureKind, details: impl Into<String>) -> Self {
        ConnectionFailure {
            kind,
            details: details.into(),
        }
    }
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.details)
    }
}
