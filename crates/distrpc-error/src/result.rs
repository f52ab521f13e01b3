//! The outcome of a single `call()` invocation on a Retrying Caller.

use std::fmt;
use std::time::Duration;

use crate::ConnectionFailure;

/// The terminal state of one `call()` invocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallState {
    /// The call completed successfully on some attempt.
    Succeeded,
    /// Every attempt failed, or a failure was classified as non-retryable.
    Failed,
    /// The caller's cancellation token fired, or the channel was shut down.
    Cancelled,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallState::Succeeded => "succeeded",
            CallState::Failed => "failed",
            CallState::Cancelled => "cancelled",
        })
    }
}

/// The structured outcome of one `call()`, returned in place of throwing
/// across the façade boundary.
#[derive(Debug, Clone)]
pub struct CallResult {
    /// How the call ended.
    pub state: CallState,
    /// How many attempts were made; always `>= 1`.
    pub attempts: u32,
    /// Wall-clock time spent in the attempt loop itself.
    pub call_duration: Duration,
    /// Wall-clock time spent in the optional pre-call `connect()`, if
    /// `wait_for_connection` was requested.
    pub wait_for_connection_duration: Duration,
    /// The last recoverable failure seen, if any attempt failed before the
    /// call's terminal state was reached.
    pub last_failure: Option<ConnectionFailure>,
}

impl CallResult {
    /// True if the call eventually succeeded.
    pub fn is_success(&self) -> bool {
        self.state == CallState::Succeeded
    }
}

impl fmt::Display for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s) in {:?} (waited {:?} for connection)",
            self.state, self.attempts, self.call_duration, self.wait_for_connection_duration
        )?;
        if let Some(failure) = &self.last_failure {
            write!(f, "; last failure: {failure}")?;
        }
        Ok(())
    }
}
