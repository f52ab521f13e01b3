//! Shared error taxonomy, connection-failure records, and call outcomes for
//! the distributed RPC transport layer.
//!
//! This crate has no transport-specific dependencies on purpose: every other
//! crate in the workspace (`distrpc-proto`, `distrpc-transport`,
//! `distrpc-client`, `distrpc-server`) depends on it, so it must not depend
//! on any of them.

#![warn(missing_docs)]

mod failure;
mod internal;
mod kind;
mod result;

pub use failure::{ConnectionFailure, ConnectionFailureKind};
pub use internal::InternalError;
pub use kind::{ErrorKind, HasKind};
pub use result::{CallResult, CallState};

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn internal_error_reports_its_kind() {
        let e = internal!("no cells left, got {}", 0);
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert!(e.to_string().contains("no cells left, got 0"));
    }

    #[test]
    fn call_result_display_includes_failure() {
        let failure = ConnectionFailure::new(ConnectionFailureKind::ReconnectionTimeout, "gave up after 5m");
        let result = CallResult {
            state: CallState::Failed,
            attempts: 3,
            call_duration: Duration::from_secs(1),
            wait_for_connection_duration: Duration::ZERO,
            last_failure: Some(failure),
        };
        assert!(!result.is_success());
        let rendered = result.to_string();
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("gave up after 5m"));
    }

    #[test]
    fn call_result_success_has_no_failure_attached_when_clean() {
        let result = CallResult {
            state: CallState::Succeeded,
            attempts: 1,
            call_duration: Duration::from_millis(50),
            wait_for_connection_duration: Duration::ZERO,
            last_failure: None,
        };
        assert!(result.is_success());
        assert!(!result.to_string().contains("last failure"));
    }
}
