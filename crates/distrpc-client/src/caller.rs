//! Bounded-attempt RPC invocation with per-call deadlines, trailer-driven
//! termination, and cancellation.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use distrpc_error::{CallResult, CallState, ConnectionFailure, ConnectionFailureKind};
use distrpc_proto::{build_headers, DistributedInvocationId, TraceId};
use tonic::metadata::MetadataMap;
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::manager::ConnectionManager;

/// The per-attempt parameters a `call()` hands to the user-supplied RPC
/// closure.
///
/// The closure is responsible for building a [`tonic::Request`] from
/// [`CallOptions::metadata`] and [`CallOptions::remaining`] (e.g. via
/// `Request::set_timeout`); `call()` itself also races the attempt future
/// against both the remaining duration and `cancellation`, so a closure that
/// forgets to apply the deadline is still bounded from the outside.
pub struct CallOptions {
    /// Deadline for this attempt, relative to when the attempt loop started.
    pub deadline: Instant,
    /// Time remaining until `deadline`, computed when this attempt was built.
    pub remaining: Duration,
    /// Whether the underlying transport should block up to `remaining`
    /// waiting for the channel to become ready rather than failing fast on a
    /// transient disconnect.
    pub wait_for_ready: bool,
    /// Cancellation observed by this attempt's caller; also raced by `call()`
    /// itself around the whole attempt.
    pub cancellation: CancellationToken,
    /// Identity and trace metadata to attach to the outbound request.
    pub metadata: MetadataMap,
}

/// The future type returned by a user-supplied RPC closure.
///
/// Carries an explicit lifetime rather than defaulting to `'static`: a
/// streaming façade's closure borrows its own stream slot out of `&self`
/// (see [`crate::facade`]), and a `'static` bound would forbid that borrow
/// from ever coercing to this trait object.
pub type AttemptFuture<'a, R> = Pin<Box<dyn Future<Output = Result<tonic::Response<R>, tonic::Status>> + Send + 'a>>;

/// Drives a user-supplied RPC closure with deadlines, retries, and trailer
/// inspection.
///
/// Stateless with respect to individual calls: every decision it makes reads
/// state held by the [`ConnectionManager`] it was built over (whether the
/// peer is attached, whether shutdown has been initiated) rather than
/// anything local to one `call()` invocation.
pub struct RetryingCaller {
    invocation_id: DistributedInvocationId,
    sender: String,
    token: Option<String>,
}

impl RetryingCaller {
    /// Build a caller that stamps `invocation_id`/`sender`/`token` onto every
    /// call it drives.
    pub fn new(invocation_id: DistributedInvocationId, sender: impl Into<String>, token: Option<String>) -> Self {
        RetryingCaller {
            invocation_id,
            sender,
            token,
        }
    }

    /// Drive `op` against `manager`'s channel with bounded retries.
    ///
    /// `op` is invoked at most `manager`'s configured `max_attempts` times,
    /// strictly sequentially; cancellation observed between or during
    /// attempts aborts the loop immediately. The response payload itself is
    /// not returned here — callers that need it should stash it from inside
    /// `op` (see [`crate::facade`] for the pattern) — only the structured
    /// outcome is.
    pub async fn call<'a, R, F>(
        &self,
        manager: &ConnectionManager,
        mut op: F,
        description: &str,
        cancellation: &CancellationToken,
        wait_for_connection: bool,
    ) -> CallResult
    where
        F: FnMut(CallOptions) -> AttemptFuture<'a, R>,
    {
        let config = manager.config();
        let channel = manager.channel();

        let mut wait_for_connection_duration = Duration::ZERO;
        if wait_for_connection {
            let started = Instant::now();
            let result = channel.connect(config.worker_attach_timeout).await;
            wait_for_connection_duration = started.elapsed();
            if result.is_err() {
                debug!(description, elapsed = ?wait_for_connection_duration, "gave up waiting for a connection before the call");
                return CallResult {
                    state: CallState::Cancelled,
                    attempts: 1,
                    call_duration: Duration::ZERO,
                    wait_for_connection_duration,
                    last_failure: None,
                };
            }
        }

        let trace_id = TraceId::generate();
        let metadata_template = build_headers(&self.invocation_id, trace_id, &self.sender, self.token.as_deref());

        let call_started = Instant::now();
        let mut last_failure: Option<ConnectionFailure> = None;
        let mut timeouts: u32 = 0;
        let mut state = CallState::Failed;
        let mut attempts: u32 = 0;

        for attempt in 1..=config.max_attempts {
            attempts = attempt;

            if cancellation.is_cancelled() {
                state = CallState::Cancelled;
                break;
            }

            let deadline = Instant::now() + config.call_timeout;
            let options = CallOptions {
                deadline,
                remaining: config.call_timeout,
                wait_for_ready: true,
                cancellation: cancellation.clone(),
                metadata: metadata_template.clone(),
            };

            let attempt_future = op(options);
            let outcome = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    state = CallState::Cancelled;
                    break;
                }
                result = tokio::time::timeout(config.call_timeout, attempt_future) => result,
            };

            let status = match outcome {
                Ok(Ok(_response)) => {
                    state = CallState::Succeeded;
                    last_failure = None;
                    break;
                }
                Ok(Err(status)) => status,
                Err(_elapsed) => {
                    timeouts += 1;
                    debug!(description, attempt, "call attempt timed out");
                    last_failure = Some(ConnectionFailure::new(
                        ConnectionFailureKind::CallDeadlineExceeded,
                        format!("{description}: attempt {attempt} exceeded {:?}", config.call_timeout),
                    ));
                    continue;
                }
            };

            if status.code() == tonic::Code::Cancelled {
                state = CallState::Cancelled;
                break;
            }

            if status.code() == tonic::Code::DeadlineExceeded {
                timeouts += 1;
                last_failure = Some(ConnectionFailure::new(
                    ConnectionFailureKind::CallDeadlineExceeded,
                    format!("{description}: attempt {attempt}: {status}"),
                ));
                continue;
            }

            if distrpc_proto::is_unrecoverable_error(status.metadata()) {
                warn!(description, attempt, %status, "peer reported an unrecoverable failure");
                let failure = ConnectionFailure::new(
                    ConnectionFailureKind::UnrecoverableFailure,
                    format!("{description}: {status}"),
                );
                manager.failure_emitter().emit(failure.clone());
                last_failure = Some(failure);
                state = CallState::Failed;
                break;
            }

            if status.code() == tonic::Code::InvalidArgument && distrpc_proto::is_invocation_id_mismatch(status.metadata()) {
                last_failure = Some(ConnectionFailure::new(
                    ConnectionFailureKind::UnrecoverableFailure,
                    format!("{description}: invocation id mismatch: {status}"),
                ));
                state = CallState::Failed;
                break;
            }

            debug!(description, attempt, %status, "call attempt failed, retrying");
            last_failure = Some(ConnectionFailure::new(
                ConnectionFailureKind::TransientRpc,
                format!("{description}: {status}"),
            ));
            state = CallState::Failed;

            if manager.is_shutting_down() {
                break;
            }
        }

        if state != CallState::Succeeded && manager.is_attached() && timeouts >= config.max_attempts {
            warn!(description, attempts, "peer presumed dead after repeated call-deadline timeouts");
            manager.failure_emitter().emit(ConnectionFailure::new(
                ConnectionFailureKind::CallDeadlineExceeded,
                format!("{description}: {attempts} consecutive deadline-exceeded attempts"),
            ));
        }

        CallResult {
            state,
            attempts: attempts.max(1),
            call_duration: call_started.elapsed(),
            wait_for_connection_duration,
            last_failure,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ClientConfig;
    use distrpc_transport::Credentials;

    fn test_config() -> ClientConfig {
        ClientConfig {
            max_attempts: 3,
            call_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn test_caller() -> RetryingCaller {
        RetryingCaller::new(DistributedInvocationId::new("act", "env", "1.0"), "test-host", None)
    }

    fn ok_response() -> AttemptFuture<'static, ()> {
        Box::pin(async { Ok(tonic::Response::new(())) })
    }

    fn err_response(status: tonic::Status) -> AttemptFuture<'static, ()> {
        Box::pin(async move { Err(status) })
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let invocation_id = DistributedInvocationId::new("act", "env", "1.0");
        let manager =
            ConnectionManager::new("127.0.0.1:1", test_config(), &invocation_id, &Credentials::Insecure).unwrap();
        let caller = test_caller();
        let cancellation = CancellationToken::new();

        let result = caller
            .call(&manager, |_opts| ok_response(), "test-call", &cancellation, false)
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert!(result.last_failure.is_none());
        manager.close().await;
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let invocation_id = DistributedInvocationId::new("act", "env", "1.0");
        let manager =
            ConnectionManager::new("127.0.0.1:1", test_config(), &invocation_id, &Credentials::Insecure).unwrap();
        let caller = test_caller();
        let cancellation = CancellationToken::new();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));

        let result = caller
            .call(
                &manager,
                |_opts| {
                    let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        err_response(tonic::Status::unavailable("not yet"))
                    } else {
                        ok_response()
                    }
                },
                "test-call",
                &cancellation,
                false,
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        manager.close().await;
    }

    #[tokio::test]
    async fn unrecoverable_trailer_stops_retrying_and_emits_failure() {
        let invocation_id = DistributedInvocationId::new("act", "env", "1.0");
        let manager =
            ConnectionManager::new("127.0.0.1:1", test_config(), &invocation_id, &Credentials::Insecure).unwrap();
        let caller = test_caller();
        let cancellation = CancellationToken::new();
        let mut subscriber = manager.failure_subscriber();

        let mut status = tonic::Status::internal("fatal");
        *status.metadata_mut() = distrpc_proto::unrecoverable_trailers();

        let result = caller
            .call(&manager, move |_opts| err_response(status.clone()), "test-call", &cancellation, false)
            .await;

        assert_eq!(result.state, CallState::Failed);
        assert_eq!(result.attempts, 1);
        let failure = subscriber.try_get().expect("failure event should have fired");
        assert_eq!(failure.kind, ConnectionFailureKind::UnrecoverableFailure);
        manager.close().await;
    }

    #[tokio::test]
    async fn invocation_id_mismatch_stops_retrying_without_a_manager_level_event() {
        let invocation_id = DistributedInvocationId::new("act", "env", "1.0");
        let manager =
            ConnectionManager::new("127.0.0.1:1", test_config(), &invocation_id, &Credentials::Insecure).unwrap();
        let caller = test_caller();
        let cancellation = CancellationToken::new();

        let mut status = tonic::Status::invalid_argument("mismatch");
        *status.metadata_mut() = distrpc_proto::invocation_id_mismatch_trailers();

        let result = caller
            .call(&manager, move |_opts| err_response(status.clone()), "test-call", &cancellation, false)
            .await;

        assert_eq!(result.state, CallState::Failed);
        assert_eq!(result.attempts, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn cancelled_on_first_attempt_makes_no_further_attempts() {
        let invocation_id = DistributedInvocationId::new("act", "env", "1.0");
        let manager =
            ConnectionManager::new("127.0.0.1:1", test_config(), &invocation_id, &Credentials::Insecure).unwrap();
        let caller = test_caller();
        let cancellation = CancellationToken::new();

        let result = caller
            .call(
                &manager,
                |_opts| err_response(tonic::Status::cancelled("caller gave up")),
                "test-call",
                &cancellation,
                false,
            )
            .await;

        assert_eq!(result.state, CallState::Cancelled);
        assert_eq!(result.attempts, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn max_attempts_one_returns_first_failure_as_is() {
        let invocation_id = DistributedInvocationId::new("act", "env", "1.0");
        let config = ClientConfig {
            max_attempts: 1,
            call_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let manager = ConnectionManager::new("127.0.0.1:1", config, &invocation_id, &Credentials::Insecure).unwrap();
        let caller = test_caller();
        let cancellation = CancellationToken::new();

        let result = caller
            .call(
                &manager,
                |_opts| err_response(tonic::Status::unavailable("down")),
                "test-call",
                &cancellation,
                false,
            )
            .await;

        assert_eq!(result.state, CallState::Failed);
        assert_eq!(result.attempts, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn wait_for_connection_failure_reports_cancelled() {
        let invocation_id = DistributedInvocationId::new("act", "env", "1.0");
        let config = ClientConfig {
            worker_attach_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let manager = ConnectionManager::new("127.0.0.1:1", config, &invocation_id, &Credentials::Insecure).unwrap();
        let caller = test_caller();
        let cancellation = CancellationToken::new();

        let result = caller
            .call(&manager, |_opts| ok_response(), "test-call", &cancellation, true)
            .await;

        assert_eq!(result.state, CallState::Cancelled);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.call_duration, Duration::ZERO);
        assert!(result.wait_for_connection_duration >= Duration::from_millis(40));
        manager.close().await;
    }
}
