//! Owns one [`Channel`], its background monitor task, and the lifecycle
//! flags a peer connection is built around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use distrpc_error::{ConnectionFailure, ConnectionFailureKind};
use distrpc_proto::DistributedInvocationId;
use distrpc_transport::{Channel, ChannelError, ChannelState, Credentials};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Span};

use crate::config::ClientConfig;
use crate::failure::{failure_channel, FailureEmitter, FailureSubscriber};

/// Owns one [`Channel`] to a single peer, its background monitor task, and
/// the `attached`/`exitRequested`/`shutdownInitiated` lifecycle flags.
///
/// A manager is created once per peer location and closed jointly with its
/// channel. It never reconnects after [`ConnectionManager::close`], and it
/// stops initiating reconnects as soon as [`ConnectionManager::ready_for_exit`]
/// has been called.
pub struct ConnectionManager {
    channel: Arc<Channel>,
    config: ClientConfig,
    attached: Arc<AtomicBool>,
    exit_requested: Arc<AtomicBool>,
    shutdown_initiated: Arc<AtomicBool>,
    failure_emitter: FailureEmitter,
    failure_subscriber: FailureSubscriber,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl ConnectionManager {
    /// Build a channel to `target` under `credentials` and start the
    /// background monitor loop.
    ///
    /// `invocation_id` is only used for diagnostics here; it is the Retrying
    /// Caller, not the manager, that stamps it onto outbound calls.
    pub fn new(
        target: impl Into<String>,
        config: ClientConfig,
        invocation_id: &DistributedInvocationId,
        credentials: &Credentials,
    ) -> Result<Self, ChannelError> {
        let target = target.into();
        let span = tracing::info_span!("connection_manager", peer = %target, invocation_id = %invocation_id);
        let channel = Arc::new(Channel::new(target, &config.channel_config(), credentials)?);
        let (failure_emitter, failure_subscriber) = failure_channel();

        let attached = Arc::new(AtomicBool::new(false));
        let exit_requested = Arc::new(AtomicBool::new(false));
        let shutdown_initiated = Arc::new(AtomicBool::new(false));

        let monitor = {
            let channel = channel.clone();
            let attached = attached.clone();
            let exit_requested = exit_requested.clone();
            let emitter = failure_emitter.clone();
            let config = config.clone();
            let span = span.clone();
            tokio::spawn(async move {
                monitor_loop(channel, config, attached, exit_requested, emitter, span).await;
            })
        };

        Ok(ConnectionManager {
            channel,
            config,
            attached,
            exit_requested,
            shutdown_initiated,
            failure_emitter,
            failure_subscriber,
            monitor: std::sync::Mutex::new(Some(monitor)),
            span,
        })
    }

    /// The channel this manager owns.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// A fresh handle that will receive this manager's single failure event,
    /// if and when it fires.
    pub fn failure_subscriber(&self) -> FailureSubscriber {
        self.failure_subscriber.clone()
    }

    /// The emitting half of this manager's failure broadcaster.
    ///
    /// Used by the Retrying Caller to raise [`ConnectionFailureKind::CallDeadlineExceeded`]
    /// and [`ConnectionFailureKind::UnrecoverableFailure`], which (unlike
    /// [`ConnectionFailureKind::ReconnectionTimeout`]) are call-site
    /// decisions rather than monitor-loop decisions.
    pub(crate) fn failure_emitter(&self) -> &FailureEmitter {
        &self.failure_emitter
    }

    /// The tunables this manager was constructed with.
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// True once a successful attach has been recorded. Never reverts.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Record that attachment succeeded. Idempotent; only the first call has
    /// any effect on the monitor's behavior.
    pub fn on_attachment_completed(&self) {
        if !self.attached.swap(true, Ordering::SeqCst) {
            info!(parent: &self.span, "peer attached");
        }
    }

    /// Signal that no further RPCs are expected, so a subsequent `Idle`
    /// transition is not misread as an unexpected disconnect.
    pub fn ready_for_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    /// True if [`ConnectionManager::close`] has already been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Shut the channel down and await the monitor task. Idempotent.
    pub async fn close(&self) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channel.shutdown();
        let handle = self.monitor.lock().expect("monitor mutex poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(parent: &self.span, error = %e, "monitor task panicked");
            }
        }
    }

    /// Attempt up to `max_attempts` synchronous connects, stopping early if
    /// the channel reaches a non-recoverable state in between attempts.
    pub(crate) async fn try_reconnect(&self) -> bool {
        try_reconnect(&self.channel, &self.config).await
    }
}

/// Attempt up to `config.max_attempts` synchronous connects. Re-inspects
/// state after each failure and abandons early if the channel has become
/// non-recoverable (`Idle` or `Shutdown`) in the meantime. Returns `true` as
/// soon as any attempt succeeds.
async fn try_reconnect(channel: &Channel, config: &ClientConfig) -> bool {
    for attempt in 1..=config.max_attempts {
        if channel.connect(config.call_timeout).await.is_ok() {
            return true;
        }
        if channel.state().is_non_recoverable() {
            debug!(attempt, "abandoning reconnect: channel entered a non-recoverable state");
            return false;
        }
        if attempt < config.max_attempts {
            let jitter_ms = rand::thread_rng().gen_range(50..=250);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }
    }
    false
}

/// Runs until the channel reaches `Shutdown` or an unrecoverable decision is
/// made, watching for reconnect timeouts and relaying the single failure a
/// peer ever emits.
async fn monitor_loop(
    channel: Arc<Channel>,
    config: ClientConfig,
    attached: Arc<AtomicBool>,
    exit_requested: Arc<AtomicBool>,
    emitter: FailureEmitter,
    span: Span,
) {
    let _enter = span.enter();
    let mut reconnecting_since: Option<Instant> = None;

    loop {
        let last = channel.state();
        if last == ChannelState::Shutdown {
            debug!("monitor exiting: channel already shut down");
            return;
        }
        let observed = channel.wait_for_state_change(last).await;

        if observed == ChannelState::Shutdown {
            debug!("monitor exiting: channel shut down");
            return;
        }

        let is_reconnecting = matches!(observed, ChannelState::Connecting | ChannelState::TransientFailure)
            && attached.load(Ordering::SeqCst);
        if is_reconnecting {
            reconnecting_since.get_or_insert_with(Instant::now);
        } else {
            reconnecting_since = None;
        }

        if let Some(since) = reconnecting_since {
            if since.elapsed() >= config.distribution_connect_timeout {
                warn!("reconnection watchdog elapsed; giving up on this peer");
                emitter.emit(ConnectionFailure::new(
                    ConnectionFailureKind::ReconnectionTimeout,
                    format!("no successful reconnect within {:?}", config.distribution_connect_timeout),
                ));
                return;
            }
        }

        if observed == ChannelState::Idle && !exit_requested.load(Ordering::SeqCst) {
            if !try_reconnect(&channel, &config).await {
                warn!("reconnect attempts from idle state exhausted");
                emitter.emit(ConnectionFailure::new(
                    ConnectionFailureKind::ReconnectionTimeout,
                    "reconnect attempts from the idle state were exhausted",
                ));
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use distrpc_transport::ChannelConfig;

    fn test_config() -> ClientConfig {
        ClientConfig {
            distribution_connect_timeout: Duration::from_millis(300),
            max_attempts: 2,
            call_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_joins_the_monitor() {
        let invocation_id = DistributedInvocationId::new("a", "b", "c");
        let manager =
            ConnectionManager::new("127.0.0.1:1", test_config(), &invocation_id, &Credentials::Insecure).unwrap();
        manager.close().await;
        manager.close().await;
        assert!(manager.is_shutting_down());
        assert_eq!(manager.channel().state(), ChannelState::Shutdown);
    }

    #[tokio::test]
    async fn manager_with_ready_for_exit_closes_cleanly_without_a_failure_event() {
        // The channel never leaves Idle in this test, so the monitor just
        // sits in wait_for_state_change; this checks close() can still tear
        // it down cleanly and that no failure fired along the way.
        let invocation_id = DistributedInvocationId::new("a", "b", "c");
        let manager =
            ConnectionManager::new("127.0.0.1:1", test_config(), &invocation_id, &Credentials::Insecure).unwrap();
        manager.ready_for_exit();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.failure_subscriber().try_get().is_none());
        manager.close().await;
    }

    #[tokio::test]
    async fn try_reconnect_gives_up_after_max_attempts_against_unroutable_peer() {
        let channel = Channel::new("127.0.0.1:1", &ChannelConfig::default(), &Credentials::Insecure).unwrap();
        let config = test_config();
        let succeeded = try_reconnect(&channel, &config).await;
        assert!(!succeeded);
    }
}
