//! A single underlying transport to one peer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, warn};

use crate::credentials::Credentials;

/// How long an idle HTTP/2 connection is kept alive by the framework.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);
/// How long to wait for a keepalive ack before treating the connection as dead.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connectivity of a [`Channel`].
///
/// `Idle` and `Shutdown` are "non-recoverable" for reconnect purposes: a
/// Connection Manager never retries out of `Shutdown`, and treats `Idle`
/// (once attached) the same way it treats a failed reconnect attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// No connection attempt is in progress and none has succeeded yet.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// The channel can currently carry RPCs.
    Ready,
    /// The last connection attempt failed; a retry/backoff is implied.
    TransientFailure,
    /// Terminal: the channel has been shut down and will never reconnect.
    Shutdown,
}

impl ChannelState {
    /// True for the two states a Connection Manager will not reconnect out of.
    pub fn is_non_recoverable(self) -> bool {
        matches!(self, ChannelState::Idle | ChannelState::Shutdown)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Ready => "ready",
            ChannelState::TransientFailure => "transient_failure",
            ChannelState::Shutdown => "shutdown",
        })
    }
}

/// Tunables controlling how a [`Channel`] is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Whether HTTP/2 keepalive pings are sent while the channel is idle.
    pub keepalive_enabled: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig { keepalive_enabled: true }
    }
}

/// Error resolving or connecting a [`Channel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The endpoint configuration (URI, TLS material) was invalid.
    #[error("invalid channel configuration for {target}: {source}")]
    Configuration {
        /// The peer address the channel was being built for.
        target: String,
        /// Underlying error from the transport library.
        #[source]
        source: tonic::transport::Error,
    },
    /// The connection attempt did not complete before its deadline.
    #[error("connect to {target} did not complete within {deadline:?}")]
    DeadlineExceeded {
        /// The peer address the channel was connecting to.
        target: String,
        /// The deadline that elapsed.
        deadline: Duration,
    },
    /// The connection attempt failed.
    #[error("failed to connect to {target}: {source}")]
    ConnectFailed {
        /// The peer address the channel was connecting to.
        target: String,
        /// Underlying error from the transport library.
        #[source]
        source: tonic::transport::Error,
    },
    /// `connect` was called on a channel that has already been shut down.
    #[error("channel to {target} is shut down")]
    ShuttingDown {
        /// The peer address this channel was for.
        target: String,
    },
}

/// A single underlying HTTP/2 transport to one peer.
///
/// `tonic`'s [`tonic::transport::Channel`] already reconnects transparently
/// underneath a clone, but exposes no introspectable connectivity state. This
/// type layers that state on top, synthesizing it from the outcome of its own
/// `connect` attempts, so a [Connection Manager][distrpc-client] can drive a
/// reconnect/retry monitor loop off observable state transitions.
pub struct Channel {
    target: String,
    endpoint: Endpoint,
    state_tx: watch::Sender<ChannelState>,
    inner: Mutex<Option<tonic::transport::Channel>>,
    shut_down: AtomicBool,
}

impl Channel {
    /// Build a channel to `target` (a `host:port` pair), configuring
    /// keepalive, message size, and TLS from `config`/`credentials`. Does not
    /// connect; the channel starts in [`ChannelState::Idle`].
    pub fn new(target: impl Into<String>, config: &ChannelConfig, credentials: &Credentials) -> Result<Self, ChannelError> {
        let target = target.into();
        let scheme = if credentials.is_encrypted() { "https" } else { "http" };
        let uri = format!("{scheme}://{target}");

        let mut endpoint = Endpoint::from_shared(uri).map_err(|source| ChannelError::Configuration {
            target: target.clone(),
            source,
        })?;

        endpoint = endpoint
            .tcp_keepalive(config.keepalive_enabled.then_some(KEEPALIVE_INTERVAL))
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(config.keepalive_enabled);

        if let Credentials::Tls(tls) = credentials {
            let identity = Identity::from_pem(&tls.cert_pem, &tls.key_pem);
            let tls_config = ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(&tls.root_pem))
                .identity(identity)
                .domain_name(tls.server_name_override.clone());
            endpoint = endpoint.tls_config(tls_config).map_err(|source| ChannelError::Configuration {
                target: target.clone(),
                source,
            })?;
        }

        let (state_tx, _) = watch::channel(ChannelState::Idle);

        Ok(Channel {
            target,
            endpoint,
            state_tx,
            inner: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// A human-readable identifier for the peer this channel connects to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The channel's current connectivity state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Resolve once the observed state differs from `from`.
    ///
    /// If the channel is shut down while waiting, resolves immediately with
    /// [`ChannelState::Shutdown`] rather than hanging: a monitor loop awaiting
    /// this is expected to treat that the same way it treats an
    /// externally-requested shutdown.
    pub async fn wait_for_state_change(&self, from: ChannelState) -> ChannelState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let current = *rx.borrow();
            if current != from {
                return current;
            }
            if rx.changed().await.is_err() {
                return ChannelState::Shutdown;
            }
        }
    }

    /// Return a handle to the underlying tonic channel for issuing RPCs, if
    /// a connection attempt has succeeded. `None` before the first successful
    /// `connect()`, or after `shutdown()`.
    pub fn connected(&self) -> Option<tonic::transport::Channel> {
        self.inner.lock().expect("channel mutex poisoned").clone()
    }

    /// Force an active connection attempt, failing if `deadline` elapses first.
    ///
    /// On success the channel moves to [`ChannelState::Ready`] and a cloned
    /// handle becomes available via [`Channel::connected`]. On failure it
    /// moves to [`ChannelState::TransientFailure`].
    pub async fn connect(&self, deadline: Duration) -> Result<(), ChannelError> {
        if self.state() == ChannelState::Shutdown {
            return Err(ChannelError::ShuttingDown { target: self.target.clone() });
        }

        self.set_state(ChannelState::Connecting);

        let attempt = tokio::time::timeout(deadline, self.endpoint.connect());
        match attempt.await {
            Ok(Ok(channel)) => {
                *self.inner.lock().expect("channel mutex poisoned") = Some(channel);
                self.set_state(ChannelState::Ready);
                debug!(target = %self.target, "channel connected");
                Ok(())
            }
            Ok(Err(source)) => {
                self.set_state(ChannelState::TransientFailure);
                warn!(target = %self.target, error = %source, "connection attempt failed");
                Err(ChannelError::ConnectFailed { target: self.target.clone(), source })
            }
            Err(_elapsed) => {
                self.set_state(ChannelState::TransientFailure);
                Err(ChannelError::DeadlineExceeded { target: self.target.clone(), deadline })
            }
        }
    }

    /// Shut the channel down. Idempotent: returns `true` the first time it
    /// actually transitions to [`ChannelState::Shutdown`], `false` on any
    /// subsequent call.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.inner.lock().expect("channel mutex poisoned") = None;
        self.set_state(ChannelState::Shutdown);
        true
    }

    fn set_state(&self, state: ChannelState) {
        // A shut-down channel never leaves `Shutdown`.
        if self.state() == ChannelState::Shutdown {
            return;
        }
        self.state_tx.send_replace(state);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
