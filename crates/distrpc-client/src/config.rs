//! Tunables read at startup and shared by the Connection Manager, Retrying
//! Caller, and Client Façades.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Startup configuration for one peer connection.
///
/// Deserializable so an embedding process's config loader (out of scope
/// here, §1) can produce one directly from its own file/CLI layer; durations
/// are accepted in `humantime` form (e.g. `"5m"`, `"75min"`) rather than raw
/// seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-call deadline for each attempt in the retry loop.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Deadline for the pre-call `connect()` performed when a façade requests
    /// `wait_for_connection`.
    #[serde(with = "humantime_serde")]
    pub worker_attach_timeout: Duration,
    /// How long the monitor loop tolerates `Connecting`/`TransientFailure`
    /// before giving up on the peer entirely.
    #[serde(with = "humantime_serde")]
    pub distribution_connect_timeout: Duration,
    /// Maximum number of attempts in the Retrying Caller's attempt loop, and
    /// in the Connection Manager's reconnect loop.
    pub max_attempts: u32,
    /// Whether HTTP/2 keepalive pings are enabled on the channel.
    pub keepalive_enabled: bool,
    /// Whether client-streaming calls are used instead of unary calls where
    /// the service surface offers both.
    pub streaming_enabled: bool,
    /// Subject name required of the peer's certificate; encryption is
    /// enabled iff this is set.
    pub certificate_subject_name: Option<String>,
    /// Path to the bearer token file; authentication is enabled iff this
    /// resolves to a non-empty token.
    pub token_path: Option<PathBuf>,
    /// Path to this endpoint's own PEM certificate, for mTLS.
    pub cert_path: Option<PathBuf>,
    /// Path to this endpoint's own PEM private key, for mTLS.
    pub key_path: Option<PathBuf>,
    /// Path to the PEM root certificate trusted for the peer.
    pub root_cert_path: Option<PathBuf>,
    /// Whether a worker handles incoming pips inline (on the RPC task) or
    /// hands them off to a separate execution queue. This transport layer
    /// only threads the flag through; the execution behavior it selects
    /// lives in the service implementation the façade is built over.
    pub inline_worker_handling: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            call_timeout: Duration::from_secs(5 * 60),
            worker_attach_timeout: Duration::from_secs(75 * 60),
            distribution_connect_timeout: Duration::from_secs(5 * 60),
            max_attempts: 3,
            keepalive_enabled: true,
            streaming_enabled: false,
            certificate_subject_name: None,
            token_path: None,
            cert_path: None,
            key_path: None,
            root_cert_path: None,
            inline_worker_handling: true,
        }
    }
}

impl ClientConfig {
    /// Build the [`distrpc_transport::CredentialConfig`] embedded in this
    /// configuration.
    pub fn credential_config(&self) -> distrpc_transport::CredentialConfig {
        distrpc_transport::CredentialConfig {
            certificate_subject_name: self.certificate_subject_name.clone(),
            root_cert_path: self.root_cert_path.clone(),
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
            token_path: self.token_path.clone(),
        }
    }

    /// Build the [`distrpc_transport::ChannelConfig`] embedded in this
    /// configuration.
    pub fn channel_config(&self) -> distrpc_transport::ChannelConfig {
        distrpc_transport::ChannelConfig {
            keepalive_enabled: self.keepalive_enabled,
        }
    }
}
