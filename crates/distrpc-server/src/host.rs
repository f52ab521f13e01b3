//! Binds service handlers to an address, installs the [`ServerInterceptor`],
//! enforces message-size limits, and manages graceful shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use distrpc_proto::DistributedInvocationId;
use distrpc_transport::{CredentialConfig, CredentialProvider, Credentials};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tonic::transport::server::Router;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, warn};

use crate::interceptor::InterceptorConfig;

/// Re-exported for callers wiring up a service: see
/// [`distrpc_proto::UNLIMITED_MESSAGE_SIZE`] for the rationale. Kept under
/// this crate's own name too since it's this module's `serve` callback that
/// callers reach for it from.
pub use distrpc_proto::UNLIMITED_MESSAGE_SIZE;

/// Startup configuration for a [`ServerHost`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind and accept connections on.
    pub bind_addr: SocketAddr,
    /// This process's invocation id; validated against every inbound call.
    pub local_invocation_id: DistributedInvocationId,
    /// TLS/mTLS and token material, resolved the same way the client side
    /// resolves it.
    pub credentials: CredentialConfig,
    /// Whether a worker handles incoming pips inline (awaited on the RPC
    /// task) or hands them to a spawned, fire-and-forget task. Threaded
    /// through for handlers built with [`crate::dispatch`]; this crate does
    /// not interpret it itself.
    pub inline_worker_handling: bool,
}

/// Failure building or running a [`ServerHost`].
#[derive(Debug, Error)]
pub enum ServerHostError {
    /// The resolved TLS material was rejected by the transport.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[source] tonic::transport::Error),
    /// The server failed while accepting connections.
    #[error("server failed: {0}")]
    Serve(#[source] tonic::transport::Error),
}

/// A handle used to request a graceful shutdown of a running [`ServerHost`].
///
/// Idempotent: the first call to [`ShutdownHandle::shutdown`] wins, every
/// later call (including ones racing with it) is a silent no-op.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    fired: Arc<AtomicBool>,
}

impl ShutdownHandle {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            ShutdownHandle {
                tx: Arc::new(Mutex::new(Some(tx))),
                fired: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Request shutdown. Returns `true` if this call was the one that fired
    /// it, `false` if shutdown had already been requested.
    pub async fn shutdown(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(tx) = self.tx.lock().await.take() {
            // The receiving end may already be gone if the server task has
            // exited on its own; that's not an error, there's simply
            // nothing left to signal.
            let _ = tx.send(());
        }
        true
    }

    /// True if shutdown has already been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Hosts one or more gRPC service definitions behind the distributed RPC
/// transport's interceptor and TLS/mTLS configuration.
///
/// Construction resolves credentials (possibly reading key material from
/// disk); [`ServerHost::serve`] then builds and runs the tonic server until
/// [`ShutdownHandle::shutdown`] is called.
pub struct ServerHost {
    config: ServerConfig,
    tls_config: Option<ServerTlsConfig>,
    expected_token: Option<String>,
    shutdown: ShutdownHandle,
    shutdown_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ServerHost {
    /// Resolve credentials and build a host over `config`.
    ///
    /// mTLS is configured as "request and accept, but don't require a full
    /// chain": if a root certificate is configured it is presented to
    /// clients, but an unverified or absent client certificate never fails
    /// the handshake — per-peer certs are accepted without standing up a
    /// full PKI.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerHostError> {
        let provider = CredentialProvider::new(config.credentials.clone());
        let credentials = provider.resolve().await;

        let mut expected_token = None;
        let tls_config = match &credentials {
            Credentials::Insecure => None,
            Credentials::Tls(tls) => {
                expected_token = tls.call_token.clone();
                let identity = Identity::from_pem(&tls.cert_pem, &tls.key_pem);
                let mut server_tls = ServerTlsConfig::new().identity(identity);
                if !tls.root_pem.is_empty() {
                    server_tls = server_tls
                        .client_ca_root(Certificate::from_pem(&tls.root_pem))
                        .client_auth_optional(true);
                }
                Some(server_tls)
            }
        };

        let (shutdown, shutdown_rx) = ShutdownHandle::new();

        Ok(ServerHost {
            config,
            tls_config,
            expected_token,
            shutdown,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        })
    }

    /// The interceptor configuration this host resolved, for wiring into
    /// [`crate::interceptor::ServerInterceptor`] when wrapping each service.
    pub fn interceptor_config(&self) -> InterceptorConfig {
        InterceptorConfig {
            local_invocation_id: self.config.local_invocation_id.clone(),
            expected_token: self.expected_token.clone(),
        }
    }

    /// Whether incoming pips should be handled inline or fire-and-forget.
    pub fn inline_worker_handling(&self) -> bool {
        self.config.inline_worker_handling
    }

    /// A cloneable handle that can request this host shut down.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Build the tonic server (with TLS configured, if any) and hand it to
    /// `build`, which attaches one or more interceptor-wrapped services and
    /// returns the resulting [`Router`]. Runs until
    /// [`ShutdownHandle::shutdown`] is called.
    ///
    /// `build` receiving a plain [`Server`] (rather than this type owning
    /// the service list) keeps `ServerHost` decoupled from the concrete
    /// service types callers choose to host, the same way the reference
    /// codebase's server constructor takes a service-builder callback.
    pub async fn serve<F>(&self, build: F) -> Result<(), ServerHostError>
    where
        F: FnOnce(Server) -> Router,
    {
        let mut builder = Server::builder();
        if let Some(tls_config) = self.tls_config.clone() {
            builder = builder.tls_config(tls_config).map_err(ServerHostError::Tls)?;
        }

        let router = build(builder);
        let shutdown_rx = self
            .shutdown_rx
            .lock()
            .await
            .take()
            .expect("ServerHost::serve must only be called once");

        info!(addr = %self.config.bind_addr, "server host accepting connections");
        router
            .serve_with_shutdown(self.config.bind_addr, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(ServerHostError::Serve)?;
        info!(addr = %self.config.bind_addr, "server host shut down");
        Ok(())
    }
}
