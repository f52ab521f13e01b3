//! Typed client façades: `OrchestratorToWorker` and `WorkerToOrchestrator`.
//!
//! Each façade owns one [`ConnectionManager`] per peer (constructed by the
//! one-shot [`OrchestratorFacade::set_location`] / [`WorkerFacade::set_location`])
//! and drives every RPC through the shared [`RetryingCaller`]. Streaming
//! calls, when enabled, are opened lazily on first use and live for the
//! façade's own lifetime; [`OrchestratorFacade::finalize_streaming`] /
//! [`WorkerFacade::finalize_streaming`] close out whichever streams were
//! opened.

use std::sync::Arc;

use distrpc_error::CallResult;
use distrpc_proto::wire::orchestrator_to_worker_client::OrchestratorToWorkerClient;
use distrpc_proto::wire::worker_to_orchestrator_client::WorkerToOrchestratorClient;
use distrpc_proto::wire::Envelope;
use distrpc_proto::DistributedInvocationId;
use distrpc_transport::{ChannelError, Credentials};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Span;

use crate::cancellation::CancellationToken;
use crate::caller::RetryingCaller;
use crate::config::ClientConfig;
use crate::manager::ConnectionManager;

/// A single lazily-opened client-streaming call.
///
/// Opened on the first streaming write a façade makes; its sender half is
/// handed to callers as the per-message "write" closure, and
/// [`ClientStream::finalize`] drops the sender (ending the request side) and
/// awaits the single response the server sends back.
struct ClientStream {
    tx: Option<mpsc::Sender<Envelope>>,
    response: oneshot::Receiver<Result<tonic::Response<Envelope>, tonic::Status>>,
}

impl ClientStream {
    async fn write(&self, envelope: Envelope) -> Result<tonic::Response<Envelope>, tonic::Status> {
        match &self.tx {
            Some(tx) => match tx.send(envelope).await {
                Ok(()) => Ok(tonic::Response::new(Envelope::default())),
                Err(_) => Err(tonic::Status::unavailable("client stream's write side is closed")),
            },
            None => Err(tonic::Status::unavailable("client stream was never opened")),
        }
    }

    async fn finalize(mut self) -> Result<tonic::Response<Envelope>, tonic::Status> {
        // Dropping the sender closes the request stream; the server then
        // sends its single response, which the spawned task forwards here.
        self.tx.take();
        self.response
            .await
            .unwrap_or_else(|_| Err(tonic::Status::cancelled("client stream task was dropped")))
    }
}

/// Credentials resolved once per façade and reused for every reconnect.
struct FacadeCredentials {
    config: ClientConfig,
    invocation_id: DistributedInvocationId,
    sender_name: String,
    span: Span,
}

impl FacadeCredentials {
    async fn resolve(&self) -> Credentials {
        let provider = distrpc_transport::CredentialProvider::new(self.config.credential_config());
        provider.resolve().await
    }
}

/// The orchestrator-side façade for calling a single worker.
pub struct OrchestratorFacade {
    shared: FacadeCredentials,
    manager: OnceCell<ConnectionManager>,
    caller: OnceCell<RetryingCaller>,
    execute_stream: Mutex<Option<ClientStream>>,
}

impl OrchestratorFacade {
    /// Construct a façade that has not yet been pointed at a worker.
    ///
    /// `parent_span` is entered while the Connection Manager is built, so
    /// its own `connection_manager` span (and everything logged under it)
    /// nests under whatever per-build span the embedding process has open.
    pub fn new(
        config: ClientConfig,
        invocation_id: DistributedInvocationId,
        sender_name: impl Into<String>,
        parent_span: Span,
    ) -> Self {
        OrchestratorFacade {
            shared: FacadeCredentials {
                config,
                invocation_id,
                sender_name: sender_name.into(),
                span: parent_span,
            },
            manager: OnceCell::new(),
            caller: OnceCell::new(),
            execute_stream: Mutex::new(None),
        }
    }

    /// Point this façade at `address:port`, constructing its Connection
    /// Manager. One-shot: later calls are ignored once a location has been
    /// set.
    pub async fn set_location(&self, address: &str, port: u16) -> Result<(), ChannelError> {
        let target = format!("{address}:{port}");
        let credentials = self.shared.resolve().await;
        let config = self.shared.config.clone();
        let invocation_id = self.shared.invocation_id.clone();
        let token = match &credentials {
            Credentials::Tls(tls) => tls.call_token.clone(),
            Credentials::Insecure => None,
        };
        let span = self.shared.span.clone();
        self.manager
            .get_or_try_init(|| async {
                let _entered = span.enter();
                ConnectionManager::new(target, config, &invocation_id, &credentials)
            })
            .await?;
        let _ = self.caller.set(RetryingCaller::new(
            self.shared.invocation_id.clone(),
            self.shared.sender_name.clone(),
            token,
        ));
        Ok(())
    }

    fn manager(&self) -> &ConnectionManager {
        self.manager.get().expect("set_location must be called before any RPC")
    }

    fn caller(&self) -> &RetryingCaller {
        self.caller.get().expect("set_location must be called before any RPC")
    }

    fn client(&self) -> Option<OrchestratorToWorkerClient<tonic::transport::Channel>> {
        self.manager().channel().connected().map(|channel| {
            OrchestratorToWorkerClient::new(channel)
                .max_decoding_message_size(distrpc_proto::UNLIMITED_MESSAGE_SIZE)
                .max_encoding_message_size(distrpc_proto::UNLIMITED_MESSAGE_SIZE)
        })
    }

    /// Attach to the worker. On success, marks the Connection Manager
    /// attached so its monitor loop arms the reconnect watchdog.
    pub async fn attach(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        let result = self
            .caller()
            .call(
                self.manager(),
                |_opts| {
                    let mut client = self.client();
                    let msg = msg.clone();
                    Box::pin(async move {
                        match client.as_mut() {
                            Some(client) => client.attach(msg).await,
                            None => Err(tonic::Status::unavailable("not connected yet")),
                        }
                    })
                },
                "Attach",
                cancellation,
                true,
            )
            .await;
        if result.is_success() {
            self.manager().on_attachment_completed();
        }
        result
    }

    /// Dispatch pips to the worker, unary or streamed depending on
    /// `streaming_enabled`.
    pub async fn execute_pips(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        if self.shared.config.streaming_enabled {
            self.execute_pips_streamed(msg, cancellation).await
        } else {
            self.caller()
                .call(
                    self.manager(),
                    |_opts| {
                        let mut client = self.client();
                        let msg = msg.clone();
                        Box::pin(async move {
                            match client.as_mut() {
                                Some(client) => client.execute_pips(msg).await,
                                None => Err(tonic::Status::unavailable("not connected yet")),
                            }
                        })
                    },
                    "ExecutePips",
                    cancellation,
                    false,
                )
                .await
        }
    }

    async fn execute_pips_streamed(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        self.caller()
            .call(
                self.manager(),
                |_opts| {
                    let stream_slot = &self.execute_stream;
                    let msg = msg.clone();
                    let client = self.client();
                    Box::pin(async move {
                        let mut guard = stream_slot.lock().await;
                        if guard.is_none() {
                            let Some(mut client) = client else {
                                return Err(tonic::Status::unavailable("not connected yet"));
                            };
                            let (tx, rx) = mpsc::channel(16);
                            let (response_tx, response_rx) = oneshot::channel();
                            tokio::spawn(async move {
                                let result = client.stream_execute_pips(ReceiverStream::new(rx)).await;
                                let _ = response_tx.send(result);
                            });
                            *guard = Some(ClientStream {
                                tx: Some(tx),
                                response: response_rx,
                            });
                        }
                        guard.as_ref().expect("just initialized").write(msg).await
                    })
                },
                "StreamExecutePips",
                cancellation,
                false,
            )
            .await
    }

    /// Send a heartbeat to the worker.
    pub async fn heartbeat(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        self.caller()
            .call(
                self.manager(),
                |_opts| {
                    let mut client = self.client();
                    let msg = msg.clone();
                    Box::pin(async move {
                        match client.as_mut() {
                            Some(client) => client.heartbeat(msg).await,
                            None => Err(tonic::Status::unavailable("not connected yet")),
                        }
                    })
                },
                "Heartbeat",
                cancellation,
                false,
            )
            .await
    }

    /// Tell the worker to exit. Signals `readyForExit` on the manager first
    /// so the monitor does not misread the peer's subsequent `Idle` as an
    /// unexpected disconnect.
    pub async fn exit(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        self.manager().ready_for_exit();
        self.caller()
            .call(
                self.manager(),
                |_opts| {
                    let mut client = self.client();
                    let msg = msg.clone();
                    Box::pin(async move {
                        match client.as_mut() {
                            Some(client) => client.exit(msg).await,
                            None => Err(tonic::Status::unavailable("not connected yet")),
                        }
                    })
                },
                "Exit",
                cancellation,
                false,
            )
            .await
    }

    /// Complete the request side of any open client stream and await its
    /// response. Safe to call even if no stream was ever opened.
    pub async fn finalize_streaming(&self) -> Result<(), tonic::Status> {
        let stream = self.execute_stream.lock().await.take();
        if let Some(stream) = stream {
            stream.finalize().await?;
        }
        Ok(())
    }

    /// Shut this façade's Connection Manager down.
    pub async fn close(&self) {
        if let Some(manager) = self.manager.get() {
            manager.close().await;
        }
    }
}

/// The worker-side façade for calling its orchestrator.
pub struct WorkerFacade {
    shared: FacadeCredentials,
    manager: OnceCell<ConnectionManager>,
    caller: OnceCell<RetryingCaller>,
    pip_results_stream: Mutex<Option<ClientStream>>,
    execution_log_stream: Mutex<Option<ClientStream>>,
}

impl WorkerFacade {
    /// Construct a façade that has not yet been pointed at an orchestrator.
    ///
    /// `parent_span` is entered while the Connection Manager is built, so
    /// its own `connection_manager` span nests under the embedding process's
    /// per-build span.
    pub fn new(
        config: ClientConfig,
        invocation_id: DistributedInvocationId,
        sender_name: impl Into<String>,
        parent_span: Span,
    ) -> Self {
        WorkerFacade {
            shared: FacadeCredentials {
                config,
                invocation_id,
                sender_name: sender_name.into(),
                span: parent_span,
            },
            manager: OnceCell::new(),
            caller: OnceCell::new(),
            pip_results_stream: Mutex::new(None),
            execution_log_stream: Mutex::new(None),
        }
    }

    /// Point this façade at `address:port`, constructing its Connection
    /// Manager. One-shot.
    pub async fn set_location(&self, address: &str, port: u16) -> Result<(), ChannelError> {
        let target = format!("{address}:{port}");
        let credentials = self.shared.resolve().await;
        let config = self.shared.config.clone();
        let invocation_id = self.shared.invocation_id.clone();
        let token = match &credentials {
            Credentials::Tls(tls) => tls.call_token.clone(),
            Credentials::Insecure => None,
        };
        let span = self.shared.span.clone();
        self.manager
            .get_or_try_init(|| async {
                let _entered = span.enter();
                ConnectionManager::new(target, config, &invocation_id, &credentials)
            })
            .await?;
        let _ = self.caller.set(RetryingCaller::new(
            self.shared.invocation_id.clone(),
            self.shared.sender_name.clone(),
            token,
        ));
        Ok(())
    }

    fn manager(&self) -> &ConnectionManager {
        self.manager.get().expect("set_location must be called before any RPC")
    }

    fn caller(&self) -> &RetryingCaller {
        self.caller.get().expect("set_location must be called before any RPC")
    }

    fn client(&self) -> Option<WorkerToOrchestratorClient<tonic::transport::Channel>> {
        self.manager().channel().connected().map(|channel| {
            WorkerToOrchestratorClient::new(channel)
                .max_decoding_message_size(distrpc_proto::UNLIMITED_MESSAGE_SIZE)
                .max_encoding_message_size(distrpc_proto::UNLIMITED_MESSAGE_SIZE)
        })
    }

    /// Say hello to the orchestrator; the worker-side analogue of attach.
    pub async fn hello(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        let result = self
            .caller()
            .call(
                self.manager(),
                |_opts| {
                    let mut client = self.client();
                    let msg = msg.clone();
                    Box::pin(async move {
                        match client.as_mut() {
                            Some(client) => client.hello(msg).await,
                            None => Err(tonic::Status::unavailable("not connected yet")),
                        }
                    })
                },
                "Hello",
                cancellation,
                true,
            )
            .await;
        if result.is_success() {
            self.manager().on_attachment_completed();
        }
        result
    }

    /// Report that this worker's attachment handshake completed.
    pub async fn attach_completed(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        self.caller()
            .call(
                self.manager(),
                |_opts| {
                    let mut client = self.client();
                    let msg = msg.clone();
                    Box::pin(async move {
                        match client.as_mut() {
                            Some(client) => client.attach_completed(msg).await,
                            None => Err(tonic::Status::unavailable("not connected yet")),
                        }
                    })
                },
                "AttachCompleted",
                cancellation,
                false,
            )
            .await
    }

    /// Report pip results, unary or streamed depending on `streaming_enabled`.
    pub async fn report_pip_results(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        if self.shared.config.streaming_enabled {
            self.stream_write(&self.pip_results_stream, msg, cancellation, "StreamPipResults", |client, rx| {
                Box::pin(async move { client.stream_pip_results(ReceiverStream::new(rx)).await })
            })
            .await
        } else {
            self.caller()
                .call(
                    self.manager(),
                    |_opts| {
                        let mut client = self.client();
                        let msg = msg.clone();
                        Box::pin(async move {
                            match client.as_mut() {
                                Some(client) => client.report_pip_results(msg).await,
                                None => Err(tonic::Status::unavailable("not connected yet")),
                            }
                        })
                    },
                    "ReportPipResults",
                    cancellation,
                    false,
                )
                .await
        }
    }

    /// Report execution log entries, unary or streamed depending on
    /// `streaming_enabled`.
    pub async fn report_execution_log(&self, msg: Envelope, cancellation: &CancellationToken) -> CallResult {
        if self.shared.config.streaming_enabled {
            self.stream_write(&self.execution_log_stream, msg, cancellation, "StreamExecutionLog", |client, rx| {
                Box::pin(async move { client.stream_execution_log(ReceiverStream::new(rx)).await })
            })
            .await
        } else {
            self.caller()
                .call(
                    self.manager(),
                    |_opts| {
                        let mut client = self.client();
                        let msg = msg.clone();
                        Box::pin(async move {
                            match client.as_mut() {
                                Some(client) => client.report_execution_log(msg).await,
                                None => Err(tonic::Status::unavailable("not connected yet")),
                            }
                        })
                    },
                    "ReportExecutionLog",
                    cancellation,
                    false,
                )
                .await
        }
    }

    async fn stream_write<F>(
        &self,
        slot: &Mutex<Option<ClientStream>>,
        msg: Envelope,
        cancellation: &CancellationToken,
        description: &str,
        open: F,
    ) -> CallResult
    where
        F: Fn(
                WorkerToOrchestratorClient<tonic::transport::Channel>,
                mpsc::Receiver<Envelope>,
            ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<tonic::Response<Envelope>, tonic::Status>> + Send>>
            + Send
            + Sync,
    {
        let open = Arc::new(open);
        self.caller()
            .call(
                self.manager(),
                |_opts| {
                    let msg = msg.clone();
                    let client = self.client();
                    let open = open.clone();
                    Box::pin(async move {
                        let mut guard = slot.lock().await;
                        if guard.is_none() {
                            let Some(client) = client else {
                                return Err(tonic::Status::unavailable("not connected yet"));
                            };
                            let (tx, rx) = mpsc::channel(16);
                            let (response_tx, response_rx) = oneshot::channel();
                            tokio::spawn(async move {
                                let result = open(client, rx).await;
                                let _ = response_tx.send(result);
                            });
                            *guard = Some(ClientStream {
                                tx: Some(tx),
                                response: response_rx,
                            });
                        }
                        guard.as_ref().expect("just initialized").write(msg).await
                    })
                },
                description,
                cancellation,
                false,
            )
            .await
    }

    /// Complete the request side of every open client stream and await each
    /// response.
    pub async fn finalize_streaming(&self) -> Result<(), tonic::Status> {
        for slot in [&self.pip_results_stream, &self.execution_log_stream] {
            let stream = slot.lock().await.take();
            if let Some(stream) = stream {
                stream.finalize().await?;
            }
        }
        Ok(())
    }

    /// Shut this façade's Connection Manager down.
    pub async fn close(&self) {
        if let Some(manager) = self.manager.get() {
            manager.close().await;
        }
    }
}
