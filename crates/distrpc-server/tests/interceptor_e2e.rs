//! End-to-end tests of the Server Interceptor and Server Host over a real
//! loopback socket: a tonic-generated client talking to a tonic-generated
//! server, wrapped in [`distrpc_server::ServerInterceptor`] and run through
//! [`distrpc_server::ServerHost::serve`].

use std::net::SocketAddr;
use std::time::Duration;

use distrpc_proto::wire::orchestrator_to_worker_client::OrchestratorToWorkerClient;
use distrpc_proto::wire::orchestrator_to_worker_server::{OrchestratorToWorker, OrchestratorToWorkerServer};
use distrpc_proto::wire::Envelope;
use distrpc_proto::{build_headers, DistributedInvocationId, TraceId};
use distrpc_server::{ServerConfig, ServerHost};
use distrpc_transport::CredentialConfig;
use tonic::transport::Endpoint;
use tonic::{Request, Response, Status};

/// Echoes the payload back, so a successful round-trip is easy to assert on.
struct EchoWorker;

#[tonic::async_trait]
impl OrchestratorToWorker for EchoWorker {
    async fn attach(&self, request: Request<Envelope>) -> Result<Response<Envelope>, Status> {
        Ok(Response::new(request.into_inner()))
    }

    async fn execute_pips(&self, request: Request<Envelope>) -> Result<Response<Envelope>, Status> {
        Ok(Response::new(request.into_inner()))
    }

    async fn stream_execute_pips(
        &self,
        request: Request<tonic::Streaming<Envelope>>,
    ) -> Result<Response<Envelope>, Status> {
        let mut stream = request.into_inner();
        let mut last = Envelope::default();
        while let Some(envelope) = stream.message().await? {
            last = envelope;
        }
        Ok(Response::new(last))
    }

    async fn heartbeat(&self, request: Request<Envelope>) -> Result<Response<Envelope>, Status> {
        Ok(Response::new(request.into_inner()))
    }

    async fn exit(&self, request: Request<Envelope>) -> Result<Response<Envelope>, Status> {
        Ok(Response::new(request.into_inner()))
    }
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: distrpc_server::ShutdownHandle,
    task: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    async fn stop(self) {
        self.shutdown.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("server task should exit promptly after shutdown")
            .unwrap();
    }
}

async fn start_server(invocation_id: DistributedInvocationId, expected_token: Option<&str>) -> RunningServer {
    // Bind up front so the test can connect without racing the server task's
    // own startup.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let config = ServerConfig {
        bind_addr: addr,
        local_invocation_id: invocation_id,
        credentials: CredentialConfig::default(),
        inline_worker_handling: true,
    };
    let host = ServerHost::new(config).await.unwrap();
    let shutdown = host.shutdown_handle();
    let mut interceptor_config = host.interceptor_config();
    interceptor_config.expected_token = expected_token.map(str::to_string);
    let interceptor = distrpc_server::ServerInterceptor::new(interceptor_config);

    let task = tokio::spawn(async move {
        let svc = OrchestratorToWorkerServer::new(EchoWorker)
            .max_decoding_message_size(distrpc_server::UNLIMITED_MESSAGE_SIZE)
            .max_encoding_message_size(distrpc_server::UNLIMITED_MESSAGE_SIZE);
        let svc = tonic::service::interceptor::InterceptedService::new(svc, interceptor);
        host.serve(|server| server.add_service(svc)).await.unwrap();
    });

    // Give the listener a moment to come up before the first connect.
    tokio::time::sleep(Duration::from_millis(50)).await;

    RunningServer { addr, shutdown, task }
}

#[tokio::test]
async fn matching_invocation_id_round_trips_the_payload() {
    let invocation_id = DistributedInvocationId::new("act", "prod", "1.0.0");
    let server = start_server(invocation_id.clone(), None).await;

    let channel = Endpoint::from_shared(format!("http://{}", server.addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = OrchestratorToWorkerClient::new(channel);

    let headers = build_headers(&invocation_id, TraceId::generate(), "orchestrator-01", None);
    let mut request = Request::new(Envelope { payload: b"hello".to_vec() });
    *request.metadata_mut() = headers;

    let response = tokio::time::timeout(Duration::from_secs(5), client.attach(request))
        .await
        .expect("call should not hang")
        .expect("call should succeed");
    assert_eq!(response.into_inner().payload, b"hello");

    server.stop().await;
}

#[tokio::test]
async fn mismatched_invocation_id_is_rejected_with_both_trailers() {
    let local_id = DistributedInvocationId::new("act", "prod", "1.0.0");
    let foreign_id = DistributedInvocationId::new("act", "prod", "9.9.9");
    let server = start_server(local_id, None).await;

    let channel = Endpoint::from_shared(format!("http://{}", server.addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = OrchestratorToWorkerClient::new(channel);

    let headers = build_headers(&foreign_id, TraceId::generate(), "orchestrator-01", None);
    let mut request = Request::new(Envelope { payload: b"hello".to_vec() });
    *request.metadata_mut() = headers;

    let status = client.attach(request).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(distrpc_proto::is_invocation_id_mismatch(status.metadata()));
    assert!(distrpc_proto::is_unrecoverable_error(status.metadata()));

    server.stop().await;
}

#[tokio::test]
async fn wrong_token_is_rejected_unauthenticated() {
    let invocation_id = DistributedInvocationId::new("act", "prod", "1.0.0");
    let server = start_server(invocation_id.clone(), Some("s3cret")).await;

    let channel = Endpoint::from_shared(format!("http://{}", server.addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = OrchestratorToWorkerClient::new(channel);

    let headers = build_headers(&invocation_id, TraceId::generate(), "orchestrator-01", Some("nope"));
    let mut request = Request::new(Envelope { payload: b"hello".to_vec() });
    *request.metadata_mut() = headers;

    let status = client.attach(request).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert!(distrpc_proto::is_unrecoverable_error(status.metadata()));

    server.stop().await;
}
