//! Inbound envelope validation: invocation-id mismatch, optional
//! token-based authentication, sender tracing metadata.

use distrpc_proto::{parse_headers, unrecoverable_trailers, ParsedHeaders};
use distrpc_proto::{invocation_id_mismatch_trailers, DistributedInvocationId};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::{debug, warn};

/// Configuration an inbound interceptor validates against.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// This process's local invocation id; an inbound call whose id doesn't
    /// match is rejected regardless of authentication.
    pub local_invocation_id: DistributedInvocationId,
    /// The token inbound calls must present, if authentication is enabled.
    /// `None` disables the authentication check entirely.
    pub expected_token: Option<String>,
}

/// Validates every inbound call before it reaches a service handler.
///
/// Invocation id mismatch is checked first (wrong-build calls are rejected
/// regardless of credentials), then authentication. A call that passes both
/// has its [`ParsedHeaders`] attached to the request's extensions for the
/// handler (or [`crate::host::ServerHost`]) to read back out.
#[derive(Debug, Clone)]
pub struct ServerInterceptor {
    config: InterceptorConfig,
}

impl ServerInterceptor {
    /// Build an interceptor over `config`.
    pub fn new(config: InterceptorConfig) -> Self {
        ServerInterceptor { config }
    }
}

impl Interceptor for ServerInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let parsed = parse_headers(request.metadata());

        if !parsed.invocation_id.matches(&self.config.local_invocation_id) {
            warn!(
                sender = %parsed.sender,
                their_invocation_id = %parsed.invocation_id,
                our_invocation_id = %self.config.local_invocation_id,
                "rejecting call: invocation id mismatch"
            );
            let mut status = Status::invalid_argument("invocation id mismatch");
            *status.metadata_mut() = invocation_id_mismatch_trailers();
            return Err(status);
        }

        if let Some(expected) = &self.config.expected_token {
            if parsed.token != *expected {
                warn!(sender = %parsed.sender, "rejecting call: authentication failed");
                let mut status = Status::unauthenticated("invalid or missing token");
                *status.metadata_mut() = unrecoverable_trailers();
                return Err(status);
            }
        }

        debug!(
            trace_id = ?parsed.trace_id.as_bytes(),
            sender = %parsed.sender,
            "Recv"
        );

        request.extensions_mut().insert(parsed);
        Ok(request)
    }
}

/// Read the [`ParsedHeaders`] a [`ServerInterceptor`] attached to this
/// request, for a handler that wants to log or propagate the caller's
/// identity rather than re-parsing metadata itself.
pub fn parsed_headers<T>(request: &Request<T>) -> Option<&ParsedHeaders> {
    request.extensions().get::<ParsedHeaders>()
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(token: Option<&str>) -> InterceptorConfig {
        InterceptorConfig {
            local_invocation_id: DistributedInvocationId::new("act", "prod", "1.0.0"),
            expected_token: token.map(str::to_string),
        }
    }

    fn request_with_headers(invocation_id: &DistributedInvocationId, token: Option<&str>) -> Request<()> {
        let metadata = distrpc_proto::build_headers(
            invocation_id,
            distrpc_proto::TraceId::generate(),
            "build-agent-01",
            token,
        );
        let mut request = Request::new(());
        *request.metadata_mut() = metadata;
        request
    }

    #[test]
    fn matching_identity_and_no_auth_passes_through() {
        let invocation_id = DistributedInvocationId::new("act", "prod", "1.0.0");
        let mut interceptor = ServerInterceptor::new(config(None));
        let request = request_with_headers(&invocation_id, None);

        let result = interceptor.call(request);
        let request = result.expect("matching invocation id should be accepted");
        let parsed = parsed_headers(&request).expect("parsed headers should be attached");
        assert_eq!(parsed.sender, "build-agent-01");
    }

    #[test]
    fn mismatched_invocation_id_is_rejected_with_both_trailers() {
        let mut interceptor = ServerInterceptor::new(config(None));
        let foreign_id = DistributedInvocationId::new("act", "prod", "9.9.9");
        let request = request_with_headers(&foreign_id, None);

        let status = interceptor.call(request).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(distrpc_proto::is_invocation_id_mismatch(status.metadata()));
        assert!(distrpc_proto::is_unrecoverable_error(status.metadata()));
    }

    #[test]
    fn missing_invocation_id_is_rejected() {
        let mut interceptor = ServerInterceptor::new(config(None));
        let request = Request::new(());

        let status = interceptor.call(request).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn wrong_token_is_rejected_unauthenticated() {
        let invocation_id = DistributedInvocationId::new("act", "prod", "1.0.0");
        let mut interceptor = ServerInterceptor::new(config(Some("s3cret")));
        let request = request_with_headers(&invocation_id, Some("wrong"));

        let status = interceptor.call(request).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
        assert!(distrpc_proto::is_unrecoverable_error(status.metadata()));
        assert!(!distrpc_proto::is_invocation_id_mismatch(status.metadata()));
    }

    #[test]
    fn missing_token_when_auth_enabled_is_rejected() {
        let invocation_id = DistributedInvocationId::new("act", "prod", "1.0.0");
        let mut interceptor = ServerInterceptor::new(config(Some("s3cret")));
        let request = request_with_headers(&invocation_id, None);

        let status = interceptor.call(request).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn correct_token_passes_through() {
        let invocation_id = DistributedInvocationId::new("act", "prod", "1.0.0");
        let mut interceptor = ServerInterceptor::new(config(Some("s3cret")));
        let request = request_with_headers(&invocation_id, Some("s3cret"));

        assert!(interceptor.call(request).is_ok());
    }
}
