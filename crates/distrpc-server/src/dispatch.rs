//! Bridges a validated inbound call to the embedding worker/orchestrator
//! service layer: optional inlined vs. fire-and-forget handling, and a
//! "handler panicked" bail-out path that converts any unhandled panic into
//! an `Unknown` status carrying the unrecoverable-error trailer.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use distrpc_proto::{unrecoverable_trailers, wire::Envelope};
use futures_util::FutureExt;
use tonic::{Response, Status};
use tracing::error;

/// Run `handler`, converting a panic into an `Unknown` status carrying the
/// unrecoverable trailer rather than letting it unwind into the server
/// runtime.
///
/// A handler that panics has a bug; it is never retried by the caller (the
/// trailer tells it to tear its side down too), it is only contained here so
/// one bad call doesn't take the whole server task with it.
pub async fn guarded<F, Fut>(handler: F) -> Result<Response<Envelope>, Status>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response<Envelope>, Status>>,
{
    match AssertUnwindSafe(handler()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "service handler panicked; bailing out");
            let mut status = Status::unknown(format!("handler panicked: {message}"));
            *status.metadata_mut() = unrecoverable_trailers();
            Err(status)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Hand `payload` to `handler`, either awaiting it on this RPC task
/// (`inline = true`) or spawning it as a fire-and-forget background task
/// and acknowledging immediately (`inline = false`).
///
/// This is the Rust shape of `InlineWorkerHandling`: a worker that processes
/// pips inline returns its result (or failure) as the RPC response itself;
/// one that offloads execution to a separate queue just needs the
/// orchestrator's message accepted, not its eventual outcome.
pub async fn dispatch<F, Fut>(inline: bool, payload: Envelope, handler: F) -> Result<Response<Envelope>, Status>
where
    F: FnOnce(Envelope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Response<Envelope>, Status>> + Send + 'static,
{
    if inline {
        guarded(move || handler(payload)).await
    } else {
        tokio::spawn(async move {
            if let Err(status) = guarded(move || handler(payload)).await {
                error!(%status, "fire-and-forget handler returned an error with nobody to report it to");
            }
        });
        Ok(Response::new(Envelope::default()))
    }
}
