//! The single-shot failure broadcaster a Connection Manager uses to tell
//! subscribers it has given up on its peer.

use std::sync::atomic::{AtomicBool, Ordering};

use distrpc_error::ConnectionFailure;
use tokio::sync::watch;

/// The emitting half of a single-shot failure broadcast.
///
/// Only the first call to [`FailureEmitter::emit`] has any effect; later
/// calls are silently dropped. This mirrors the "first emitter wins"
/// compare-and-set the Connection Manager is built around: at most one
/// failure event is ever observable per manager instance.
#[derive(Clone)]
pub struct FailureEmitter {
    fired: std::sync::Arc<AtomicBool>,
    tx: watch::Sender<Option<ConnectionFailure>>,
}

/// The subscribing half of a single-shot failure broadcast.
///
/// Subscribers should be created (via [`failure_channel`]) before the
/// manager's monitor loop starts, so no emission can race past them
/// unobserved.
#[derive(Clone)]
pub struct FailureSubscriber {
    rx: watch::Receiver<Option<ConnectionFailure>>,
}

/// Create a linked emitter/subscriber pair.
pub fn failure_channel() -> (FailureEmitter, FailureSubscriber) {
    let (tx, rx) = watch::channel(None);
    (
        FailureEmitter {
            fired: std::sync::Arc::new(AtomicBool::new(false)),
            tx,
        },
        FailureSubscriber { rx },
    )
}

impl FailureEmitter {
    /// Emit `failure`, if no failure has been emitted yet.
    ///
    /// Returns `true` if this call was the one that fired.
    pub fn emit(&self, failure: ConnectionFailure) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        // The receiver side may already be gone if every subscriber was
        // dropped; that's fine, there's simply nobody left to tell.
        let _ = self.tx.send(Some(failure));
        true
    }

    /// True if a failure has already been emitted.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl FailureSubscriber {
    /// Wait for the single failure this manager will ever emit.
    ///
    /// Resolves immediately if a failure was already emitted before this
    /// call. Never resolves if the manager is dropped without emitting one.
    pub async fn wait(&mut self) -> ConnectionFailure {
        loop {
            if let Some(failure) = self.rx.borrow().clone() {
                return failure;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Return the failure if one has already been emitted, without waiting.
    pub fn try_get(&self) -> Option<ConnectionFailure> {
        self.rx.borrow().clone()
    }
}
