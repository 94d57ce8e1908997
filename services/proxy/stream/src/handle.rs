//! One-shot downstream handle.
//!
//! The two forwarding loops of a call share one of these. The loop that
//! resolves the target completes it exactly once, either with the opened
//! downstream or with the reason it could not be opened. The other loop waits
//! on it and gives up as soon as the call is cancelled, so a resolution that
//! never happens cannot strand it.
//!
//! Completing consumes the [`Resolve`] half, which rules out a second
//! assignment at compile time.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, error};

/// Create a linked resolve/wait pair
pub fn one_shot<T>() -> (Resolve<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolve { tx }, Pending { rx })
}

/// Completing half, held by the resolving loop
#[derive(Debug)]
pub struct Resolve<T> {
    tx: oneshot::Sender<Result<T, Status>>,
}

impl<T> Resolve<T> {
    /// Move the handle to its resolved state
    pub fn resolve(self, value: T) {
        if self.tx.send(Ok(value)).is_err() {
            debug!("Downstream resolved after the waiting side went away");
        }
    }

    /// Move the handle to its abandoned state, waking the waiter with `status`
    pub fn abandon(self, status: Status) {
        if self.tx.send(Err(status)).is_err() {
            debug!("Downstream abandoned after the waiting side went away");
        }
    }

    /// Whether the waiting side is gone, making resolution pointless
    pub fn is_orphaned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Waiting half, held by the loop that needs the downstream
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, Status>>,
}

impl<T> Pending<T> {
    /// Wait for resolution, giving up once `cancel` fires.
    ///
    /// A [`Resolve`] dropped without completing is reported as cancelled when
    /// the call was cancelled, and as an internal error otherwise.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<T, Status> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Status::cancelled("call cancelled before downstream was resolved")),
            outcome = self.rx => match outcome {
                Ok(result) => result,
                Err(_) if cancel.is_cancelled() => {
                    Err(Status::cancelled("call cancelled before downstream was resolved"))
                }
                Err(_) => {
                    error!("Downstream handle dropped without being resolved or abandoned");
                    Err(Status::internal("downstream handle dropped without an outcome"))
                }
            },
        }
    }
}
