//! Cooperative cancellation
//!
//! The engine owns a [`CancelHandle`] per running workflow instance and hands
//! [`CancelSignal`] clones to step implementations, chat clients and artifact
//! stores. Cancellation is cooperative: holders are expected to check the
//! signal at their I/O boundaries.

use tokio::sync::watch;

/// Write side of a cancellation pair
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A read-only signal observing this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Flip the signal; idempotent
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a cancellation pair
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires, for callers outside any workflow
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // The sender must outlive every clone of the receiver, otherwise
        // `cancelled()` would resolve as closed rather than pending.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the handle fires; pends forever for [`Self::never`]
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling: treat as never-cancelled.
                std::future::pending::<()>().await;
            }
        }
    }
}
