//! Run-wide cancellation.
//!
//! One [`CancelSource`] lives at the top of a run; its [`CancelToken`]
//! clones propagate through every executor, container exec, and
//! subprocess. Built on a watch channel so a token can be observed from
//! any number of tasks without locking.

use tokio::sync::watch;

/// The cancelling side. Dropping the source without cancelling leaves all
/// tokens permanently un-cancelled.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// A cloneable handle observing cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal cancellation to every outstanding token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that can never be cancelled, for call sites without a run.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<CancelToken> = std::sync::OnceLock::new();
        NEVER
            .get_or_init(|| {
                let (tx, rx) = watch::channel(false);
                // Keep one sender alive forever so the channel never closes.
                std::mem::forget(tx);
                CancelToken { rx }
            })
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is signalled. If the source is dropped
    /// without cancelling, this pends forever.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}
