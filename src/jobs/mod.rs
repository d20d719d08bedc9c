pub mod executor;
pub mod rate_limit;
pub mod service;
pub mod store;

pub use executor::{JobExecutor, StartMode};
pub use rate_limit::{Acquired, RateLimitToken, RateLimiter, ReleaseOutcome};
pub use service::{BackfillService, CreateJobRequest, JobPreview};
pub use store::JobStore;

use tokio::sync::watch;

/// One-shot cooperative cancellation flag. Every blocking call inside a job
/// executor takes the signal side and returns promptly once fired.
pub fn cancellation_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that can never fire, for contexts with no canceller.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever if the handle
    /// is gone without ever firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
