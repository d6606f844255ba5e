//! Cooperative cancellation for long-running engine operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use skp_datastore::Error;

/// Shared cancellation flag.
///
/// Every engine checks the token at least once per file; an observed
/// cancellation aborts the operation with [`Error::Cancelled`] and the
/// engine rolls back what it can.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
