//! Cooperative cancellation.
//!
//! The loop never preempts an in-flight call. It polls a `CancelToken` at the
//! top of every cycle and at every slice of a sleep, so the latency between a
//! cancel request and the loop returning is bounded by `SLEEP_SLICE`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on how long a sleep runs before re-checking for cancellation.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in slices of at most `SLEEP_SLICE`.
    ///
    /// Returns `true` when the full duration elapsed and `false` when the
    /// sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
