use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest a blocking call sleeps before looking at its token again.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Cooperative cancellation flag handed to blocking reads.
///
/// Clones share the same flag. Cancelling never interrupts I/O; the
/// blocked call notices at its next wake-up, which is at most
/// [`CANCEL_POLL_INTERVAL`] away.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
