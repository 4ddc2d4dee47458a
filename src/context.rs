//! Cooperative cancellation token passed to every call.
//!
//! The engine consults the token on entry to each host call and at backward
//! branches, so straight-line wasm code never pays for it. Cancellation
//! surfaces as a `canceled` trap, deadline expiry as `deadline exceeded`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Trap;

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a cancellation flag. Setting the flag to `true` cancels all
    /// calls carrying this context at their next suspension point.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Attaches a deadline observed at the same suspension points.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns the pending interruption trap, if any.
    pub fn check(&self) -> Result<(), Trap> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Trap::Canceled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Trap::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_flag_trips_check() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Context::new().with_cancel(flag.clone());
        assert!(ctx.check().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert_eq!(ctx.check(), Err(Trap::Canceled));
    }

    #[test]
    fn past_deadline_trips_check() {
        let ctx = Context::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(ctx.check(), Err(Trap::DeadlineExceeded));
    }
}
