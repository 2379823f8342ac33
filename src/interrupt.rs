//! Cooperative cancellation.
//!
//! Long loops poll an [`InterruptFlag`] at coarse checkpoints (after an assignment pass,
//! after an iteration). Raising the flag never aborts mid-update: the loop finishes its
//! current step and returns what it has.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, clonable interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// A fresh, lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop at the next checkpoint.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Lower the flag.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether a stop has been requested.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let a = InterruptFlag::new();
        let b = a.clone();
        assert!(!b.is_set());
        a.interrupt();
        assert!(b.is_set());
        b.reset();
        assert!(!a.is_set());
    }
}
