//! Cooperative termination flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable flag set by a signal handler and polled by the engine between
/// files and while sleeping before a retry.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination. Safe to call from any thread.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let shutdown = Shutdown::new();
        let handler_side = shutdown.clone();
        assert!(!shutdown.is_requested());
        handler_side.request();
        assert!(shutdown.is_requested());
    }
}
