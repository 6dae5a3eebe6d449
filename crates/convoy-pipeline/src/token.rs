//! Per-run cancellation token.
//!
//! Carries the `revoked` (user cancel) and `soft_limit_exceeded` bits that
//! replace exception-based interruption: the main processor checks them at
//! every chunk boundary and the skill executor before/after every HTTP
//! call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct RunToken {
    revoked: Arc<AtomicBool>,
    soft_limited: Arc<AtomicBool>,
}

impl RunToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn trip_soft_limit(&self) {
        self.soft_limited.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn is_soft_limited(&self) -> bool {
        self.soft_limited.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.is_revoked() || self.is_soft_limited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent_and_shared() {
        let token = RunToken::new();
        let clone = token.clone();
        assert!(!token.is_interrupted());
        clone.revoke();
        assert!(token.is_revoked());
        assert!(!token.is_soft_limited());
        token.trip_soft_limit();
        assert!(clone.is_soft_limited());
    }
}
