use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Caller-supplied cancellation signal.
///
/// The core polls the token between storage reads in bulk copies and between
/// integrity-block verifications; a cancelled token surfaces as
/// [`StorageError::Cancelled`](crate::storage::StorageError::Cancelled).
/// Partial outputs produced before cancellation are left as-is.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::CancelToken;

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
