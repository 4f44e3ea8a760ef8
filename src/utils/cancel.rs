use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::BackupErrorKind;

/// Shared flag checked at suspension points (read/write boundaries of long
/// running loops: collection, archiving, checksumming, dispatch). Setting it
/// does not interrupt a syscall in flight, it only causes the next poll to
/// bail out with `BackupErrorKind::Cancelled`.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Call at a suspension point. Returns an error once cancellation has
    /// been requested; otherwise a no-op.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            Err(BackupErrorKind::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let tok = CancellationToken::new();
        assert!(!tok.is_cancelled());
        assert!(tok.check().is_ok());
    }

    #[test]
    fn cancel_is_visible_across_clones() {
        let tok = CancellationToken::new();
        let clone = tok.clone();
        clone.cancel();
        assert!(tok.is_cancelled());
        assert!(tok.check().is_err());
    }
}
