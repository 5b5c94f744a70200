//! Cooperative cancellation
//!
//! Every blocking wait in tessera takes an [`AbortToken`]. Whoever owns the
//! operation can abort it from another thread; the waiter notices on its next
//! poll and unwinds with [`TesseraError::Aborted`].

use crate::error::{Result, TesseraError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "operation aborted" flag
///
/// Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    aborted: Arc<AtomicBool>,
}

impl AbortToken {
    /// A token that has not been aborted
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the operation aborted
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Whether the operation was aborted
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// `Err(Aborted)` once the token has fired
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(TesseraError::Aborted)
        } else {
            Ok(())
        }
    }
}
