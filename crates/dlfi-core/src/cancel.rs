//! Cooperative cancellation for long-running operations

use crate::error::{DlfiError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag. Cloning yields a handle to the same flag.
///
/// Long-running operations (export, bulk delete, rekey, vacuum) poll the
/// token between transactional chunks and return `Cancelled` after
/// finishing the current chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Err(Cancelled) once the token has been triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DlfiError::Cancelled)
        } else {
            Ok(())
        }
    }
}
