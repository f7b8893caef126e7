//! Small building blocks shared by the cubes

use crate::error::{CubeError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A value computed on first access and cached until invalidated
///
/// The initializer runs without holding the slot lock, so it may itself read
/// other lazy fields of the same owner.
pub struct LazyField<T> {
    slot: RwLock<Option<Arc<T>>>,
}

impl<T> Default for LazyField<T> {
    fn default() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }
}

impl<T> LazyField<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value, if materialized
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.read().clone()
    }

    pub fn get_or_try_init(&self, init: impl FnOnce() -> Result<T>) -> Result<Arc<T>> {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        let value = Arc::new(init()?);
        let mut slot = self.slot.write();
        // keep a value another caller stored while we were computing
        Ok(Arc::clone(slot.get_or_insert(value)))
    }

    pub fn set(&self, value: T) {
        *self.slot.write() = Some(Arc::new(value));
    }

    pub fn invalidate(&self) {
        self.slot.write().take();
    }

    pub fn is_materialized(&self) -> bool {
        self.slot.read().is_some()
    }
}

/// Cooperative cancellation flag for long cube-wide loops
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) has been called
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CubeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Check an optional token
pub(crate) fn check_cancelled(token: Option<&CancelToken>) -> Result<()> {
    token.map_or(Ok(()), CancelToken::check)
}

/// Human-readable size of a scanned region, e.g. `1.50 MB`
pub fn format_bytes(bytes: usize) -> String {
    const SUFFIXES: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut scaled = bytes as f64 / 1024.0;
    let mut suffix = SUFFIXES[0];
    for next in &SUFFIXES[1..] {
        if scaled < 1024.0 {
            break;
        }
        scaled /= 1024.0;
        suffix = *next;
    }
    format!("{:.2} {}", scaled, suffix)
}
