//! Lock used for the shared pool
//!
//! Everything in the crate takes the shared-pool lock through [PoolLock] so
//! that `--cfg loom` builds see loom's mutex, and so that the
//! `single-threaded` feature can swap it out for a plain `RefCell`.

#[cfg(all(loom, not(feature = "single-threaded")))]
pub use loom::sync::{Mutex, MutexGuard};
#[cfg(all(not(loom), not(feature = "single-threaded")))]
pub use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "single-threaded")]
use std::cell::{RefCell, RefMut};

/// Guard returned by [PoolLock::lock]
#[cfg(not(feature = "single-threaded"))]
pub type PoolGuard<'a, T> = MutexGuard<'a, T>;
/// Guard returned by [PoolLock::lock]
#[cfg(feature = "single-threaded")]
pub type PoolGuard<'a, T> = RefMut<'a, T>;

/// The one lock over the whole shared pool
pub struct PoolLock<T> {
    #[cfg(not(feature = "single-threaded"))]
    inner: Mutex<T>,
    #[cfg(feature = "single-threaded")]
    inner: RefCell<T>,
}

impl<T> PoolLock<T> {
    pub fn new(x: T) -> Self {
        Self {
            #[cfg(not(feature = "single-threaded"))]
            inner: Mutex::new(x),
            #[cfg(feature = "single-threaded")]
            inner: RefCell::new(x),
        }
    }

    /// Enter the critical section
    ///
    /// A poisoned lock is taken anyway: every critical section finishes
    /// relinking before it runs anything that could panic.
    #[cfg(not(feature = "single-threaded"))]
    #[inline]
    pub fn lock(&self) -> PoolGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enter the critical section
    ///
    /// Panics on reentrant use, which would be a bug in this crate.
    #[cfg(feature = "single-threaded")]
    #[inline]
    pub fn lock(&self) -> PoolGuard<'_, T> {
        self.inner.borrow_mut()
    }
}
