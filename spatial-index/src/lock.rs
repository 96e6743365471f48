use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-store read-write lock with a modification generation.
///
/// Every store owns exactly one `LockManager`; there is no process-wide lock
/// table. Mutations hold a [`WriteGuard`] and bump the generation when the
/// guard is released, so search iterators can detect that the tree changed
/// underneath them by comparing generations.
///
/// # Examples
///
/// ```
/// use spatial_index::LockManager;
///
/// let locks = LockManager::new();
/// let before = locks.generation();
/// {
///     let _read = locks.read();
/// }
/// assert_eq!(locks.generation(), before);
/// {
///     let _write = locks.write();
/// }
/// assert_eq!(locks.generation(), before + 1);
/// ```
#[derive(Clone, Default)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
}

#[derive(Default)]
struct LockManagerInner {
    lock: RwLock<()>,
    generation: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager::default()
    }

    /// Acquires a shared lock
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.lock.read()
    }

    /// Acquires the exclusive lock
    pub fn write(&self) -> WriteGuard<'_> {
        WriteGuard {
            _guard: self.inner.lock.write(),
            generation: &self.inner.generation,
        }
    }

    /// Number of write guards released so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }
}

/// Exclusive guard returned by [`LockManager::write`].
pub struct WriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    generation: &'a AtomicU64,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // bumped while the lock is still held
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
