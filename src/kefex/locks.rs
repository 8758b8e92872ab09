//! Per-category mutual exclusion of protocol services. At most one request of each category is in
//! flight; segmented transfers refuse to wait and report busy instead.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::error::Error;
use crate::Result;

#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter)]
pub enum LockCategory {
    Logon,
    AbortIndividual,
    AbortAll,
    ImmediateWrite,
    EepromRead,
    EepromWrite,
    UpdateTask,
    SegmentedRead,
    SegmentedWrite,
    GenericRequest,
}

#[derive(Default)]
struct CategoryLock {
    mutex: Mutex<()>,
    outstanding: AtomicU32,
}

pub struct LockSet {
    locks: Vec<CategoryLock>,
}

impl Default for LockSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LockSet {
    pub fn new() -> Self {
        Self {
            locks: LockCategory::iter().map(|_| CategoryLock::default()).collect(),
        }
    }

    fn lock(&self, category: LockCategory) -> &CategoryLock {
        &self.locks[category as usize]
    }

    /// Block until the category is free.
    pub fn acquire(&self, category: LockCategory) -> CategoryGuard<'_> {
        let lock = self.lock(category);
        let guard = lock.mutex.lock();
        lock.outstanding.fetch_add(1, Ordering::SeqCst);
        CategoryGuard {
            _guard: guard,
            outstanding: &lock.outstanding,
        }
    }

    /// Take the category if it is free, [`Error::Busy`] otherwise.
    pub fn try_acquire(&self, category: LockCategory) -> Result<CategoryGuard<'_>> {
        let lock = self.lock(category);
        let guard = lock.mutex.try_lock().ok_or(Error::Busy)?;
        lock.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(CategoryGuard {
            _guard: guard,
            outstanding: &lock.outstanding,
        })
    }

    /// Number of requests of this category currently in flight.
    pub fn outstanding(&self, category: LockCategory) -> u32 {
        self.lock(category).outstanding.load(Ordering::SeqCst)
    }
}

/// Held for the duration of one request. Releases the category when dropped, on every exit path.
pub struct CategoryGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    outstanding: &'a AtomicU32,
}

impl Drop for CategoryGuard<'_> {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segmented_transfers_report_busy() {
        let locks = LockSet::new();
        let guard = locks.try_acquire(LockCategory::SegmentedRead).unwrap();
        assert!(matches!(
            locks.try_acquire(LockCategory::SegmentedRead),
            Err(Error::Busy)
        ));
        // Other categories are independent
        assert!(locks.try_acquire(LockCategory::SegmentedWrite).is_ok());
        drop(guard);
        assert!(locks.try_acquire(LockCategory::SegmentedRead).is_ok());
    }

    #[test]
    fn released_on_error_paths() {
        let locks = LockSet::new();
        let failing = || -> Result<()> {
            let _guard = locks.acquire(LockCategory::Logon);
            Err(Error::Timeout)
        };
        assert!(failing().is_err());
        for category in LockCategory::iter() {
            assert_eq!(locks.outstanding(category), 0);
        }
    }
}
