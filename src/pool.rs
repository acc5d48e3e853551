//! A bounded set of reusable resources (in practice, Redis connections -
//! the Redis client isn't safe for concurrent use by multiple workers)
//! with blocking acquire. Acquisition is lock-free on the common path: a
//! cursor hint plus a per-slot atomic flag. Contention falls back to a
//! single mutex + condvar.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct Slot<T> {
    in_use: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: exclusive access to `value` is only ever granted to the single
// borrower that won the `in_use` compare-exchange, and it's released
// again (store(false)) only after that borrower drops its handle.
unsafe impl<T: Send> Sync for Slot<T> {}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    cursor: AtomicUsize,
    wake: Mutex<()>,
    condvar: Condvar,
}

/// A bounded pool of `N` reusable resources.
pub struct BorrowPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BorrowPool<T> {
    fn clone(&self) -> Self {
        BorrowPool {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BorrowPool<T> {
    pub fn new(resources: Vec<T>) -> Self {
        let slots = resources
            .into_iter()
            .map(|value| Slot {
                in_use: AtomicBool::new(false),
                value: UnsafeCell::new(value),
            })
            .collect();

        BorrowPool {
            inner: Arc::new(Inner {
                slots,
                cursor: AtomicUsize::new(0),
                wake: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    fn try_acquire(&self) -> Option<usize> {
        let n = self.inner.slots.len();
        if n == 0 {
            return None;
        }

        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if self.inner.slots[idx]
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }

        None
    }

    /// Block up to `timeout` for a free slot. Returns `None` if the
    /// timeout elapses first.
    pub fn borrow(&self, timeout: Duration) -> Option<PoolHandle<T>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(idx) = self.try_acquire() {
                return Some(PoolHandle {
                    pool: self.clone(),
                    index: idx,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let guard = self.inner.wake.lock().unwrap();
            // Re-check under the lock: a release may have happened between
            // our failed `try_acquire` and taking the mutex.
            if let Some(idx) = self.try_acquire() {
                return Some(PoolHandle {
                    pool: self.clone(),
                    index: idx,
                });
            }

            let (_guard, timeout_result) = self
                .condvar
                .wait_timeout(guard, deadline - now)
                .expect("borrow pool mutex poisoned");

            if timeout_result.timed_out() {
                // One more attempt: a wakeup and this timeout can race.
                if let Some(idx) = self.try_acquire() {
                    return Some(PoolHandle {
                        pool: self.clone(),
                        index: idx,
                    });
                }
                return None;
            }
        }
    }
}

impl<T> std::ops::Deref for BorrowPool<T> {
    type Target = Arc<Inner<T>>;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Exclusive ownership of one pooled resource. Dropping it returns the
/// slot and wakes at most one waiter.
pub struct PoolHandle<T> {
    pool: BorrowPool<T>,
    index: usize,
}

impl<T> std::ops::Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the slot's `in_use` flag, so no other handle can
        // alias this value.
        unsafe { &*self.pool.inner.slots[self.index].value.get() }
    }
}

impl<T> std::ops::DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: same as `Deref` - exclusive by construction.
        unsafe { &mut *self.pool.inner.slots[self.index].value.get() }
    }
}

impl<T> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        self.pool.inner.slots[self.index]
            .in_use
            .store(false, Ordering::Release);
        let _guard = self.pool.inner.wake.lock().unwrap();
        self.pool.condvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrow_grants_exclusive_access() {
        let pool = BorrowPool::new(vec![1, 2]);
        let a = pool.borrow(Duration::from_millis(100)).unwrap();
        let b = pool.borrow(Duration::from_millis(100)).unwrap();
        assert_ne!(*a, *b);
        assert!(pool.borrow(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn dropping_a_handle_frees_the_slot() {
        let pool = BorrowPool::new(vec![1]);
        {
            let _a = pool.borrow(Duration::from_millis(100)).unwrap();
            assert!(pool.borrow(Duration::from_millis(10)).is_none());
        }
        assert!(pool.borrow(Duration::from_millis(100)).is_some());
    }

    #[test]
    fn concurrent_borrowers_never_alias_a_slot() {
        let pool = BorrowPool::new(vec![0u32; 4]);
        let mut handles = Vec::new();

        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                if let Some(mut h) = pool.borrow(Duration::from_secs(1)) {
                    let before = *h;
                    *h = before.wrapping_add(1);
                    std::thread::sleep(Duration::from_millis(5));
                    assert_eq!(*h, before.wrapping_add(1));
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
