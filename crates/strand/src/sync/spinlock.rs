//! Minimal spinning mutual exclusion for short, non-blocking critical sections

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Spinlock guarding a value of type `T`
///
/// Not re-entrant: locking twice from the same call path spins forever.
/// Critical sections must stay O(1) and must never call back into code that
/// could take the same lock.
pub struct Spinlock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`.
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create an unlocked spinlock
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Consume the lock, returning the protected value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquire the lock, spinning until it is available
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinlockGuard { lock: self };
            }
            // Spin on a plain load so contended waiters don't bounce the cache line
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }

    /// Whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access without locking (exclusive borrow proves no guard exists)
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Spinlock").field("data", &&*guard).finish(),
            None => f.debug_struct("Spinlock").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard; releases the lock on drop
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let lock = Spinlock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = Spinlock::new(());
        let guard = lock.try_lock();
        assert!(guard.is_some());

        // Held - second attempt fails instead of spinning
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_get_mut_and_into_inner() {
        let mut lock = Spinlock::new(vec![1, 2]);
        lock.get_mut().push(3);
        assert_eq!(lock.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn test_debug_while_locked() {
        let lock = Spinlock::new(7);
        assert!(format!("{:?}", lock).contains('7'));

        let _guard = lock.lock();
        assert!(format!("{:?}", lock).contains("<locked>"));
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let counter = Arc::new(Spinlock::new(0u64));
        let threads = 4;
        let iterations = 10_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..iterations {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), threads * iterations);
    }
}
