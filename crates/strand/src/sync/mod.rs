//! Synchronization primitives used by the scheduler core

mod spinlock;

pub use spinlock::{Spinlock, SpinlockGuard};
