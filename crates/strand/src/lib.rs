//! Strand
//!
//! A user-space scheduler for stackless tasks:
//! - **Scheduler**: ready/running sets, batch draining, cross-scheduler task
//!   handoff (`scheduler` module)
//! - **Timers**: deadline manager ticked once per batch, `Sleep` future
//!   (`timer` module)
//! - **Errors**: the error vocabulary reported by awaitable primitives
//!   (`error` module)
//!
//! No threads are created here. A scheduler runs on whichever thread calls
//! [`Scheduler::run_one_batch`] or [`Scheduler::run_until_notask`].
//!
//! # Example
//!
//! ```rust,ignore
//! use strand::{yield_now, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let mut handle = scheduler.spawn(async {
//!     yield_now().await;
//!     42
//! });
//!
//! scheduler.run_until_notask();
//! assert_eq!(handle.try_result(), Ok(42));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Scheduler configuration and environment overrides
pub mod config;

/// Error codes shared by awaitable primitives
pub mod error;

/// Scheduler, tasks, and thread binding
pub mod scheduler;

/// Low-level synchronization
pub mod sync;

/// Deadline timers
pub mod timer;

pub use config::{ConfigError, SchedulerConfig};
pub use error::{error_string, ErrorCode, FutureError, FutureResult};
pub use scheduler::{
    default_scheduler, spawn, switch_to, this_scheduler, yield_now, JoinHandle, LocalScheduler,
    Resumed, Scheduler, SchedulerId, SchedulerStats, State, StateId, StatePhase, Task,
};
pub use timer::{sleep_for, sleep_until, Sleep, TimerId, TimerManager};
