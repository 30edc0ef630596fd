//! Task Scheduler: batch-draining core
//!
//! Each scheduler owns a ready set (every live task) and a running set (states
//! due in the next batch). The batch loop swaps the running set out under its
//! lock and resumes the captured states with no lock held, so resumed code can
//! re-enter the scheduler freely. Tasks move between schedulers through the
//! `del_switch`/`add_switch` handoff.

mod local;
#[allow(clippy::module_inception)]
mod scheduler;
mod state;
mod switch;
mod task;
mod yield_now;

pub use local::{default_scheduler, spawn, this_scheduler, LocalScheduler};
pub use scheduler::{Scheduler, SchedulerId, SchedulerStats};
pub use state::{Resumed, State, StateId, StatePhase};
pub use switch::{switch_to, SwitchScheduler};
pub use task::{JoinHandle, Task};
pub use yield_now::{yield_now, YieldNow};
