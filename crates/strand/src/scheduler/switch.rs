//! Awaitable migration of the running task to another scheduler

use crate::scheduler::scheduler::Scheduler;
use crate::scheduler::state::State;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// Move the calling task to `target`
///
/// Ownership moves to `target`'s ready set and the task is queued there; the
/// code after the `.await` runs on whichever thread drains `target`.
/// Completes immediately when the task already belongs to `target` or when
/// awaited outside a scheduler-driven task.
pub fn switch_to(target: &Scheduler) -> SwitchScheduler {
    SwitchScheduler {
        target: target.clone(),
        switched: false,
    }
}

/// Future returned by [`switch_to`]
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct SwitchScheduler {
    target: Scheduler,
    switched: bool,
}

impl Future for SwitchScheduler {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.switched {
            return Poll::Ready(());
        }
        let Some(state) = State::current() else {
            return Poll::Ready(());
        };
        let Some(source) = state.scheduler() else {
            return Poll::Ready(());
        };
        if source.ptr_eq(&self.target) {
            return Poll::Ready(());
        }

        if !source.migrate(&state, &self.target) {
            debug!(state = %state.id(), scheduler = %source.id(), "switch skipped, task not owned by its scheduler");
            return Poll::Ready(());
        }
        self.switched = true;
        self.target.add_generator(&state);
        Poll::Pending
    }
}
