//! Timer-backed sleep future

use super::{TimerId, TimerManager, TimerSlot};
use crate::error::{ErrorCode, FutureError, FutureResult};
use crate::scheduler::{this_scheduler, State};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Sleep for `duration`
///
/// The timer lives on the scheduler driving the task that first polls the
/// sleep, or on [`this_scheduler`] when polled outside one. A sleep created
/// before `switch_to` and awaited after it therefore arms on the new
/// scheduler.
pub fn sleep_for(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

/// Sleep until `deadline`
///
/// See [`sleep_for`] for how the timer's scheduler is chosen.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        timers: None,
        deadline,
        armed: None,
    }
}

fn driving_timers() -> Arc<TimerManager> {
    let scheduler = State::current()
        .and_then(|state| state.scheduler())
        .unwrap_or_else(this_scheduler);
    Arc::clone(scheduler.timer())
}

/// Future that resolves once its deadline passes
///
/// The timer is armed on first poll and fires on the owning scheduler's next
/// batch at or after the deadline, even when the deadline is already in the
/// past. Resolves to `timer_canceled` if the timer is canceled first
/// (for example by [`Scheduler::break_all`](crate::Scheduler::break_all)). Dropping an unfired sleep
/// removes its timer without waking anyone.
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    /// Bound at construction by `Scheduler::sleep_*`, else on first poll
    timers: Option<Arc<TimerManager>>,
    deadline: Instant,
    armed: Option<(TimerId, Arc<TimerSlot>)>,
}

impl Sleep {
    pub(crate) fn new(timers: Arc<TimerManager>, deadline: Instant) -> Self {
        Self {
            timers: Some(timers),
            deadline,
            armed: None,
        }
    }

    /// When the sleep fires
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Timer backing this sleep, once armed
    pub fn timer_id(&self) -> Option<TimerId> {
        self.armed.as_ref().map(|(id, _)| *id)
    }

    /// Cancel the timer, resolving this sleep with `timer_canceled`
    ///
    /// Returns `false` if the sleep was never polled or already resolved.
    pub fn cancel(&self) -> bool {
        match (&self.timers, self.timer_id()) {
            (Some(timers), Some(id)) => timers.cancel(id),
            _ => false,
        }
    }
}

impl Future for Sleep {
    type Output = FutureResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let slot = match &this.armed {
            Some((_, slot)) => Arc::clone(slot),
            None => {
                let timers = this.timers.get_or_insert_with(driving_timers);
                let (id, slot) = timers.arm(this.deadline, Some(cx.waker().clone()));
                this.armed = Some((id, Arc::clone(&slot)));
                slot
            }
        };

        if slot.is_pending() {
            slot.register(cx.waker());
            // Settled while registering
            if slot.is_pending() {
                return Poll::Pending;
            }
        }

        if slot.is_fired() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(FutureError::qualified(ErrorCode::TimerCanceled, "sleep")))
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let (Some(timers), Some((id, slot))) = (&self.timers, &self.armed) {
            if slot.is_pending() {
                timers.forget(*id);
            }
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("timer", &self.timer_id())
            .finish()
    }
}
