//! Resumable unit: a boxed future plus the metadata the scheduler needs to
//! drive it
//!
//! A [`State`] is shared (`Arc`) between the running set that will resume it,
//! wakers held by whatever it is waiting on, and the [`Task`](super::Task)
//! that owns it. Exactly one resumption is ever in flight: polling requires
//! winning the `Idle -> Running` transition on `phase`.

use crate::scheduler::scheduler::{Scheduler, SchedulerCore};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use tracing::trace;

/// Type-erased future driven by the scheduler
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Stable identity of a [`State`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

impl StateId {
    fn next() -> Self {
        StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// Lifecycle phase of a [`State`]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatePhase {
    /// Suspended (or never polled); may be resumed
    Idle = 0,
    /// A resumption is in flight
    Running = 1,
    /// The future ran to completion
    Complete = 2,
    /// The owning task was dropped before completion
    Canceled = 3,
}

const IDLE: u8 = StatePhase::Idle as u8;
const RUNNING: u8 = StatePhase::Running as u8;
const COMPLETE: u8 = StatePhase::Complete as u8;
const CANCELED: u8 = StatePhase::Canceled as u8;

impl StatePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            IDLE => Self::Idle,
            RUNNING => Self::Running,
            COMPLETE => Self::Complete,
            _ => Self::Canceled,
        }
    }

    /// Whether no further resumption can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled)
    }
}

/// Outcome of a single resumption
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resumed {
    /// The future returned `Pending` and may be resumed again
    Suspended,
    /// The future finished; the owning scheduler has been told to drop its task
    Finished,
}

thread_local! {
    /// State currently being polled on this thread.
    static CURRENT_STATE: RefCell<Option<Arc<State>>> = const { RefCell::new(None) };
}

/// Installs a state as current for the duration of a poll, restoring the
/// previous one afterwards (resumptions can nest).
struct CurrentGuard {
    prev: Option<Arc<State>>,
}

impl CurrentGuard {
    fn enter(state: Arc<State>) -> Self {
        let prev = CURRENT_STATE.with(|current| current.replace(Some(state)));
        Self { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let ours = CURRENT_STATE.with(|current| current.replace(prev));
        drop(ours);
    }
}

/// Marks a state canceled if its poll unwinds, so it is never treated as
/// running again, and drops its task from the owning ready set.
struct UnwindGuard<'a> {
    state: &'a State,
    armed: bool,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.state.phase.store(CANCELED, Ordering::SeqCst);
        self.state.scheduled.store(true, Ordering::SeqCst);
        if let Some(owner) = self.state.scheduler() {
            owner.del_final(self.state);
        }
    }
}

/// The resumable unit
pub struct State {
    id: StateId,

    /// `StatePhase` as u8
    phase: AtomicU8,

    /// Set while queued in a running set; sticky once terminal
    scheduled: AtomicBool,

    /// Owning task dropped
    canceled: AtomicBool,

    /// Something is awaiting or explicitly driving this state
    has_consumer: AtomicBool,

    /// Scheduler responsible for resuming this state (non-owning)
    owner: Mutex<Weak<SchedulerCore>>,

    /// Taken out while polling so no lock is held across user code
    future: Mutex<Option<BoxFuture>>,
}

impl State {
    pub(crate) fn new(future: BoxFuture) -> Arc<Self> {
        Arc::new(Self {
            id: StateId::next(),
            phase: AtomicU8::new(IDLE),
            scheduled: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            has_consumer: AtomicBool::new(false),
            owner: Mutex::new(Weak::new()),
            future: Mutex::new(Some(future)),
        })
    }

    /// Stable identity
    pub fn id(&self) -> StateId {
        self.id
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> StatePhase {
        StatePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Completed or canceled
    pub fn is_finished(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Whether the state currently sits in a running set
    pub fn is_scheduled(&self) -> bool {
        !self.is_finished() && self.scheduled.load(Ordering::SeqCst)
    }

    /// Whether a continuation consumer is attached
    pub fn has_consumer(&self) -> bool {
        self.has_consumer.load(Ordering::Acquire)
    }

    /// Attach a continuation consumer
    ///
    /// The first attachment admits the state into its scheduler's running set
    /// (if it has one). Returns `false` if a consumer was already attached.
    pub fn attach_consumer(self: &Arc<Self>) -> bool {
        if self.has_consumer.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(scheduler) = self.scheduler() {
            scheduler.add_generator(self);
        }
        true
    }

    /// Scheduler currently responsible for this state, if it is still alive
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.owner.lock().upgrade().map(Scheduler::from_core)
    }

    /// Point this state at `scheduler`
    ///
    /// Set once at registration; changing it afterwards is the backpointer step
    /// of migration and the caller must ensure the state is not concurrently
    /// resumable under the old scheduler.
    pub fn set_scheduler(&self, scheduler: &Scheduler) {
        let previous = std::mem::replace(&mut *self.owner.lock(), scheduler.downgrade());
        if let Some(previous) = previous.upgrade() {
            if !Arc::ptr_eq(&previous, scheduler.core()) {
                trace!(state = %self.id, to = %scheduler.id(), "scheduler backpointer moved");
            }
        }
    }

    /// State being polled on the calling thread, if any
    pub fn current() -> Option<Arc<State>> {
        CURRENT_STATE.with(|current| current.borrow().clone())
    }

    /// Drive the future forward one step
    ///
    /// # Panics
    ///
    /// Panics if the state is already being resumed, or has finished.
    pub fn resume(self: &Arc<Self>) -> Resumed {
        match self
            .phase
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => self.step(),
            Err(RUNNING) => panic!("{} resumed while already running", self.id),
            Err(_) => panic!("{} resumed after it finished", self.id),
        }
    }

    /// Mark queued; `false` if already queued or terminal
    pub(crate) fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::SeqCst)
    }

    /// Clear the queued mark of a live state dropped from a running set
    pub(crate) fn unschedule(&self) {
        if !self.is_finished() {
            self.scheduled.store(false, Ordering::SeqCst);
        }
    }

    /// Resume as part of `scheduler`'s batch
    ///
    /// Unlike [`State::resume`] this never panics: a state migrated elsewhere is
    /// forwarded to its new owner, a state still running on another thread is
    /// deferred to the next batch, and a finished state is skipped. Returns
    /// whether the future was polled.
    pub(crate) fn run_in_batch(self: &Arc<Self>, scheduler: &Scheduler) -> bool {
        if let Some(owner) = self.scheduler() {
            if !owner.ptr_eq(scheduler) {
                trace!(state = %self.id, from = %scheduler.id(), to = %owner.id(), "forwarding migrated state");
                owner.push_running(Arc::clone(self));
                return false;
            }
        }

        match self
            .phase
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(RUNNING) => {
                trace!(state = %self.id, "still running elsewhere, deferred");
                scheduler.push_running(Arc::clone(self));
                return false;
            }
            Err(_) => {
                trace!(state = %self.id, "finished before its batch, skipped");
                return false;
            }
        }

        // Wakes raised from here on land in the next batch
        self.scheduled.store(false, Ordering::SeqCst);
        self.step();
        true
    }

    /// Cancel on behalf of the dropped owning task
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.cancel_if_idle();
    }

    /// Poll once. Caller has moved `phase` to `Running`.
    fn step(self: &Arc<Self>) -> Resumed {
        let taken = self.future.lock().take();
        let Some(mut future) = taken else {
            self.phase.store(CANCELED, Ordering::SeqCst);
            self.scheduled.store(true, Ordering::SeqCst);
            return Resumed::Finished;
        };

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let _current = CurrentGuard::enter(Arc::clone(self));
            let mut unwind = UnwindGuard {
                state: self,
                armed: true,
            };
            let poll = future.as_mut().poll(&mut cx);
            unwind.armed = false;
            poll
        };

        match poll {
            Poll::Ready(()) => {
                drop(future);
                self.finalize();
                Resumed::Finished
            }
            Poll::Pending => {
                self.suspend(future);
                Resumed::Suspended
            }
        }
    }

    fn finalize(&self) {
        self.phase.store(COMPLETE, Ordering::SeqCst);
        self.scheduled.store(true, Ordering::SeqCst);
        if let Some(owner) = self.scheduler() {
            owner.record_completion();
            owner.del_final(self);
        }
    }

    fn suspend(&self, future: BoxFuture) {
        if self.canceled.load(Ordering::SeqCst) {
            self.phase.store(CANCELED, Ordering::SeqCst);
            self.scheduled.store(true, Ordering::SeqCst);
            drop(future);
            trace!(state = %self.id, "canceled during resumption");
            return;
        }

        *self.future.lock() = Some(future);
        self.phase.store(IDLE, Ordering::SeqCst);

        // The owner may have been dropped between the check above and the
        // store; exactly one of us wins the Idle -> Canceled transition.
        if self.canceled.load(Ordering::SeqCst) {
            self.cancel_if_idle();
        }
    }

    fn cancel_if_idle(&self) {
        if self
            .phase
            .compare_exchange(IDLE, CANCELED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.scheduled.store(true, Ordering::SeqCst);
            let future = self.future.lock().take();
            drop(future);
            trace!(state = %self.id, "canceled");
        }
    }
}

impl Wake for State {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        match self.scheduler() {
            Some(scheduler) => {
                scheduler.add_generator(self);
            }
            None => trace!(state = %self.id, "wake ignored, no scheduler"),
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("has_consumer", &self.has_consumer())
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}
