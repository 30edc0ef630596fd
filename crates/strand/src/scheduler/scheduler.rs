//! Scheduler: ready set, running set, and the batch-draining loop

use crate::config::SchedulerConfig;
use crate::scheduler::state::{State, StateId};
use crate::scheduler::task::{JoinHandle, Task};
use crate::sync::Spinlock;
use crate::timer::{Sleep, TimerManager};
use rustc_hash::FxHashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Unique identifier for a Scheduler
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SchedulerId(u64);

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

impl SchedulerId {
    fn next() -> Self {
        SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduler#{}", self.0)
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks registered through `new_task`
    pub tasks_registered: u64,

    /// States that ran to completion while owned by this scheduler
    pub tasks_completed: u64,

    /// Non-empty batches drained
    pub batches_run: u64,

    /// Individual resumptions performed by batches
    pub states_resumed: u64,

    /// Current ready-set size
    pub ready_tasks: usize,

    /// Current running-set size
    pub queued_states: usize,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    completed: AtomicU64,
    batches: AtomicU64,
    resumed: AtomicU64,
}

pub(crate) struct SchedulerCore {
    id: SchedulerId,
    config: SchedulerConfig,

    /// Every live task owned by this scheduler
    ready: Spinlock<FxHashMap<StateId, Task>>,

    /// States due for resumption in the next batch
    running: Spinlock<Vec<Arc<State>>>,

    /// Spare buffer swapped with `running` at the start of a batch
    scratch: Spinlock<Vec<Arc<State>>>,

    timer: Arc<TimerManager>,
    counters: Counters,
}

/// Handle to a scheduler instance
///
/// Cloning is cheap and every clone refers to the same instance. All
/// operations may be called from any thread, including from inside a task
/// the scheduler is currently resuming.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Create a scheduler with default configuration
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with the given configuration
    pub fn with_config(config: SchedulerConfig) -> Self {
        let capacity = config.initial_capacity;
        Self {
            core: Arc::new(SchedulerCore {
                id: SchedulerId::next(),
                config,
                ready: Spinlock::new(FxHashMap::default()),
                running: Spinlock::new(Vec::with_capacity(capacity)),
                scratch: Spinlock::new(Vec::with_capacity(capacity)),
                timer: Arc::new(TimerManager::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<SchedulerCore> {
        &self.core
    }

    pub(crate) fn downgrade(&self) -> Weak<SchedulerCore> {
        Arc::downgrade(&self.core)
    }

    /// Identity of this instance
    pub fn id(&self) -> SchedulerId {
        self.core.id
    }

    /// Configuration this scheduler was built with
    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Whether both handles refer to the same instance
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Timer manager ticked at the start of every batch
    pub fn timer(&self) -> &Arc<TimerManager> {
        &self.core.timer
    }

    /// Register a task
    ///
    /// The task joins the ready set. Its state is also queued for the next
    /// batch only if a continuation consumer is already attached; otherwise it
    /// stays dormant until something awaits it or calls `add_generator`.
    pub fn new_task(&self, task: Task) -> StateId {
        let state = Arc::clone(task.state());
        let id = state.id();
        state.set_scheduler(self);

        let previous = self.core.ready.lock().insert(id, task);
        debug_assert!(previous.is_none(), "{} registered twice", id);
        self.core.counters.registered.fetch_add(1, Ordering::Relaxed);
        debug!(state = %id, scheduler = %self.core.id, consumer = state.has_consumer(), "task registered");

        // Finished before (or while) being registered
        if state.is_finished() {
            self.del_final(&state);
            return id;
        }

        if state.has_consumer() {
            self.add_generator(&state);
        }
        id
    }

    /// Queue a state for the next batch
    ///
    /// Returns `false` without queueing when the state is already queued
    /// somewhere or has finished.
    pub fn add_generator(&self, state: &Arc<State>) -> bool {
        if !state.try_schedule() {
            trace!(state = %state.id(), "already queued or finished");
            return false;
        }
        self.push_running(Arc::clone(state));
        true
    }

    /// Append to the running set without touching the queued mark
    pub(crate) fn push_running(&self, state: Arc<State>) {
        self.core.running.lock().push(state);
    }

    pub(crate) fn record_completion(&self) {
        self.core.counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a finished state's task from the ready set, dropping it
    ///
    /// Returns whether the task was present.
    pub fn del_final(&self, state: &State) -> bool {
        let task = self.core.ready.lock().remove(&state.id());
        let removed = task.is_some();
        // Dropped outside the lock: dropping a task may run arbitrary destructors
        drop(task);
        removed
    }

    /// Detach a task from this scheduler's ready set for migration
    ///
    /// `None` when the state already finished or was migrated away
    /// concurrently; that race is expected, not an error.
    pub fn del_switch(&self, state: &State) -> Option<Task> {
        let task = self.core.ready.lock().remove(&state.id());
        if task.is_some() {
            debug!(state = %state.id(), scheduler = %self.core.id, "task detached");
        }
        task
    }

    /// Adopt a task detached from another scheduler
    ///
    /// Ownership only: the caller points the state's backpointer here and
    /// calls `add_generator` once it should run.
    pub fn add_switch(&self, task: Task) {
        let state = Arc::clone(task.state());
        let id = state.id();
        let previous = self.core.ready.lock().insert(id, task);
        debug_assert!(previous.is_none(), "{} adopted twice", id);
        debug!(state = %id, scheduler = %self.core.id, "task adopted");

        // Completed while in transit; its del_final went to a scheduler that
        // no longer held it.
        if state.is_finished() {
            self.del_final(&state);
        }
    }

    /// Move a task's ownership and backpointer to `target`
    ///
    /// Does not queue it on `target`. Returns `false` if this scheduler does
    /// not own the state.
    pub fn migrate(&self, state: &Arc<State>, target: &Scheduler) -> bool {
        if self.ptr_eq(target) {
            return self.contains(state.id());
        }
        match self.del_switch(state) {
            Some(task) => {
                state.set_scheduler(target);
                target.add_switch(task);
                true
            }
            None => false,
        }
    }

    /// Create a task, attach a consumer, and register it so it runs in the
    /// next batch
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (task, handle) = Task::with_handle(future);
        task.state().attach_consumer();
        self.new_task(task);
        handle
    }

    /// Future that completes after `duration`, driven by this scheduler's timers
    pub fn sleep_for(&self, duration: Duration) -> Sleep {
        self.sleep_until(Instant::now() + duration)
    }

    /// Future that completes at `deadline`, driven by this scheduler's timers
    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        Sleep::new(Arc::clone(&self.core.timer), deadline)
    }

    /// Drain one batch
    ///
    /// Ticks the timers, swaps the running set out under its lock, then resumes
    /// every captured state in order with no lock held. States queued while
    /// the batch runs wait for the next one. Returns the number of states
    /// captured.
    pub fn run_one_batch(&self) -> usize {
        self.core.timer.update();

        let mut batch = std::mem::take(&mut *self.core.scratch.lock());
        {
            let mut running = self.core.running.lock();
            if running.is_empty() {
                drop(running);
                self.recycle(batch);
                return 0;
            }
            std::mem::swap(&mut *running, &mut batch);
        }

        let captured = batch.len();
        trace!(scheduler = %self.core.id, captured, "batch start");

        let mut drain = BatchDrain {
            scheduler: self,
            batch,
            next: 0,
        };
        let mut resumed = 0u64;
        while drain.next < drain.batch.len() {
            let index = drain.next;
            drain.next += 1;
            if drain.batch[index].run_in_batch(self) {
                resumed += 1;
            }
        }
        let mut batch = std::mem::take(&mut drain.batch);
        drop(drain);
        batch.clear();
        self.recycle(batch);

        self.core.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.core.counters.resumed.fetch_add(resumed, Ordering::Relaxed);
        captured
    }

    /// Keep the larger buffer around for the next swap
    fn recycle(&self, batch: Vec<Arc<State>>) {
        let mut scratch = self.core.scratch.lock();
        if batch.capacity() > scratch.capacity() {
            *scratch = batch;
        }
    }

    /// Drain batches until the ready set is empty
    ///
    /// Tasks registered without a consumer and never queued keep the ready set
    /// non-empty, so this only returns once every registered task has run to
    /// completion or been removed.
    pub fn run_until_notask(&self) {
        while !self.is_empty() {
            self.run_one_batch();
            if self.core.config.yield_between_batches {
                std::thread::yield_now();
            }
        }
    }

    /// Drop every task, forget every queued state, and cancel every timer
    pub fn break_all(&self) {
        let ready = std::mem::take(&mut *self.core.ready.lock());
        let running = std::mem::take(&mut *self.core.running.lock());
        debug!(scheduler = %self.core.id, tasks = ready.len(), queued = running.len(), "breaking all tasks");

        for state in &running {
            state.unschedule();
        }
        drop(running);
        drop(ready);
        self.core.timer.clear();
    }

    /// No live tasks in the ready set
    pub fn is_empty(&self) -> bool {
        self.core.ready.lock().is_empty()
    }

    /// Number of live tasks owned
    pub fn ready_len(&self) -> usize {
        self.core.ready.lock().len()
    }

    /// Number of states queued for the next batch
    pub fn running_len(&self) -> usize {
        self.core.running.lock().len()
    }

    /// Whether the ready set holds the task owning `id`
    pub fn contains(&self, id: StateId) -> bool {
        self.core.ready.lock().contains_key(&id)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.core.counters;
        SchedulerStats {
            tasks_registered: counters.registered.load(Ordering::Relaxed),
            tasks_completed: counters.completed.load(Ordering::Relaxed),
            batches_run: counters.batches.load(Ordering::Relaxed),
            states_resumed: counters.resumed.load(Ordering::Relaxed),
            ready_tasks: self.ready_len(),
            queued_states: self.running_len(),
        }
    }
}

/// Captured batch being resumed
///
/// If a resumption unwinds, the states not yet reached are still marked
/// queued; dropping the drain hands them back to the running set so they run
/// in a later batch.
struct BatchDrain<'a> {
    scheduler: &'a Scheduler,
    batch: Vec<Arc<State>>,
    next: usize,
}

impl Drop for BatchDrain<'_> {
    fn drop(&mut self) {
        if self.next >= self.batch.len() {
            return;
        }
        let rest: Vec<_> = self.batch.drain(self.next..).collect();
        debug!(scheduler = %self.scheduler.id(), requeued = rest.len(), "batch unwound");
        self.scheduler.core.running.lock().extend(rest);
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        // Queued states may belong to other schedulers by now; clear their
        // queued mark so their owners accept them again.
        for state in self.running.get_mut().drain(..) {
            state.unschedule();
        }
        for state in self.scratch.get_mut().drain(..) {
            state.unschedule();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Scheduler {}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.core.id)
            .field("ready", &self.ready_len())
            .field("running", &self.running_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::StatePhase;
    use std::sync::atomic::AtomicUsize;
    use std::task::Poll;

    /// Task that counts its polls and finishes after `pending_for` suspensions
    fn counting_task(polls: Arc<AtomicUsize>, pending_for: usize) -> Task {
        let mut remaining = pending_for;
        Task::new(std::future::poll_fn(move |cx| {
            polls.fetch_add(1, Ordering::SeqCst);
            if remaining == 0 {
                Poll::Ready(())
            } else {
                remaining -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }))
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.ready_len(), 0);
        assert_eq!(scheduler.running_len(), 0);
        assert_eq!(scheduler.config(), &SchedulerConfig::default());
    }

    #[test]
    fn test_scheduler_identity() {
        let a = Scheduler::new();
        let b = Scheduler::new();
        let a2 = a.clone();
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_task_without_consumer_is_lazy() {
        let scheduler = Scheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(polls.clone(), 0);
        let state = task.state().clone();

        let id = scheduler.new_task(task);
        assert_eq!(id, state.id());
        assert!(scheduler.contains(id));
        assert_eq!(scheduler.running_len(), 0);

        assert_eq!(scheduler.run_one_batch(), 0);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        assert!(state.scheduler().expect("backpointer").ptr_eq(&scheduler));
    }

    #[test]
    fn test_new_task_with_consumer_is_queued() {
        let scheduler = Scheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(polls.clone(), 0);
        task.state().attach_consumer();

        scheduler.new_task(task);
        assert_eq!(scheduler.running_len(), 1);

        assert_eq!(scheduler.run_one_batch(), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_add_generator_dedups() {
        let scheduler = Scheduler::new();
        let task = counting_task(Arc::new(AtomicUsize::new(0)), 0);
        let state = task.state().clone();
        scheduler.new_task(task);

        assert!(scheduler.add_generator(&state));
        assert!(!scheduler.add_generator(&state));
        assert_eq!(scheduler.running_len(), 1);
    }

    #[test]
    fn test_del_final_removes_task() {
        let scheduler = Scheduler::new();
        let task = counting_task(Arc::new(AtomicUsize::new(0)), 0);
        let state = task.state().clone();
        scheduler.new_task(task);

        assert!(scheduler.del_final(&state));
        assert!(!scheduler.del_final(&state));
        assert!(scheduler.is_empty());
        // Dropping the task canceled the state
        assert_eq!(state.phase(), StatePhase::Canceled);
    }

    #[test]
    fn test_del_switch_twice_returns_none() {
        let scheduler = Scheduler::new();
        let task = counting_task(Arc::new(AtomicUsize::new(0)), 0);
        let state = task.state().clone();
        scheduler.new_task(task);

        let detached = scheduler.del_switch(&state);
        assert!(detached.is_some());
        assert!(scheduler.del_switch(&state).is_none());

        // Detached but still owned by us: not canceled
        assert_eq!(state.phase(), StatePhase::Idle);
        drop(detached);
        assert_eq!(state.phase(), StatePhase::Canceled);
    }

    #[test]
    fn test_batch_counts_and_stats() {
        let scheduler = Scheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let task = counting_task(polls.clone(), 1);
            task.state().attach_consumer();
            scheduler.new_task(task);
        }

        assert_eq!(scheduler.run_one_batch(), 3);
        assert_eq!(scheduler.ready_len(), 3);
        assert_eq!(scheduler.running_len(), 3);

        assert_eq!(scheduler.run_one_batch(), 3);
        assert!(scheduler.is_empty());

        let stats = scheduler.stats();
        assert_eq!(stats.tasks_registered, 3);
        assert_eq!(stats.tasks_completed, 3);
        assert_eq!(stats.batches_run, 2);
        assert_eq!(stats.states_resumed, 6);
        assert_eq!(stats.ready_tasks, 0);
        assert_eq!(stats.queued_states, 0);
    }

    #[test]
    fn test_run_until_notask() {
        let scheduler = Scheduler::with_config(SchedulerConfig::default().with_yield_between_batches(false));
        let polls = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let task = counting_task(polls.clone(), 5);
            task.state().attach_consumer();
            scheduler.new_task(task);
        }

        scheduler.run_until_notask();
        assert!(scheduler.is_empty());
        assert_eq!(polls.load(Ordering::SeqCst), 4 * 6);
    }

    #[test]
    fn test_spawn_returns_output() {
        let scheduler = Scheduler::new();
        let mut handle = scheduler.spawn(async { 40 + 2 });

        scheduler.run_until_notask();
        assert_eq!(handle.try_result(), Ok(42));
    }

    #[test]
    fn test_break_all() {
        let scheduler = Scheduler::new();
        let mut states = Vec::new();
        for _ in 0..3 {
            let task = counting_task(Arc::new(AtomicUsize::new(0)), 10);
            task.state().attach_consumer();
            states.push(task.state().clone());
            scheduler.new_task(task);
        }
        let sleeper = scheduler.spawn(scheduler.sleep_for(Duration::from_secs(3600)));
        scheduler.run_one_batch();

        scheduler.break_all();

        assert!(scheduler.is_empty());
        assert_eq!(scheduler.running_len(), 0);
        assert!(scheduler.timer().is_empty());
        for state in &states {
            assert_eq!(state.phase(), StatePhase::Canceled);
        }
        assert!(sleeper.is_finished());
    }

    #[test]
    fn test_finished_task_registered_late() {
        let scheduler = Scheduler::new();
        let task = counting_task(Arc::new(AtomicUsize::new(0)), 0);
        let state = task.state().clone();
        state.resume();

        scheduler.new_task(task);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_panicking_task_does_not_strand_batch() {
        let scheduler = Scheduler::new();
        let failing = Task::new(async {
            panic!("task failed");
        });
        let failing_state = failing.state().clone();
        let polls = Arc::new(AtomicUsize::new(0));
        let survivor = counting_task(polls.clone(), 0);
        let survivor_state = survivor.state().clone();

        scheduler.new_task(failing);
        scheduler.new_task(survivor);
        scheduler.add_generator(&failing_state);
        scheduler.add_generator(&survivor_state);

        let batch = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.run_one_batch()
        }));
        assert!(batch.is_err());

        // The failed task is gone; the one behind it is still queued
        assert_eq!(failing_state.phase(), StatePhase::Canceled);
        assert!(!scheduler.contains(failing_state.id()));
        assert_eq!(scheduler.running_len(), 1);
        assert!(!scheduler.add_generator(&survivor_state));

        scheduler.run_until_notask();
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(survivor_state.phase(), StatePhase::Complete);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_dropped_scheduler_releases_queued_states() {
        let a = Scheduler::new();
        let b = Scheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(polls.clone(), 0);
        let state = task.state().clone();

        a.new_task(task);
        assert!(a.add_generator(&state));
        assert!(a.migrate(&state, &b));
        drop(a);

        assert!(b.add_generator(&state));
        assert_eq!(b.run_one_batch(), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn test_debug_output() {
        let scheduler = Scheduler::new();
        let rendered = format!("{:?}", scheduler);
        assert!(rendered.contains("Scheduler"));
        assert!(rendered.contains("ready: 0"));
    }
}
