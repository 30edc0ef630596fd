//! Deadline timers ticked once per scheduling batch
//!
//! Each scheduler owns one [`TimerManager`]. `run_one_batch` calls
//! [`TimerManager::update`] before swapping out its running set, so a timer
//! that fires re-admits its waiting state into the batch about to run.

mod sleep;

pub use sleep::{sleep_for, sleep_until, Sleep};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;
use tracing::trace;

/// Unique identifier for a timer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    fn next() -> Self {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELED: u8 = 2;

/// Shared completion flag of one timer plus the waker to notify
pub(crate) struct TimerSlot {
    status: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

impl TimerSlot {
    fn new(waker: Option<Waker>) -> Self {
        Self {
            status: AtomicU8::new(PENDING),
            waker: Mutex::new(waker),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.status.load(Ordering::SeqCst) == PENDING
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.status.load(Ordering::SeqCst) == FIRED
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Move out of `PENDING` and wake the waiter; `false` if already settled
    fn settle(&self, status: u8) -> bool {
        if self
            .status
            .compare_exchange(PENDING, status, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

/// Heap entry; the earliest deadline sits on top
#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap; equal deadlines fire in creation order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    /// Timers still pending; heap entries missing from here are stale
    live: FxHashMap<TimerId, Arc<TimerSlot>>,
}

impl TimerQueue {
    /// Unlink a pending timer ahead of its deadline
    ///
    /// Stale heap entries are otherwise only reclaimed once their deadline
    /// passes, so the heap is rebuilt when they outnumber live timers.
    fn unlink(&mut self, id: TimerId) -> Option<Arc<TimerSlot>> {
        let slot = self.live.remove(&id)?;
        if self.heap.len() > 2 * self.live.len() {
            let live = &self.live;
            self.heap.retain(|entry| live.contains_key(&entry.id));
        }
        Some(slot)
    }
}

/// Min-heap of pending deadlines
///
/// Firing and cancellation both wake the registered waker; wakers always run
/// after the internal lock is released, so a woken state may re-enter the
/// manager freely.
pub struct TimerManager {
    queue: Mutex<TimerQueue>,
}

impl TimerManager {
    /// Create an empty timer manager
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(TimerQueue::default()),
        }
    }

    /// Arm a timer that wakes `waker` at `deadline`
    pub fn add(&self, deadline: Instant, waker: Waker) -> TimerId {
        self.arm(deadline, Some(waker)).0
    }

    pub(crate) fn arm(&self, deadline: Instant, waker: Option<Waker>) -> (TimerId, Arc<TimerSlot>) {
        let id = TimerId::next();
        let slot = Arc::new(TimerSlot::new(waker));
        let mut queue = self.queue.lock();
        queue.heap.push(TimerEntry { deadline, id });
        queue.live.insert(id, Arc::clone(&slot));
        (id, slot)
    }

    /// Cancel a pending timer, waking its waiter
    ///
    /// Returns `false` if the timer already fired or was canceled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let slot = self.queue.lock().unlink(id);
        match slot {
            Some(slot) => {
                trace!(timer = id.as_u64(), "timer canceled");
                slot.settle(CANCELED)
            }
            None => false,
        }
    }

    /// Drop a pending timer without waking anyone
    pub(crate) fn forget(&self, id: TimerId) {
        let slot = self.queue.lock().unlink(id);
        drop(slot);
    }

    /// Whether `id` is still waiting to fire
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.queue.lock().live.contains_key(&id)
    }

    /// Fire every timer whose deadline has passed
    ///
    /// Returns the number fired.
    pub fn update(&self) -> usize {
        self.update_at(Instant::now())
    }

    /// Fire every timer whose deadline is at or before `now`
    pub fn update_at(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        {
            let mut queue = self.queue.lock();
            while let Some(entry) = queue.heap.peek() {
                if entry.deadline > now {
                    break;
                }
                let id = entry.id;
                queue.heap.pop();
                if let Some(slot) = queue.live.remove(&id) {
                    expired.push(slot);
                }
            }
        }

        let fired = expired.iter().filter(|slot| slot.settle(FIRED)).count();
        if fired > 0 {
            trace!(fired, "timers fired");
        }
        fired
    }

    /// Cancel every pending timer
    ///
    /// Returns the number canceled.
    pub fn clear(&self) -> usize {
        let live = {
            let mut queue = self.queue.lock();
            queue.heap.clear();
            std::mem::take(&mut queue.live)
        };
        live.into_values().filter(|slot| slot.settle(CANCELED)).count()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.queue.lock().live.len()
    }

    /// No pending timers
    pub fn is_empty(&self) -> bool {
        self.queue.lock().live.is_empty()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut queue = self.queue.lock();
        loop {
            let entry = *queue.heap.peek()?;
            if queue.live.contains_key(&entry.id) {
                return Some(entry.deadline);
            }
            queue.heap.pop();
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.len())
            .finish()
    }
}
