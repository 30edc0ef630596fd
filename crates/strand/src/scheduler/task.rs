//! Task ownership and typed completion handles

use crate::error::{ErrorCode, FutureError, FutureResult};
use crate::scheduler::state::{State, StateId};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Exclusive owner of one [`State`]
///
/// A task lives in exactly one scheduler's ready set. Dropping it (normally
/// through `del_final`) cancels its state if it has not completed.
pub struct Task {
    state: Arc<State>,
}

impl Task {
    /// Create a task with no consumer attached
    ///
    /// Registering it with `new_task` does not run it; something must attach a
    /// consumer or call `add_generator` first.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            state: State::new(Box::pin(future)),
        }
    }

    /// Create a task whose output is delivered through a [`JoinHandle`]
    pub fn with_handle<F>(future: F) -> (Self, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = Arc::new(JoinSlot::new());
        let writer = SlotWriter {
            slot: Arc::clone(&slot),
            written: false,
        };
        let task = Self::new(async move {
            let output = future.await;
            writer.complete(output);
        });
        let handle = JoinHandle {
            state: Arc::clone(&task.state),
            slot,
        };
        (task, handle)
    }

    /// Identity of the owned state
    pub fn id(&self) -> StateId {
        self.state.id()
    }

    /// The owned state
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.state.cancel();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("state", &self.state).finish()
    }
}

const PENDING: u8 = 0;
const WRITTEN: u8 = 1;
const ABANDONED: u8 = 2;

/// Single-assignment output slot shared by a task and its handle
struct JoinSlot<T> {
    status: AtomicU8,
    value: Mutex<Option<T>>,
    waker: Mutex<Option<Waker>>,
}

impl<T> JoinSlot<T> {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(PENDING),
            value: Mutex::new(None),
            waker: Mutex::new(None),
        }
    }

    fn status(&self) -> u8 {
        self.status.load(Ordering::SeqCst)
    }

    fn settle(&self, status: u8) {
        self.status.store(status, Ordering::SeqCst);
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Write side of a [`JoinSlot`], moved into the task's future
///
/// Dropped unwritten (the task was canceled) it marks the slot abandoned so
/// the handle stops waiting.
struct SlotWriter<T> {
    slot: Arc<JoinSlot<T>>,
    written: bool,
}

impl<T> SlotWriter<T> {
    fn complete(mut self, value: T) {
        *self.slot.value.lock() = Some(value);
        self.written = true;
        self.slot.settle(WRITTEN);
    }
}

impl<T> Drop for SlotWriter<T> {
    fn drop(&mut self) {
        if !self.written {
            self.slot.settle(ABANDONED);
        }
    }
}

/// Awaitable handle to a task's output
///
/// The first poll attaches it as the task's continuation consumer, which
/// admits a lazily registered task into its scheduler's running set.
/// Dropping the handle detaches it; the task keeps running.
pub struct JoinHandle<T> {
    state: Arc<State>,
    slot: Arc<JoinSlot<T>>,
}

impl<T> JoinHandle<T> {
    /// Identity of the task's state
    pub fn id(&self) -> StateId {
        self.state.id()
    }

    /// The task's state
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Whether the output is written or the task was canceled
    pub fn is_finished(&self) -> bool {
        self.slot.status() != PENDING
    }

    /// Take the output without waiting
    ///
    /// `not_ready` while the task is still running; `read_before_write` if it
    /// was canceled before producing a value.
    ///
    /// # Panics
    ///
    /// Panics if the output was already taken.
    pub fn try_result(&mut self) -> FutureResult<T> {
        match self.slot.status() {
            PENDING => Err(FutureError::qualified(ErrorCode::NotReady, "join_handle")),
            WRITTEN => match self.slot.value.lock().take() {
                Some(value) => Ok(value),
                None => panic!("{} output already taken", self.state.id()),
            },
            _ => Err(FutureError::qualified(ErrorCode::ReadBeforeWrite, "join_handle")),
        }
    }

    fn poll_settled(&mut self) -> Option<FutureResult<T>> {
        if self.slot.status() == PENDING {
            None
        } else {
            Some(self.try_result())
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = FutureResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.poll_settled() {
            return Poll::Ready(result);
        }

        {
            let mut waker = this.slot.waker.lock();
            match waker.as_ref() {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                _ => *waker = Some(cx.waker().clone()),
            }
        }

        // Settled between the first check and registering the waker
        if let Some(result) = this.poll_settled() {
            return Poll::Ready(result);
        }

        this.state.attach_consumer();
        Poll::Pending
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("state", &self.state.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Resumed, Scheduler, StatePhase};

    #[test]
    fn test_task_new_has_no_consumer() {
        let task = Task::new(async {});
        assert!(!task.state().has_consumer());
        assert_eq!(task.id(), task.state().id());
    }

    #[test]
    fn test_drop_cancels_state() {
        let task = Task::new(std::future::pending::<()>());
        let state = task.state().clone();
        drop(task);
        assert_eq!(state.phase(), StatePhase::Canceled);
    }

    #[test]
    fn test_try_result_before_and_after() {
        let (task, mut handle) = Task::with_handle(async { "done" });

        let err = handle.try_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotReady);
        assert_eq!(err.to_string(), "join_handle, code=not_ready");
        assert!(!handle.is_finished());

        assert_eq!(task.state().resume(), Resumed::Finished);
        assert!(handle.is_finished());
        assert_eq!(handle.try_result(), Ok("done"));
    }

    #[test]
    #[should_panic(expected = "output already taken")]
    fn test_try_result_twice_panics() {
        let (task, mut handle) = Task::with_handle(async { 1 });
        task.state().resume();
        let _ = handle.try_result();
        let _ = handle.try_result();
    }

    #[test]
    fn test_canceled_task_reports_read_before_write() {
        let (task, mut handle) = Task::with_handle(async {
            std::future::pending::<()>().await;
            5
        });
        assert_eq!(task.state().resume(), Resumed::Suspended);
        drop(task);

        assert!(handle.is_finished());
        let err = handle.try_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReadBeforeWrite);
        assert_eq!(err.primitive(), Some("join_handle"));
    }

    #[test]
    fn test_awaiting_handle_admits_lazy_task() {
        let scheduler = Scheduler::new();
        let (inner, inner_handle) = Task::with_handle(async { 7 });
        let inner_state = inner.state().clone();
        scheduler.new_task(inner);
        assert_eq!(scheduler.running_len(), 0);

        let mut outer = scheduler.spawn(async move { inner_handle.await.map(|v| v * 6) });

        // Batch 1: outer polls the handle, attaching inner's consumer
        scheduler.run_one_batch();
        assert!(inner_state.has_consumer());
        assert!(inner_state.is_scheduled());

        scheduler.run_until_notask();
        assert_eq!(outer.try_result(), Ok(Ok(42)));
    }

    #[test]
    fn test_debug_output() {
        let (task, handle) = Task::with_handle(async {});
        assert!(format!("{:?}", task).starts_with("Task"));
        assert!(format!("{:?}", handle).contains("finished: false"));
    }
}
