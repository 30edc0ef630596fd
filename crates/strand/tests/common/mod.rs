//! Shared helpers for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use strand::Task;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
///
/// Filter with `RUST_LOG`, e.g. `RUST_LOG=strand=trace`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Future that suspends `pending_for` times (re-waking itself) before finishing
pub struct Countdown {
    remaining: usize,
    polls: Arc<AtomicUsize>,
}

impl Countdown {
    pub fn new(pending_for: usize, polls: Arc<AtomicUsize>) -> Self {
        Self {
            remaining: pending_for,
            polls,
        }
    }
}

impl Future for Countdown {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.remaining == 0 {
            return Poll::Ready(());
        }
        self.remaining -= 1;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Future that stays pending until woken externally, counting its polls
pub struct Parked {
    polls: Arc<AtomicUsize>,
}

impl Parked {
    pub fn new(polls: Arc<AtomicUsize>) -> Self {
        Self { polls }
    }
}

impl Future for Parked {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Poll::Pending
    }
}

/// Task that finishes after `pending_for` self-wakes
pub fn countdown_task(pending_for: usize, polls: &Arc<AtomicUsize>) -> Task {
    Task::new(Countdown::new(pending_for, polls.clone()))
}

/// Task that never finishes and never wakes itself
pub fn parked_task(polls: &Arc<AtomicUsize>) -> Task {
    Task::new(Parked::new(polls.clone()))
}
