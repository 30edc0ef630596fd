//! Thread-local scheduler binding
//!
//! Each thread may bind one scheduler as its current one. Code that needs a
//! scheduler without being handed one calls [`this_scheduler`], which falls
//! back to a lazily built process-wide default. [`LocalScheduler`] installs a
//! binding for the lifetime of a scope.

use crate::config::SchedulerConfig;
use crate::scheduler::scheduler::Scheduler;
use crate::scheduler::task::JoinHandle;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use tracing::debug;

thread_local! {
    static CURRENT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

static DEFAULT: Lazy<Scheduler> = Lazy::new(|| {
    let config = SchedulerConfig::from_env().unwrap_or_else(|err| {
        debug!(error = %err, "falling back to default scheduler config");
        SchedulerConfig::default()
    });
    Scheduler::with_config(config)
});

/// The process-wide default scheduler
///
/// Nothing drives it implicitly; some thread must call its run loop.
pub fn default_scheduler() -> &'static Scheduler {
    &DEFAULT
}

/// The scheduler bound to the calling thread, or the process default
pub fn this_scheduler() -> Scheduler {
    current().unwrap_or_else(|| DEFAULT.clone())
}

/// Spawn onto [`this_scheduler`]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    this_scheduler().spawn(future)
}

fn current() -> Option<Scheduler> {
    CURRENT.with(|current| current.borrow().clone())
}

fn replace_current(scheduler: Option<Scheduler>) -> Option<Scheduler> {
    CURRENT.with(|current| current.replace(scheduler))
}

/// Scoped thread binding
///
/// `new` reuses the thread's existing binding, or creates a fresh scheduler
/// and binds it. `with` binds a given scheduler. In both cases the guard
/// undoes exactly what it did on drop: a binding it installed is replaced by
/// whatever was bound before, and a binding it merely found is left alone.
///
/// The guard is tied to its thread and cannot be sent elsewhere.
pub struct LocalScheduler {
    scheduler: Scheduler,
    /// Binding to restore on drop; `None` when this guard installed nothing
    restore: Option<Option<Scheduler>>,
    _not_send: PhantomData<*const ()>,
}

impl LocalScheduler {
    /// Bind a fresh scheduler unless the thread already has one
    pub fn new() -> Self {
        match current() {
            Some(scheduler) => Self {
                scheduler,
                restore: None,
                _not_send: PhantomData,
            },
            None => {
                let scheduler = Scheduler::new();
                debug!(scheduler = %scheduler.id(), "bound fresh scheduler to thread");
                Self::install(scheduler)
            }
        }
    }

    /// Bind `scheduler` for the lifetime of the guard
    pub fn with(scheduler: &Scheduler) -> Self {
        debug!(scheduler = %scheduler.id(), "bound scheduler to thread");
        Self::install(scheduler.clone())
    }

    fn install(scheduler: Scheduler) -> Self {
        let previous = replace_current(Some(scheduler.clone()));
        Self {
            scheduler,
            restore: Some(previous),
            _not_send: PhantomData,
        }
    }

    /// The scheduler this guard refers to
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Whether this guard changed the thread's binding
    pub fn installed(&self) -> bool {
        self.restore.is_some()
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            let ours = replace_current(previous);
            drop(ours);
        }
    }
}

impl std::fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("scheduler", &self.scheduler.id())
            .field("installed", &self.installed())
            .finish()
    }
}
