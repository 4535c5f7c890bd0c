//! Host wide startup coordination
//!
//! The host signals once that it is completely started. Until then listeners are not bound
//! and work submitted through [`StartupCoordinator::run_when_started`] is deferred.

use parking_lot::Mutex;
use std::fmt;
use std::mem::take;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

type Task = Box<dyn FnOnce() + Send>;

/// Result of [`StartupCoordinator::run_when_started`]
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome<T> {
    /// The host was started, the task ran immediately
    Ran(T),
    /// The task was queued and runs once the host signals the startup
    Deferred,
}

impl<T> RunOutcome<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, RunOutcome::Deferred)
    }

    pub fn ran(self) -> Option<T> {
        match self {
            RunOutcome::Ran(value) => Some(value),
            RunOutcome::Deferred => None,
        }
    }
}

/// Startup barrier, chain counter and stopping flag shared by all components of a host.
///
/// Cheap to clone, all clones refer to the same state.
#[derive(Clone)]
pub struct StartupCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<Queue>,
    started: watch::Sender<bool>,
    chains: AtomicU64,
    stopping: AtomicBool,
}

struct Queue {
    draining: bool,
    tasks: Vec<Task>,
}

impl Default for StartupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StartupCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupCoordinator")
            .field("started", &self.is_started())
            .field("stopping", &self.is_stopping())
            .field("queued", &self.inner.queue.lock().tasks.len())
            .finish()
    }
}

impl StartupCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue {
                    draining: false,
                    tasks: Vec::new(),
                }),
                started: watch::Sender::new(false),
                chains: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Run `task` now if the host is started, queue it otherwise.
    ///
    /// Queued tasks run exactly once, inside [`signal_started`](Self::signal_started) and
    /// before [`is_started`](Self::is_started) reports `true`.
    pub fn run_when_started<F, T>(&self, task: F) -> RunOutcome<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        {
            let mut queue = self.inner.queue.lock();

            if !*self.inner.started.borrow() {
                queue.tasks.push(Box::new(move || {
                    task();
                }));

                return RunOutcome::Deferred;
            }
        }

        RunOutcome::Ran(task())
    }

    pub fn is_started(&self) -> bool {
        *self.inner.started.borrow()
    }

    /// Wait until the host signalled its startup
    pub async fn wait_started(&self) {
        let mut started = self.inner.started.subscribe();

        // the sender lives in self, the wait cannot fail
        let _ = started.wait_for(|started| *started).await;
    }

    /// Signal that the host is completely started.
    ///
    /// Runs every queued task on the calling thread, then opens the barrier. Returns false
    /// if the barrier was opened before.
    pub fn signal_started(&self) -> bool {
        let mut queue = self.inner.queue.lock();

        if *self.inner.started.borrow() || queue.draining {
            log::warn!("startup was signalled more than once");
            return false;
        }

        queue.draining = true;

        loop {
            let tasks = take(&mut queue.tasks);

            if tasks.is_empty() {
                break;
            }

            log::debug!("running {} tasks deferred until startup", tasks.len());

            drop(queue);
            tasks.into_iter().for_each(|task| task());
            queue = self.inner.queue.lock();
        }

        self.inner.started.send_replace(true);
        queue.draining = false;

        log::debug!("host startup complete");

        true
    }

    /// Take the next number of the host wide chain counter
    pub fn next_chain_number(&self) -> u64 {
        self.inner.chains.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Mark the host as stopping, chains ignore updates from now on
    pub fn begin_stopping(&self) {
        self.inner.stopping.store(true, Ordering::Release);
    }
}
