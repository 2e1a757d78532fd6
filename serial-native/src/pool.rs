//! A pool of threads for running blocking device operations.
//!
//! Threads are spawned on demand whenever a task arrives and no thread is
//! idle, so a slow device never starves other requests. An idle thread
//! exits after the configured keep-alive.
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::deque::{Injector, Steal};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::Error;

const LOG: &str = "serial_native::pool";

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Configures and builds a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    name: String,
    keep_alive: Duration,
    stack_size: Option<usize>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            name: "serial-worker".to_owned(),
            keep_alive: Duration::from_secs(10),
            stack_size: None,
        }
    }
}

impl PoolBuilder {
    /// Create a builder with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for worker thread names. Each thread gets `{name}-{n}`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// How long an idle worker waits for a task before exiting.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Stack size for worker threads. Uses the platform default if unset.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Build the pool. No threads are started until the first task.
    pub fn build(self) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                shared: Arc::new(Shared {
                    tasks: Injector::new(),
                    state: Mutex::new(State::default()),
                    condvar: Condvar::new(),
                    keep_alive: self.keep_alive,
                }),
                name: self.name,
                stack_size: self.stack_size,
            }),
        }
    }
}

/// A handle to a pool of worker threads.
///
/// Clones share the same threads. Once the last handle is dropped the
/// workers finish the tasks already queued and exit.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    shared: Arc<Shared>,
    name: String,
    stack_size: Option<usize>,
}

struct Shared {
    tasks: Injector<Task>,
    state: Mutex<State>,
    condvar: Condvar,
    keep_alive: Duration,
}

#[derive(Default)]
struct State {
    /// Threads currently alive.
    workers: usize,
    /// Alive threads waiting for a task.
    idle: usize,
    /// Idle threads already signalled but not yet awake.
    notified: usize,
    /// Used to name new threads.
    spawned: usize,
    shutdown: bool,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.inner.shared;
        let state = shared.state.lock();
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("workers", &state.workers)
            .field("idle", &state.idle)
            .field("queued", &shared.tasks.len())
            .finish()
    }
}

impl Default for Pool {
    fn default() -> Self {
        PoolBuilder::new().build()
    }
}

impl Pool {
    /// Create a pool with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` on a worker thread.
    ///
    /// Fails only if no thread is idle and a new one cannot be started. In
    /// that case the task is dropped without running.
    pub fn spawn<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.inner.shared;
        let mut state = shared.state.lock();

        if state.idle > state.notified {
            state.notified += 1;
            shared.tasks.push(Box::new(task));
            drop(state);
            shared.condvar.notify_one();
            return Ok(());
        }

        let id = state.spawned;
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.inner.name, id));
        if let Some(stack_size) = self.inner.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let worker_shared = Arc::clone(shared);
        let first: Task = Box::new(task);
        // The new thread runs its first task directly, so it never waits on the lock we hold.
        match builder.spawn(move || worker_shared.run(id, first)) {
            Ok(_) => {
                state.spawned += 1;
                state.workers += 1;
                debug!(target: LOG, "worker.spawned {} workers={}", id, state.workers);
                Ok(())
            }
            Err(err) => {
                warn!(target: LOG, "worker.spawn_failed: {}", err);
                Err(Error::from(err))
            }
        }
    }

    /// Returns the number of threads currently alive.
    pub fn workers(&self) -> usize {
        self.inner.shared.state.lock().workers
    }

    /// Returns the number of threads waiting for a task.
    pub fn idle(&self) -> usize {
        self.inner.shared.state.lock().idle
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.condvar.notify_all();
        trace!(target: LOG, "pool.shutdown {}", self.name);
    }
}

/// Counts a worker out when its thread ends, including by a panicking task.
struct Exit<'a> {
    shared: &'a Shared,
    id: usize,
}

impl Drop for Exit<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.workers -= 1;
        if thread::panicking() {
            warn!(target: LOG, "worker.panicked {} workers={}", self.id, state.workers);
        } else {
            trace!(target: LOG, "worker.exit {} workers={}", self.id, state.workers);
        }
    }
}

impl Shared {
    fn next_task(&self) -> Option<Task> {
        loop {
            match self.tasks.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn run(&self, id: usize, first: Task) {
        let _exit = Exit { shared: self, id };
        trace!(target: LOG, "worker.start {}", id);
        first();

        loop {
            while let Some(task) = self.next_task() {
                task();
            }

            let mut state = self.state.lock();
            // A task may have been pushed between the last steal and the lock.
            if !self.tasks.is_empty() {
                continue;
            }
            if state.shutdown {
                break;
            }

            state.idle += 1;
            let timeout = self.condvar.wait_for(&mut state, self.keep_alive);
            state.idle -= 1;
            // Spurious wakeups may consume a signal meant for another thread.
            state.notified = state.notified.saturating_sub(1);

            if timeout.timed_out() && self.tasks.is_empty() && !state.shutdown {
                trace!(target: LOG, "worker.idle_exit {}", id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn runs_every_task() {
        let pool = Pool::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..32 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).unwrap()).unwrap();
        }
        drop(tx);
        let mut seen: Vec<_> = rx.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn blocked_task_does_not_starve_others() {
        let pool = Pool::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        pool.spawn(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
        pool.spawn(move || done_tx.send(()).unwrap()).unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("second task should run while the first is blocked");
        release_tx.send(()).unwrap();
    }

    #[test]
    fn idle_workers_are_reused() {
        let pool = PoolBuilder::new().keep_alive(Duration::from_secs(30)).build();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        pool.spawn(move || tx.send(()).unwrap()).unwrap();
        rx.recv().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.idle() == 0 {
            assert!(Instant::now() < deadline, "worker never went idle");
            thread::sleep(Duration::from_millis(1));
        }
        pool.spawn(move || tx2.send(()).unwrap()).unwrap();
        rx.recv().unwrap();
        assert_eq!(pool.workers(), 1);
    }

    #[test]
    fn idle_workers_exit_after_keep_alive() {
        let pool = PoolBuilder::new()
            .name("keep-alive-test")
            .keep_alive(Duration::from_millis(10))
            .build();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        pool.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.workers() > 0 {
            assert!(Instant::now() < deadline, "worker outlived its keep-alive");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_threads_are_named() {
        let pool = PoolBuilder::new().name("named").build();
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || {
            let name = thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        })
        .unwrap();
        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("named-"), "{name}");
    }

    #[test]
    fn panicking_task_releases_its_worker() {
        let pool = PoolBuilder::new().name("panicking").build();
        pool.spawn(|| panic!("task failed")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.workers() > 0 {
            assert!(Instant::now() < deadline, "panicked worker is still counted");
            thread::sleep(Duration::from_millis(1));
        }

        // The pool keeps serving after losing a thread.
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
