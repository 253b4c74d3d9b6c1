// Elastic worker pool: threads are spawned on demand up to a cap and retire
// after staying idle for the keep-alive period

use crate::config::PoolConfig;
use crate::errors::PoolError;
use crate::telemetry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A unit of work run on a pool thread
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Work the pool refused, handed back to the caller
pub struct RejectedWork {
    work: Work,
    reason: PoolError,
}

impl RejectedWork {
    pub fn reason(&self) -> &PoolError {
        &self.reason
    }

    /// Take the work back, e.g. to run it inline
    pub fn into_inner(self) -> Work {
        self.work
    }
}

impl fmt::Debug for RejectedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedWork")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Used for thread names and metrics labels
    pub name: String,
    pub max_workers: usize,
    pub keep_alive: Duration,
    /// Wake-up interval while waiting for capacity or for busy workers to drain
    pub poll_interval: Duration,
    /// How long shutdown waits for each thread to terminate
    pub shutdown_join_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            max_workers: 3,
            keep_alive: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
            shutdown_join_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolOptions {
    pub fn from_config(name: impl Into<String>, config: &PoolConfig) -> Self {
        Self {
            name: name.into(),
            max_workers: config.max_workers,
            keep_alive: Duration::from_secs(config.keep_alive_seconds),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_join_timeout: Duration::from_secs(config.shutdown_join_timeout_seconds),
        }
    }
}

#[derive(Default)]
struct SlotState {
    work: Option<Work>,
    stop: bool,
    retired: bool,
}

/// Hand-off point between the pool and one worker thread
struct WorkerSlot {
    state: Mutex<SlotState>,
    wake: Condvar,
}

impl WorkerSlot {
    fn with_work(work: Work) -> Self {
        Self {
            state: Mutex::new(SlotState {
                work: Some(work),
                ..SlotState::default()
            }),
            wake: Condvar::new(),
        }
    }

    /// Give work to an idle worker; a worker that already retired refuses it
    fn assign(&self, work: Work) -> Result<(), Work> {
        let mut state = lock(&self.state);
        if state.retired || state.stop {
            return Err(work);
        }
        state.work = Some(work);
        self.wake.notify_one();
        Ok(())
    }

    fn stop(&self) {
        lock(&self.state).stop = true;
        self.wake.notify_one();
    }
}

struct WorkerHandle {
    slot: Arc<WorkerSlot>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    /// Idle workers, most recently idle last
    idle: Vec<usize>,
    busy: HashSet<usize>,
    workers: HashMap<usize, WorkerHandle>,
    next_id: usize,
    shutdown: bool,
}

struct Shared {
    options: PoolOptions,
    state: Mutex<PoolState>,
    /// Signalled whenever a worker becomes idle, retires or shutdown starts
    available: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded pool of OS threads running scheduler work
pub struct ElasticWorkerPool {
    shared: Arc<Shared>,
}

impl ElasticWorkerPool {
    pub fn new(options: PoolOptions) -> Self {
        info!(
            pool = %options.name,
            max_workers = options.max_workers,
            keep_alive_seconds = options.keep_alive.as_secs(),
            "Creating worker pool"
        );
        Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Run `work` on an idle worker, or on a new one while under the cap.
    /// Otherwise the work is handed back.
    pub fn submit(&self, work: Work) -> Result<(), RejectedWork> {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        if state.shutdown {
            return Err(RejectedWork {
                work,
                reason: PoolError::ShutDown,
            });
        }

        let mut work = work;
        while let Some(id) = state.idle.pop() {
            let Some(handle) = state.workers.get(&id) else {
                continue;
            };
            match handle.slot.assign(work) {
                Ok(()) => {
                    state.busy.insert(id);
                    telemetry::update_busy_workers(&shared.options.name, state.busy.len());
                    return Ok(());
                }
                // Retired between going idle and now
                Err(returned) => {
                    state.workers.remove(&id);
                    work = returned;
                }
            }
        }

        if state.workers.len() >= shared.options.max_workers {
            telemetry::record_work_rejected();
            return Err(RejectedWork {
                work,
                reason: PoolError::Saturated(shared.options.max_workers),
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let slot = Arc::new(WorkerSlot::with_work(work));
        let worker_shared = Arc::clone(shared);
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", shared.options.name, id))
            .spawn(move || worker_loop(worker_shared, id, worker_slot));

        match spawned {
            Ok(thread) => {
                debug!(pool = %shared.options.name, worker = id, "Spawned worker");
                state.busy.insert(id);
                state.workers.insert(
                    id,
                    WorkerHandle {
                        slot,
                        thread: Some(thread),
                    },
                );
                telemetry::update_busy_workers(&shared.options.name, state.busy.len());
                Ok(())
            }
            Err(e) => {
                error!(pool = %shared.options.name, error = %e, "Failed to spawn worker thread");
                match lock(&slot.state).work.take() {
                    Some(work) => Err(RejectedWork {
                        work,
                        reason: PoolError::SpawnFailed(e.to_string()),
                    }),
                    // The closure owning the slot was dropped with the work still inside
                    None => Ok(()),
                }
            }
        }
    }

    /// Block until at least one worker is free or shutdown has started.
    /// Returns the number of free slots; zero after shutdown.
    pub fn block_until_capacity(&self) -> usize {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        loop {
            if state.shutdown {
                return 0;
            }
            let free = shared.options.max_workers.saturating_sub(state.busy.len());
            if free > 0 {
                return free;
            }
            state = shared
                .available
                .wait_timeout(state, shared.options.poll_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop accepting work and stop idle workers. With `wait`, block until
    /// busy workers finish and join every thread, each within the join timeout.
    pub fn shutdown(&self, wait: bool) {
        let shared = &self.shared;
        {
            let mut state = lock(&shared.state);
            if !state.shutdown {
                info!(pool = %shared.options.name, busy = state.busy.len(), "Shutting down worker pool");
            }
            state.shutdown = true;
            let idle: Vec<usize> = state.idle.drain(..).collect();
            for id in idle {
                if let Some(handle) = state.workers.get(&id) {
                    handle.slot.stop();
                }
            }
            shared.available.notify_all();
        }
        if !wait {
            return;
        }

        let handles: Vec<(usize, JoinHandle<()>)> = {
            let mut state = lock(&shared.state);
            while !state.busy.is_empty() {
                state = shared
                    .available
                    .wait_timeout(state, shared.options.poll_interval)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            state
                .workers
                .drain()
                .filter_map(|(id, mut handle)| {
                    handle.slot.stop();
                    handle.thread.take().map(|thread| (id, thread))
                })
                .collect()
        };

        let deadline = Instant::now() + shared.options.shutdown_join_timeout;
        for (id, thread) in handles {
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if !thread.is_finished() {
                warn!(pool = %shared.options.name, worker = id, "Stuck worker did not terminate");
                continue;
            }
            if thread.join().is_err() {
                warn!(pool = %shared.options.name, worker = id, "Worker thread terminated abnormally");
            }
        }
        telemetry::update_busy_workers(&shared.options.name, 0);
        info!(pool = %shared.options.name, "Worker pool stopped");
    }

    pub fn max_workers(&self) -> usize {
        self.shared.options.max_workers
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.shared.state).workers.len()
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.shared.state).idle.len()
    }

    pub fn busy_count(&self) -> usize {
        lock(&self.shared.state).busy.len()
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize, slot: Arc<WorkerSlot>) {
    let keep_alive = shared.options.keep_alive;
    loop {
        let work = {
            let mut slot_state = lock(&slot.state);
            let idle_since = Instant::now();
            loop {
                if let Some(work) = slot_state.work.take() {
                    break Some(work);
                }
                let idle_for = idle_since.elapsed();
                if slot_state.stop || idle_for >= keep_alive {
                    slot_state.retired = true;
                    break None;
                }
                slot_state = slot
                    .wake
                    .wait_timeout(slot_state, keep_alive - idle_for)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        let Some(work) = work else {
            let mut state = lock(&shared.state);
            state.idle.retain(|idle| *idle != id);
            // During shutdown the handle stays for joining
            if !state.shutdown {
                state.workers.remove(&id);
                debug!(pool = %shared.options.name, worker = id, "Idle worker retired");
            }
            shared.available.notify_all();
            return;
        };

        if catch_unwind(AssertUnwindSafe(work)).is_err() {
            error!(pool = %shared.options.name, worker = id, "Work panicked; worker continues");
        }

        let mut state = lock(&shared.state);
        state.busy.remove(&id);
        telemetry::update_busy_workers(&shared.options.name, state.busy.len());
        if state.shutdown {
            lock(&slot.state).retired = true;
            shared.available.notify_all();
            return;
        }
        state.idle.push(id);
        shared.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    fn pool(max_workers: usize, keep_alive: Duration) -> ElasticWorkerPool {
        ElasticWorkerPool::new(PoolOptions {
            name: "test".to_string(),
            max_workers,
            keep_alive,
            poll_interval: Duration::from_millis(20),
            shutdown_join_timeout: Duration::from_secs(2),
        })
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_rejects_work_beyond_cap() {
        let pool = pool(2, Duration::from_secs(60));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        for _ in 0..2 {
            let release_rx = Arc::clone(&release_rx);
            pool.submit(Box::new(move || {
                let _ = release_rx.lock().unwrap().recv();
            }))
            .unwrap();
        }
        assert_eq!(pool.busy_count(), 2);

        let (ran_tx, ran_rx) = mpsc::channel();
        let rejected = pool
            .submit(Box::new(move || ran_tx.send(()).unwrap()))
            .unwrap_err();
        assert!(matches!(rejected.reason(), PoolError::Saturated(2)));

        // The caller may still run rejected work inline
        (rejected.into_inner())();
        assert!(ran_rx.try_recv().is_ok());

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        pool.shutdown(true);
    }

    #[test]
    fn test_idle_worker_retires_after_keep_alive() {
        let pool = pool(2, Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(wait_for(|| pool.worker_count() == 0));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_idle_worker_is_reused() {
        let pool = pool(2, Duration::from_secs(60));
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel();
            pool.block_until_capacity();
            pool.submit(Box::new(move || tx.send(()).unwrap())).unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(wait_for(|| pool.idle_count() == 1));
        }
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown(true);
    }

    #[test]
    fn test_worker_survives_panicking_work() {
        let pool = pool(1, Duration::from_secs(60));
        pool.submit(Box::new(|| panic!("boom"))).unwrap();

        assert_eq!(pool.block_until_capacity(), 1);
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(42).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown(true);
    }

    #[test]
    fn test_shutdown_drains_busy_workers() {
        let pool = pool(2, Duration::from_secs(60));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        pool.submit(Box::new(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        }))
        .unwrap();

        pool.shutdown(true);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.block_until_capacity(), 0);

        let rejected = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(rejected.reason(), PoolError::ShutDown));
    }
}
