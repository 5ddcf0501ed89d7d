//! The lane pool.
//!
//! Each lane is one OS thread running a current-thread tokio runtime that
//! drains an unbounded FIFO. A task is spawned onto that runtime and awaited
//! before the next message is taken, so a lane never runs two of its own
//! tasks at once and a panicking task is caught by its join handle instead
//! of taking the thread down.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{JoinHandle, ThreadId};

use burrow_core::{BurrowResult, LaneError, LanePoolConfig};
use tokio::runtime::Builder;
use tokio::sync::mpsc;

use crate::panic_message;
use crate::scheduler::Scheduler;

/// A boxed unit of lane work.
pub type LaneTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Report handed to the failure hook when a lane task panics.
#[derive(Debug, Clone)]
pub struct LaneFailure {
    /// Index of the lane the task ran on.
    pub lane: usize,
    /// Panic message, when the payload was a string.
    pub message: String,
}

/// Converts an uncaught lane failure into a domain event.
pub type FailureHook = Arc<dyn Fn(&LaneFailure) + Send + Sync>;

enum LaneMessage {
    Run(LaneTask),
    Stop,
}

/// Number of lanes for the given host parallelism.
///
/// Always a power of two and at least 8, so `hash & (size - 1)` is a uniform
/// selector.
pub fn lane_count_for(parallelism: usize) -> usize {
    (parallelism.max(4) * 2).next_power_of_two()
}

/// Lane picked by `hash` in a pool of `mask + 1` lanes.
fn lane_for(mask: usize, hash: i64) -> usize {
    (hash as u64 as usize) & mask
}

/// Fixed pool of sequential execution lanes.
pub struct LanePool {
    senders: Vec<mpsc::UnboundedSender<LaneMessage>>,
    mask: usize,
    thread_lanes: HashMap<ThreadId, usize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    failure_hook: Arc<RwLock<Option<FailureHook>>>,
    scheduler: Scheduler,
    closed: AtomicBool,
}

impl LanePool {
    /// Spawn the lanes and the scheduler thread.
    pub fn new(config: LanePoolConfig) -> BurrowResult<Self> {
        let size = lane_count_for(config.resolved_parallelism());
        let failure_hook: Arc<RwLock<Option<FailureHook>>> = Arc::new(RwLock::new(None));

        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);
        let mut thread_lanes = HashMap::with_capacity(size);

        for index in 0..size {
            let name = format!("{}-{}", config.thread_name_prefix, index);
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| LaneError::SpawnFailed {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let (tx, rx) = mpsc::unbounded_channel();
            let hook = Arc::clone(&failure_hook);

            let worker = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    runtime.block_on(run_lane(index, rx, hook));
                    tracing::trace!(lane = index, "Lane worker exited");
                })
                .map_err(|e| LaneError::SpawnFailed {
                    name,
                    reason: e.to_string(),
                })?;

            thread_lanes.insert(worker.thread().id(), index);
            senders.push(tx);
            workers.push(worker);
        }

        let scheduler = Scheduler::new(format!("{}-scheduler", config.thread_name_prefix))?;

        tracing::info!(lanes = size, "Lane pool started");

        Ok(Self {
            senders,
            mask: size - 1,
            thread_lanes,
            workers: Mutex::new(workers),
            failure_hook,
            scheduler,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of lanes.
    pub fn size(&self) -> usize {
        self.senders.len()
    }

    /// Lane selected by `hash`. Negative hashes are masked as unsigned.
    pub fn lane_of(&self, hash: i64) -> usize {
        lane_for(self.mask, hash)
    }

    /// Enqueue `task` on the lane selected by `hash`.
    ///
    /// The task runs after everything already queued on that lane and before
    /// anything queued after it.
    pub fn submit<F>(&self, hash: i64, task: F) -> BurrowResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_to_lane(self.lane_of(hash), task)
    }

    /// Enqueue `task` on a pseudo-randomly chosen lane.
    pub fn submit_any<F>(&self, task: F) -> BurrowResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(rand::random::<i64>(), task)
    }

    /// Enqueue a plain closure on the lane selected by `hash`.
    pub fn execute<F>(&self, hash: i64, f: F) -> BurrowResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(hash, async move { f() })
    }

    /// Enqueue `task` on a specific lane.
    pub fn submit_to_lane<F>(&self, index: usize, task: F) -> BurrowResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(LaneError::PoolClosed.into());
        }
        let sender = self.senders.get(index).ok_or(LaneError::NoSuchLane {
            index,
            size: self.size(),
        })?;
        sender
            .send(LaneMessage::Run(Box::pin(task)))
            .map_err(|_| LaneError::PoolClosed)?;
        tracing::trace!(lane = index, "Task submitted");
        Ok(())
    }

    /// Lane index of the calling thread, if it is a lane worker.
    pub fn lane_of_current_thread(&self) -> Option<usize> {
        self.lane_of_thread(std::thread::current().id())
    }

    /// Lane index owned by `thread`, if it is a lane worker.
    pub fn lane_of_thread(&self, thread: ThreadId) -> Option<usize> {
        self.thread_lanes.get(&thread).copied()
    }

    /// Thread ids of the lane workers, indexed by lane.
    pub fn lane_thread_ids(&self) -> Vec<ThreadId> {
        let mut ids = vec![None; self.size()];
        for (thread, lane) in &self.thread_lanes {
            ids[*lane] = Some(*thread);
        }
        ids.into_iter().flatten().collect()
    }

    /// Install the hook that receives uncaught task failures.
    pub fn set_failure_hook(&self, hook: FailureHook) {
        *self.failure_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Timer thread shared by everything built on this pool.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting work, drain what is queued and join the workers.
    ///
    /// Called from a lane thread, that lane's own worker is not joined.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown();
        for sender in &self.senders {
            let _ = sender.send(LaneMessage::Stop);
        }

        let current = std::thread::current().id();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("Lane worker panicked during shutdown");
            }
        }
        tracing::info!(lanes = self.size(), "Lane pool shut down");
    }
}

impl Drop for LanePool {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for sender in &self.senders {
                let _ = sender.send(LaneMessage::Stop);
            }
        }
    }
}

impl std::fmt::Debug for LanePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanePool")
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_lane(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<LaneMessage>,
    hook: Arc<RwLock<Option<FailureHook>>>,
) {
    while let Some(message) = rx.recv().await {
        let task = match message {
            LaneMessage::Run(task) => task,
            LaneMessage::Stop => break,
        };
        let Err(err) = tokio::spawn(task).await else {
            continue;
        };
        if !err.is_panic() {
            continue;
        }
        let failure = LaneFailure {
            lane: index,
            message: panic_message(err.into_panic().as_ref()),
        };
        report_failure(&hook, &failure);
    }
}

fn report_failure(hook: &RwLock<Option<FailureHook>>, failure: &LaneFailure) {
    let hook = hook.read().unwrap_or_else(|e| e.into_inner()).clone();
    let Some(hook) = hook else {
        tracing::error!(lane = failure.lane, error = %failure.message, "Lane task panicked");
        return;
    };
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(failure)));
    if let Err(payload) = outcome {
        tracing::error!(
            lane = failure.lane,
            error = %failure.message,
            hook_error = %panic_message(payload.as_ref()),
            "Lane failure hook panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn small_pool() -> LanePool {
        LanePool::new(LanePoolConfig::default().with_parallelism(2)).unwrap()
    }

    #[test]
    fn test_lane_count_is_power_of_two_and_at_least_eight() {
        assert_eq!(lane_count_for(1), 8);
        assert_eq!(lane_count_for(4), 8);
        assert_eq!(lane_count_for(5), 16);
        assert_eq!(lane_count_for(8), 16);
        assert_eq!(lane_count_for(12), 32);
    }

    #[test]
    fn test_negative_hash_selects_valid_lane() {
        let pool = small_pool();
        assert_eq!(pool.size(), 8);
        assert_eq!(pool.lane_of(-1), 7);
        assert_eq!(pool.lane_of(i64::MIN), 0);
        assert!(pool.lane_of(-12345) < pool.size());
        pool.shutdown();
    }

    #[test]
    fn test_congruent_hashes_share_a_lane() {
        let pool = small_pool();
        let size = pool.size() as i64;
        for hash in [-17i64, -1, 0, 3, 12_345, i64::MAX - 7] {
            for k in [-3i64, -1, 1, 2, 1_000] {
                let other = hash.wrapping_add(k.wrapping_mul(size));
                assert_eq!(pool.lane_of(hash), pool.lane_of(other), "{hash} vs {other}");
            }
        }
        pool.shutdown();
    }

    #[test]
    fn test_same_hash_runs_in_submission_order() {
        let pool = small_pool();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..100 {
            let tx = tx.clone();
            pool.submit(42, async move {
                if i % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                tx.send(i).unwrap();
            })
            .unwrap();
        }

        let seen: Vec<i32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_task_runs_on_its_lane_thread() {
        let pool = Arc::new(small_pool());
        let (tx, rx) = std_mpsc::channel();

        let inner = Arc::clone(&pool);
        pool.execute(3, move || {
            tx.send(inner.lane_of_current_thread()).unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(3));
        assert_eq!(pool.lane_of_current_thread(), None);
        assert_eq!(pool.lane_thread_ids().len(), pool.size());
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_lane() {
        let pool = small_pool();
        let (tx, rx) = std_mpsc::channel();

        pool.execute(1, || panic!("boom")).unwrap();
        pool.execute(1, move || tx.send("after").unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
        pool.shutdown();
    }

    #[test]
    fn test_failure_hook_receives_panic() {
        let pool = small_pool();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        pool.set_failure_hook(Arc::new(move |failure: &LaneFailure| {
            tx.lock().unwrap().send(failure.clone()).unwrap();
        }));

        pool.execute(9, || panic!("lane exploded")).unwrap();

        let failure = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(failure.lane, 1);
        assert!(failure.message.contains("lane exploded"));
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_work() {
        let pool = small_pool();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(0, move || tx.send(i).unwrap()).unwrap();
        }
        pool.shutdown();

        let drained: Vec<i32> = rx.try_iter().collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(pool.execute(0, || {}).is_err());
    }

    #[test]
    fn test_submit_to_missing_lane_is_rejected() {
        let pool = small_pool();
        let err = pool.submit_to_lane(pool.size(), async {}).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        pool.shutdown();
    }
}
