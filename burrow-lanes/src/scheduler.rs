//! Timer thread for delayed and repeating work.
//!
//! Closures run on the timer thread itself, so they must stay short. Real
//! work is expected to be handed off to a lane.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use burrow_core::{BurrowResult, LaneError};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A single background thread driving timers.
pub struct Scheduler {
    handle: Handle,
    closed: AtomicBool,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start the timer thread.
    pub fn new(name: impl Into<String>) -> BurrowResult<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| LaneError::SpawnFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = stop_rx.await;
                });
                tracing::debug!("Scheduler thread stopped");
            })
            .map_err(|e| LaneError::SpawnFailed {
                name,
                reason: e.to_string(),
            })?;

        Ok(Self {
            handle,
            closed: AtomicBool::new(false),
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            tracing::warn!(?delay, "Scheduler closed, dropping delayed task");
            return;
        }
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }

    /// Run `task` every `period`, first firing one period from now, until
    /// it returns `ControlFlow::Break`.
    pub fn schedule_repeating<F>(&self, period: Duration, mut task: F)
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        if self.is_closed() {
            tracing::warn!(?period, "Scheduler closed, dropping repeating task");
            return;
        }
        self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if task().is_break() {
                    break;
                }
            }
        });
    }

    /// Whether `shutdown` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the timer thread. Pending timers are dropped.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stop) = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = stop.send(());
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("Scheduler thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(stop) = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = stop.send(());
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("closed", &self.is_closed())
            .finish()
    }
}
