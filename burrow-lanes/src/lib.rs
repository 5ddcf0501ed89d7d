//! BURROW Lanes - Ordered Execution Substrate
//!
//! A fixed pool of single-threaded lanes selected by hash. Work submitted
//! with the same hash runs in submission order on one thread; work on
//! different lanes runs in parallel with no ordering between them.
//!
//! ```text
//! submit(h, task) ──► lane[h & (N-1)] ──► FIFO ──► worker thread
//! ```
//!
//! # Key Types
//!
//! - `LanePool`: the lanes themselves, sized to host parallelism
//! - `Scheduler`: a timer thread for delayed and repeating work
//! - `EventRegistry` / `EventBus`: typed receivers dispatched inline or
//!   onto a lane

mod event_bus;
mod pool;
mod scheduler;

pub use event_bus::{Dispatch, Event, EventBus, EventRegistry, ReceiverFailure};
pub use pool::{lane_count_for, FailureHook, LaneFailure, LanePool, LaneTask};
pub use scheduler::Scheduler;

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
