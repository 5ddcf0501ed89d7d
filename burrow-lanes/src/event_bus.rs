//! Typed event dispatch over the lane pool.
//!
//! Receivers are registered on an [`EventRegistry`] at startup and frozen
//! into an [`EventBus`]; there is no process-wide receiver table.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use burrow_core::BurrowResult;

use crate::panic_message;
use crate::pool::LanePool;

/// An event that can be posted on the bus.
pub trait Event: Any + Send + Sync {
    /// Hash selecting the lane for asynchronous receivers. Events sharing a
    /// hash are delivered in posting order.
    fn executor_hash(&self) -> i64 {
        rand::random::<i64>()
    }
}

/// Where a receiver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Inline, on the posting thread.
    CurrentThread,
    /// On the lane selected by the event's executor hash.
    Lane,
}

/// Report handed to the exception hook when a receiver panics.
#[derive(Debug, Clone)]
pub struct ReceiverFailure {
    pub receiver: &'static str,
    pub event: &'static str,
    pub message: String,
}

type Handler = dyn Fn(&dyn Any) + Send + Sync;
type ExceptionHook = Arc<dyn Fn(&ReceiverFailure) + Send + Sync>;
type NoReceiverHook = Arc<dyn Fn(&'static str) + Send + Sync>;

struct Receiver {
    name: &'static str,
    event: &'static str,
    dispatch: Dispatch,
    handler: Box<Handler>,
}

/// Receiver table built at startup.
#[derive(Default)]
pub struct EventRegistry {
    receivers: HashMap<TypeId, Vec<Arc<Receiver>>>,
    on_exception: Option<ExceptionHook>,
    on_no_receiver: Option<NoReceiverHook>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of type `E`.
    pub fn register<E, F>(&mut self, name: &'static str, dispatch: Dispatch, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler = move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        };
        self.receivers
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Arc::new(Receiver {
                name,
                event: type_name::<E>(),
                dispatch,
                handler: Box::new(handler),
            }));
        self
    }

    /// Hook invoked when a receiver panics. Without one, the panic is logged.
    pub fn on_exception<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&ReceiverFailure) + Send + Sync + 'static,
    {
        self.on_exception = Some(Arc::new(hook));
        self
    }

    /// Hook invoked with the event type name when nothing is registered for it.
    pub fn on_no_receiver<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&'static str) + Send + Sync + 'static,
    {
        self.on_no_receiver = Some(Arc::new(hook));
        self
    }

    /// Number of receivers registered for `E`.
    pub fn receiver_count<E: Event>(&self) -> usize {
        self.receivers.get(&TypeId::of::<E>()).map_or(0, Vec::len)
    }

    /// Freeze the registry into a bus dispatching onto `lanes`.
    pub fn build(self, lanes: Arc<LanePool>) -> EventBus {
        EventBus {
            receivers: self.receivers,
            on_exception: self.on_exception,
            on_no_receiver: self.on_no_receiver,
            lanes,
        }
    }
}

/// Posts events to their registered receivers.
pub struct EventBus {
    receivers: HashMap<TypeId, Vec<Arc<Receiver>>>,
    on_exception: Option<ExceptionHook>,
    on_no_receiver: Option<NoReceiverHook>,
    lanes: Arc<LanePool>,
}

impl EventBus {
    /// Deliver `event` to every receiver registered for its type.
    ///
    /// Current-thread receivers have run by the time this returns; lane
    /// receivers are queued.
    pub fn post<E: Event>(&self, event: E) -> BurrowResult<()> {
        let Some(receivers) = self.receivers.get(&TypeId::of::<E>()) else {
            match &self.on_no_receiver {
                Some(hook) => hook(type_name::<E>()),
                None => tracing::trace!(event = type_name::<E>(), "No receiver for event"),
            }
            return Ok(());
        };

        let event = Arc::new(event);
        let hash = event.executor_hash();
        for receiver in receivers {
            match receiver.dispatch {
                Dispatch::CurrentThread => {
                    invoke(receiver, &*event, self.on_exception.as_ref());
                }
                Dispatch::Lane => {
                    let receiver = Arc::clone(receiver);
                    let event = Arc::clone(&event);
                    let hook = self.on_exception.clone();
                    self.lanes.execute(hash, move || {
                        invoke(&receiver, &*event, hook.as_ref());
                    })?;
                }
            }
        }
        Ok(())
    }

    /// The lane pool asynchronous receivers run on.
    pub fn lanes(&self) -> &Arc<LanePool> {
        &self.lanes
    }
}

fn invoke(receiver: &Receiver, event: &dyn Any, hook: Option<&ExceptionHook>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| (receiver.handler)(event)));
    let Err(payload) = outcome else {
        return;
    };
    let failure = ReceiverFailure {
        receiver: receiver.name,
        event: receiver.event,
        message: panic_message(payload.as_ref()),
    };
    match hook {
        Some(hook) => hook(&failure),
        None => tracing::error!(
            receiver = failure.receiver,
            event = failure.event,
            error = %failure.message,
            "Event receiver panicked"
        ),
    }
}
