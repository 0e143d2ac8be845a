//! Close/error notification shared by the session-bound transports.
//!
//! A transport finishes exactly once. Every subscribed observer runs once on
//! that transition, whether it was triggered by `close` or by an error.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, PoisonError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Closed,
    Errored(String),
}

type Observer = Box<dyn FnOnce(TransportEvent) + Send>;

#[derive(Default)]
pub struct Lifecycle {
    finished: AtomicBool,
    observers: Mutex<Vec<Observer>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Adds an observer alongside any existing ones. Subscribing after the
    /// transport already finished runs the observer immediately with `Closed`.
    pub fn subscribe(&self, observer: impl FnOnce(TransportEvent) + Send + 'static) {
        {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_finished() {
                observers.push(Box::new(observer));
                return;
            }
        }

        observer(TransportEvent::Closed);
    }

    /// Returns `true` only for the call that performed the transition.
    pub fn finish(&self, event: TransportEvent) -> bool {
        let observers = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            if self.finished.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *observers)
        };

        // Observers run outside the lock; they may touch the transport again.
        for observer in observers {
            observer(event.clone());
        }
        true
    }
}
