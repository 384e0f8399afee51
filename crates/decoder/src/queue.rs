//! Event queue bridging the engine's callback thread and the pipeline thread.
//!
//! Producers hold an [`EventSender`] and never block; the single consumer
//! owns the [`EventQueue`] and pulls events in FIFO order during a
//! reconciliation pass. The queue is the only structure shared between the
//! two threads.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::event::DecodeEvent;

/// Producer side, cloned into whatever runs the engine callbacks.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<DecodeEvent>,
}

impl EventSender {
    /// Enqueue an event. Never blocks and never fails; if the consumer is
    /// gone the event is discarded.
    pub fn push(&self, event: DecodeEvent) {
        trace!(kind = event.kind(), "Queueing decode event");
        if self.tx.send(event).is_err() {
            debug!("Event queue consumer dropped; discarding event");
        }
    }
}

/// Consumer side of the event queue.
#[derive(Debug)]
pub struct EventQueue {
    tx: Sender<DecodeEvent>,
    rx: Receiver<DecodeEvent>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// A new producer handle for this queue.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Pop the oldest event, if any.
    pub fn pop(&self) -> Option<DecodeEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            // Unreachable while `self.tx` is alive, but harmless.
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take every event enqueued so far, oldest first.
    pub fn drain(&self) -> Vec<DecodeEvent> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Discard everything still queued; returns how many events were dropped.
    pub fn purge(&self) -> usize {
        self.rx.try_iter().count()
    }
}
