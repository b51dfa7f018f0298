//! Per-session broadcast to a dynamic set of subscribers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::EventFrame;

/// Output sink of one subscriber.
pub type EventSink = mpsc::UnboundedSender<EventFrame>;

/// Handle returned by [`Fanout::subscribe`].
pub type SubscriberId = Uuid;

/// Subscriber set with ordered, non-blocking delivery.
///
/// Sinks are unbounded, so a slow subscriber never stalls a turn. A sink
/// whose receiver is gone is dropped during the next broadcast without
/// affecting delivery to the rest.
#[derive(Debug, Default)]
pub struct Fanout {
    sinks: Mutex<Vec<(SubscriberId, EventSink)>>,
}

impl Fanout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sinks(&self) -> MutexGuard<'_, Vec<(SubscriberId, EventSink)>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a sink.
    pub fn subscribe(&self, sink: EventSink) -> SubscriberId {
        let id = Uuid::new_v4();
        self.sinks().push((id, sink));
        id
    }

    /// Remove a sink. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut sinks = self.sinks();
        let before = sinks.len();
        sinks.retain(|(existing, _)| *existing != id);
        sinks.len() != before
    }

    /// Deliver a frame to every live subscriber, returning how many received it.
    pub fn broadcast(&self, frame: &EventFrame) -> usize {
        let mut sinks = self.sinks();
        let mut delivered = 0;
        sinks.retain(|(id, sink)| {
            if sink.send(frame.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                tracing::debug!(subscriber = %id, session_id = %frame.session_id, "Dropping closed subscriber");
                false
            }
        });
        delivered
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
