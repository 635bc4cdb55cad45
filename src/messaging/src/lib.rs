use std::sync::Arc;

pub mod bus;
pub mod messages;

pub use bus::EventBus;
pub use messages::{Event, EventEnvelope, Severity};

/// Receiver of published events.
///
/// Publishing never fails and never blocks; sinks with no subscribers
/// simply drop or record the event.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: Event) {}
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn publish(&self, event: Event) {
        (**self).publish(event)
    }
}
