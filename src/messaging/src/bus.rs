use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use common::config::EventsConfig;
use futures::Stream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::messages::{Event, EventEnvelope};
use crate::EventSink;

struct History {
    routine: VecDeque<EventEnvelope>,
    critical: VecDeque<EventEnvelope>,
}

struct Inner {
    sender: broadcast::Sender<EventEnvelope>,
    history: Mutex<History>,
    history_limit: usize,
    critical_limit: usize,
    sequence: AtomicU64,
}

/// In-process event fan-out.
///
/// Every published event goes to all live subscribers and into a bounded
/// rolling history. Critical alerts are additionally kept in their own
/// bounded slot so routine traffic cannot evict them.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.sender.receiver_count())
            .field("history_limit", &self.inner.history_limit)
            .field("critical_limit", &self.inner.critical_limit)
            .finish()
    }
}

impl EventBus {
    pub fn new(config: &EventsConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender,
                history: Mutex::new(History {
                    routine: VecDeque::with_capacity(config.history_limit),
                    critical: VecDeque::with_capacity(config.critical_history_limit),
                }),
                history_limit: config.history_limit,
                critical_limit: config.critical_history_limit,
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event, returning the number of subscribers it reached.
    pub fn send(&self, event: Event) -> usize {
        let envelope = EventEnvelope {
            sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event,
        };

        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if envelope.event.is_critical() {
                push_bounded(&mut history.critical, envelope.clone(), self.inner.critical_limit);
            }
            push_bounded(&mut history.routine, envelope.clone(), self.inner.history_limit);
        }

        // No receivers is not an error for a fan-out sink
        self.inner.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.sender.subscribe()
    }

    /// Subscribe as a stream. Lagging subscribers skip what they missed.
    pub fn stream(&self) -> Pin<Box<dyn Stream<Item = EventEnvelope> + Send>> {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|item| async move {
            match item {
                Ok(envelope) => Some(envelope),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged behind");
                    None
                }
            }
        });
        Box::pin(stream)
    }

    /// Most recent events, newest last. `limit` caps the number returned.
    pub fn recent(&self, limit: Option<usize>) -> Vec<EventEnvelope> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let limit = limit.unwrap_or(history.routine.len());
        let skip = history.routine.len().saturating_sub(limit);
        history.routine.iter().skip(skip).cloned().collect()
    }

    /// Retained critical alerts, newest last.
    pub fn critical(&self) -> Vec<EventEnvelope> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .critical
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) {
        self.send(event);
    }
}

fn push_bounded(buffer: &mut VecDeque<EventEnvelope>, envelope: EventEnvelope, limit: usize) {
    if limit == 0 {
        return;
    }
    while buffer.len() >= limit {
        buffer.pop_front();
    }
    buffer.push_back(envelope);
}
