// Progress Broadcaster
// Topic registry delivering experiment events to connected subscribers

use crate::execution::events::{EventEnvelope, EventSink, ProgressEvent};
use crate::models::ExperimentId;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

type EnvelopeSender = mpsc::UnboundedSender<EventEnvelope>;

/// A live feed of one experiment's events.
///
/// Only events published after subscribing are delivered.
#[derive(Debug)]
pub struct Subscription {
    experiment_id: ExperimentId,
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl Subscription {
    pub fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    /// Wait for the next event. Returns `None` once the broadcaster is dropped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<EventEnvelope> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Fan-out of progress events keyed by experiment id
#[derive(Debug, Default)]
pub struct ProgressBroadcaster {
    topics: DashMap<ExperimentId, Vec<EnvelopeSender>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber for an experiment
    pub fn subscribe(&self, experiment_id: ExperimentId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(experiment_id).or_default().push(tx);
        Subscription { experiment_id, rx }
    }

    /// Number of connected subscribers for an experiment
    pub fn subscriber_count(&self, experiment_id: ExperimentId) -> usize {
        self.topics
            .get(&experiment_id)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drop every subscriber of an experiment; their `recv` returns `None`
    pub fn close(&self, experiment_id: ExperimentId) {
        if let Some((_, subscribers)) = self.topics.remove(&experiment_id) {
            debug!(experiment_id, subscribers = subscribers.len(), "closed event topic");
        }
    }
}

impl EventSink for ProgressBroadcaster {
    fn publish(&self, experiment_id: ExperimentId, event: ProgressEvent) {
        let kind = event.kind();
        let envelope = EventEnvelope::new(experiment_id, event);

        let delivered = match self.topics.get_mut(&experiment_id) {
            Some(mut subscribers) => {
                subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
                subscribers.len()
            }
            None => 0,
        };

        if delivered == 0 {
            self.topics
                .remove_if(&experiment_id, |_, subscribers| subscribers.is_empty());
        }

        debug!(experiment_id, event = kind, delivered, "published progress event");
    }
}
