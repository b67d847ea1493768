use dashmap::DashMap;
use tokio::sync::broadcast;

use super::models::ExecutionEvent;

/// Default per-run channel capacity. Slow subscribers beyond this lag and
/// re-read persisted state.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Fire-and-forget announcements on one broadcast channel per run.
///
/// Losing a message never loses data: the execution record stays
/// authoritative and subscribers resynchronise from it.
pub struct EventPublisher {
    channels: DashMap<String, broadcast::Sender<ExecutionEvent>>,
    capacity: usize,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn channel_name(run_id: &str) -> String {
        format!("workflow:{}", run_id)
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn publish(&self, event: ExecutionEvent) -> usize {
        let key = Self::channel_name(&event.execution_id);
        tracing::debug!(channel = %key, status = %event.status, "publishing event");

        let closes = event.status.closes_stream();
        let sent = match self.channels.get(&key) {
            Some(tx) => tx.send(event).ok(),
            None => return 0,
        };
        match sent {
            Some(receivers) => {
                // Nothing follows a terminal event. Receivers still drain what was buffered.
                if closes {
                    self.channels.remove(&key);
                }
                receivers
            }
            None => {
                // Nobody listening any more.
                self.channels
                    .remove_if(&key, |_, tx| tx.receiver_count() == 0);
                0
            }
        }
    }

    /// Drop the run's channel if nobody is subscribed any more. Returns true
    /// when a channel was removed.
    pub fn release(&self, run_id: &str) -> bool {
        self.channels
            .remove_if(&Self::channel_name(run_id), |_, tx| tx.receiver_count() == 0)
            .is_some()
    }

    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<ExecutionEvent> {
        self.channels
            .entry(Self::channel_name(run_id))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.channels
            .get(&Self::channel_name(run_id))
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of runs with a live channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
