//! Name-keyed broadcast hub shared by the in-process signal sources.

use super::{Sample, Subscription};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Default per-signal channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Routes samples to subscribers by signal name.
///
/// Channels are created lazily on first `subscribe` or `publish`. Publishing
/// to a name nobody listens to drops the sample.
#[derive(Debug)]
pub struct SampleHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Sample>>>,
    capacity: usize,
}

impl Default for SampleHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SampleHub {
    /// Create a hub whose channels buffer `capacity` samples each.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, name: &str) -> broadcast::Sender<Sample> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Attach a new subscription to `name`.
    pub fn subscribe(&self, name: &str) -> Subscription {
        Subscription::new(name, self.sender(name).subscribe())
    }

    /// Deliver a sample; returns how many subscribers received it.
    pub fn publish(&self, name: &str, sample: Sample) -> usize {
        self.sender(name).send(sample).unwrap_or(0)
    }

    /// Drop every channel, ending all subscriptions.
    pub fn close(&self) {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
