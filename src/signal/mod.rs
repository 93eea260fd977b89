//! Upstream signals and the control-system client boundary.
//!
//! The IOC consumes four motor read-backs. Each one is delivered through a
//! [`Subscription`] obtained from a [`SignalSource`], the seam where a real
//! control-system client plugs in.
//!
//! # Data Flow
//!
//! ```text
//! SignalSource --subscribe(name)--> Subscription --[Sample]--> Ioc event loop
//! ```
//!
//! Two sources ship with the crate:
//!
//! - [`MockSignalSource`]: in-process hub, samples are injected with `publish`
//! - [`JsonLinesSource`]: reads `{"pv": .., "value": .., "timestamp": ..}` lines

pub mod hub;
pub mod json_lines;
pub mod mock;

pub use hub::SampleHub;
pub use json_lines::JsonLinesSource;
pub use mock::MockSignalSource;

use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// One of the four upstream inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputSlot {
    /// Grating pitch
    GratingPitch,
    /// Mirror pitch
    MirrorPitch,
    /// Exit slit gap
    ExitGap,
    /// Grating horizontal position
    GratingHorizontal,
}

impl InputSlot {
    /// All slots, in the order the IOC subscribes to them.
    pub const ALL: [InputSlot; 4] = [
        InputSlot::GratingPitch,
        InputSlot::MirrorPitch,
        InputSlot::ExitGap,
        InputSlot::GratingHorizontal,
    ];

    /// Position of the slot in [`InputSlot::ALL`].
    pub fn index(self) -> usize {
        match self {
            InputSlot::GratingPitch => 0,
            InputSlot::MirrorPitch => 1,
            InputSlot::ExitGap => 2,
            InputSlot::GratingHorizontal => 3,
        }
    }

    /// Short motor label used in log output.
    pub fn label(self) -> &'static str {
        match self {
            InputSlot::GratingPitch => "G_PI",
            InputSlot::MirrorPitch => "M_PI",
            InputSlot::ExitGap => "GAP",
            InputSlot::GratingHorizontal => "G_H",
        }
    }
}

impl fmt::Display for InputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A time-stamped value delivered by a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Read-back value in engineering units
    pub value: f64,
    /// Timestamp assigned by the upstream IOC
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Create a sample.
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// Create a sample stamped with the current time.
    pub fn now(value: f64) -> Self {
        Self::new(value, Utc::now())
    }
}

/// Stream of samples for one named signal.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    rx: Feed,
}

#[derive(Debug)]
enum Feed {
    /// Fan-out channel; a slow reader loses the oldest samples
    Broadcast(broadcast::Receiver<Sample>),
    /// Bounded queue; the producer waits for the reader
    Queue(mpsc::Receiver<Sample>),
}

impl Subscription {
    /// Wrap a broadcast receiver.
    pub fn new(name: impl Into<String>, rx: broadcast::Receiver<Sample>) -> Self {
        Self {
            name: name.into(),
            rx: Feed::Broadcast(rx),
        }
    }

    /// Wrap a bounded queue. Nothing is ever skipped.
    pub fn from_queue(name: impl Into<String>, rx: mpsc::Receiver<Sample>) -> Self {
        Self {
            name: name.into(),
            rx: Feed::Queue(rx),
        }
    }

    /// Signal name this subscription is attached to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next sample. Returns `None` once the source has closed.
    ///
    /// A lagging broadcast receiver skips the samples it missed; only the
    /// most recent values matter for a live read-back.
    pub async fn next(&mut self) -> Option<Sample> {
        match &mut self.rx {
            Feed::Queue(rx) => rx.recv().await,
            Feed::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(sample) => return Some(sample),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscription {} lagged, skipped {} samples", self.name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

/// Control-system client boundary.
///
/// Implementations resolve signal names and hand back a [`Subscription`] for
/// each. `start` is called once after all subscriptions are in place, so a
/// source that produces samples on its own never emits before anyone listens.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Subscribe to a named signal.
    async fn subscribe(&self, name: &str) -> AppResult<Subscription>;

    /// Begin delivering samples.
    async fn start(&self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_index_matches_order() {
        for (i, slot) in InputSlot::ALL.iter().enumerate() {
            assert_eq!(slot.index(), i);
        }
    }

    #[tokio::test]
    async fn test_subscription_skips_lagged_samples() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new("TST:PV", rx);
        for v in 0..5 {
            tx.send(Sample::now(v as f64)).unwrap();
        }
        drop(tx);

        let first = sub.next().await.unwrap();
        assert_eq!(first.value, 3.0);
        assert_eq!(sub.next().await.unwrap().value, 4.0);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_queue_subscription_keeps_every_sample() {
        let (tx, rx) = mpsc::channel(2);
        let mut sub = Subscription::from_queue("TST:PV", rx);
        let producer = tokio::spawn(async move {
            for v in 0..5 {
                tx.send(Sample::now(v as f64)).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(sample) = sub.next().await {
            seen.push(sample.value);
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }
}
