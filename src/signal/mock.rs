//! A mock control-system client for tests and simulation.
use super::{hub::SampleHub, Sample, SignalSource, Subscription};
use crate::error::{AppResult, CalcError};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, info};

/// In-process signal source.
///
/// Samples are injected with [`MockSignalSource::publish`]. When built with
/// [`MockSignalSource::with_known`], subscribing to any other name fails the
/// way an unresolvable PV would.
#[derive(Debug, Default)]
pub struct MockSignalSource {
    hub: SampleHub,
    known: Option<HashSet<String>>,
}

impl MockSignalSource {
    /// Create a source that accepts any signal name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source that only resolves the given names.
    pub fn with_known<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hub: SampleHub::default(),
            known: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    /// Inject a sample for `name`; returns the number of subscribers reached.
    pub fn publish(&self, name: &str, sample: Sample) -> usize {
        self.hub.publish(name, sample)
    }

    /// Disconnect every subscriber.
    pub fn close(&self) {
        info!("Closing mock signal source");
        self.hub.close();
    }
}

#[async_trait]
impl SignalSource for MockSignalSource {
    async fn subscribe(&self, name: &str) -> AppResult<Subscription> {
        if let Some(known) = &self.known {
            if !known.contains(name) {
                return Err(CalcError::Subscription(name.to_string()));
            }
        }
        debug!("Mock subscription to {}", name);
        Ok(self.hub.subscribe(name))
    }
}
