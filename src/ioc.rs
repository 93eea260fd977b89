//! IOC startup and event loop.
//!
//! Startup runs in a fixed order: the calculator is loaded first, then the
//! output records are built, then every upstream signal is subscribed. Only
//! once all four subscriptions exist does the source start delivering and
//! the records get served.
//!
//! ```text
//! Subscription(G_PI) --forward--+
//! Subscription(M_PI) --forward--+--mpsc--> ConnectedIoc::run --> UpdateDispatcher
//! Subscription(GAP)  --forward--+
//! Subscription(G_H)  --forward--+
//! ```
//!
//! The loop handles one sample at a time, so slot state needs no locking.

use crate::calc::MonoCalculator;
use crate::config::Settings;
use crate::dispatch::{Deadband, UpdateDispatcher, UpdateOutcome};
use crate::error::AppResult;
use crate::record::OutputRecords;
use crate::scripting::ScriptCalculator;
use crate::signal::{InputSlot, Sample, SignalSource, Subscription};
use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Capacity of the channel between the forwarders and the loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A sample tagged with the slot it arrived on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotSample {
    /// Destination slot
    pub slot: InputSlot,
    /// The sample
    pub sample: Sample,
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Samples stored and recomputed
    pub accepted: u64,
    /// Samples within the deadband
    pub rejected: u64,
    /// Samples whose recompute failed
    pub failed: u64,
}

impl LoopStats {
    /// Total samples handled.
    pub fn handled(&self) -> u64 {
        self.accepted + self.rejected + self.failed
    }
}

/// A configured but not yet connected IOC.
pub struct Ioc {
    settings: Settings,
    calculator: Arc<dyn MonoCalculator>,
    records: Arc<OutputRecords>,
}

impl std::fmt::Debug for Ioc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ioc")
            .field("prefix", &self.settings.server.prefix)
            .field("records", &self.records)
            .finish()
    }
}

impl Ioc {
    /// Load the script calculator named in `settings` and build the records.
    ///
    /// A calculator that fails to load is returned as an error; the IOC
    /// never starts without one.
    pub fn from_settings(settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        let calculator = ScriptCalculator::from_settings(&settings.calculation)?;
        Ok(Self::with_calculator(settings, Arc::new(calculator)))
    }

    /// Build an IOC around an already constructed calculator.
    pub fn with_calculator(settings: Settings, calculator: Arc<dyn MonoCalculator>) -> Self {
        let records = Arc::new(OutputRecords::new(&settings.server.prefix));
        Self {
            settings,
            calculator,
            records,
        }
    }

    /// The output records.
    pub fn records(&self) -> Arc<OutputRecords> {
        self.records.clone()
    }

    /// Effective settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to the four upstream signals, then start the source.
    ///
    /// Any refused subscription fails the whole connect.
    pub async fn connect(self, source: &dyn SignalSource) -> AppResult<ConnectedIoc> {
        let names = self.settings.upstream.names();
        info!("Subscribing to {:?}", names);
        let subscriptions = try_join_all(names.iter().map(|name| source.subscribe(name))).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let forwarders: Vec<JoinHandle<()>> = InputSlot::ALL
            .into_iter()
            .zip(subscriptions)
            .map(|(slot, subscription)| spawn_forwarder(slot, subscription, tx.clone()))
            .collect();
        drop(tx);

        if let Err(e) = source.start().await {
            for forwarder in &forwarders {
                forwarder.abort();
            }
            return Err(e);
        }

        let dispatcher = UpdateDispatcher::new(
            Deadband::new(self.settings.dispatch.deadband),
            self.calculator,
            self.records.clone(),
        );

        for record in self.records.all() {
            info!("Serving {}", record.name());
        }

        Ok(ConnectedIoc {
            dispatcher,
            rx,
            forwarders,
        })
    }
}

fn spawn_forwarder(
    slot: InputSlot,
    mut subscription: Subscription,
    tx: mpsc::Sender<SlotSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = subscription.next().await {
            if tx.send(SlotSample { slot, sample }).await.is_err() {
                break;
            }
        }
        debug!("Subscription {} ({}) closed", subscription.name(), slot);
    })
}

/// An IOC with live subscriptions, ready to run its event loop.
#[derive(Debug)]
pub struct ConnectedIoc {
    dispatcher: UpdateDispatcher,
    rx: mpsc::Receiver<SlotSample>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ConnectedIoc {
    /// The output records.
    pub fn records(&self) -> Arc<OutputRecords> {
        self.dispatcher.records().clone()
    }

    /// Handle samples until `shutdown` resolves or every subscription closes.
    ///
    /// A failed recompute is logged and the loop carries on with the next
    /// sample.
    pub async fn run<F>(mut self, shutdown: F) -> AppResult<LoopStats>
    where
        F: Future<Output = ()>,
    {
        info!("Event loop started");
        tokio::pin!(shutdown);
        let mut stats = LoopStats::default();

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = self.rx.recv() => event,
            };
            let Some(SlotSample { slot, sample }) = event else {
                info!("All subscriptions closed");
                break;
            };

            match self.dispatcher.handle(slot, sample).await {
                Ok(UpdateOutcome::Accepted { .. }) => stats.accepted += 1,
                Ok(UpdateOutcome::Rejected) => stats.rejected += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!("Update of {} to {} failed: {}", slot, sample.value, e);
                }
            }
        }

        for forwarder in self.forwarders {
            forwarder.abort();
        }
        info!(
            "Event loop stopped: {} accepted, {} rejected, {} failed",
            stats.accepted, stats.rejected, stats.failed
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::MockCalculator;
    use crate::error::CalcError;
    use crate::signal::MockSignalSource;
    use async_trait::async_trait;

    /// Resolves names through a mock but refuses to start.
    struct StartFails(MockSignalSource);

    #[async_trait]
    impl SignalSource for StartFails {
        async fn subscribe(&self, name: &str) -> AppResult<Subscription> {
            self.0.subscribe(name).await
        }

        async fn start(&self) -> AppResult<()> {
            Err(CalcError::Subscription("start".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_start_releases_subscriptions() {
        let source = StartFails(MockSignalSource::new());
        let ioc = Ioc::with_calculator(Settings::default(), Arc::new(MockCalculator::default()));
        assert!(ioc.connect(&source).await.is_err());

        let mut receivers = usize::MAX;
        for _ in 0..100 {
            receivers = source.0.publish("SP1K1:MONO:MMS:G_PI.RBV", Sample::now(1.0));
            if receivers == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(receivers, 0);
    }

    #[tokio::test]
    async fn test_connect_fails_on_unknown_signal() {
        let source = MockSignalSource::with_known(["SP1K1:MONO:MMS:G_PI.RBV"]);
        let ioc = Ioc::with_calculator(Settings::default(), Arc::new(MockCalculator::default()));
        let err = ioc.connect(&source).await.unwrap_err();
        assert!(matches!(err, CalcError::Subscription(_)));
    }

    #[tokio::test]
    async fn test_loop_stops_when_source_closes() {
        let source = MockSignalSource::new();
        let ioc = Ioc::with_calculator(Settings::default(), Arc::new(MockCalculator::default()));
        let connected = ioc.connect(&source).await.unwrap();
        source.close();
        let stats = connected.run(std::future::pending()).await.unwrap();
        assert_eq!(stats, LoopStats::default());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let source = MockSignalSource::new();
        let ioc = Ioc::with_calculator(Settings::default(), Arc::new(MockCalculator::default()));
        let connected = ioc.connect(&source).await.unwrap();
        let stats = connected.run(async {}).await.unwrap();
        assert_eq!(stats.handled(), 0);
    }

    #[tokio::test]
    async fn test_buffered_samples_handled_before_close() {
        let source = MockSignalSource::new();
        let ioc = Ioc::with_calculator(Settings::default(), Arc::new(MockCalculator::default()));
        let records = ioc.records();
        let connected = ioc.connect(&source).await.unwrap();

        source.publish("SP1K1:MONO:MMS:G_H.RBV", Sample::now(1.0));
        source.publish("SP1K1:MONO:MMS:G_H.RBV", Sample::now(1.01));
        source.close();

        let stats = connected.run(std::future::pending()).await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(records.grating.get(), "MEG");
    }
}
