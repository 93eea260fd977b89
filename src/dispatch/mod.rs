//! Update dispatch: deadband filtering, slot state and recompute fan-out.
//!
//! ```text
//! (slot, Sample) --> Deadband --accepted--> MonoState --dependents(slot)--> recompute steps
//!                        |                                                      |
//!                     rejected: nothing happens                  MonoCalculator + OutputRecords
//! ```
//!
//! The dependency table is static:
//!
//! | Slot                | Recompute steps        |
//! |---------------------|------------------------|
//! | grating pitch       | energy (+cff), bandwidth |
//! | mirror pitch        | energy (+cff), bandwidth |
//! | exit gap            | bandwidth              |
//! | grating horizontal  | grating                |

pub mod deadband;

pub use deadband::{Deadband, DEFAULT_DEADBAND};

use crate::calc::{EnergyCff, MonoCalculator};
use crate::error::AppResult;
use crate::record::OutputRecords;
use crate::signal::{InputSlot, Sample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// A recompute step. The energy step also produces cff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Output {
    /// Energy and cff
    Energy,
    /// Bandwidth
    Bandwidth,
    /// Active grating
    Grating,
}

impl Output {
    /// Slots that must all be set before the step calls the calculator.
    pub fn requires(self) -> &'static [InputSlot] {
        match self {
            Output::Energy => &[InputSlot::GratingPitch, InputSlot::MirrorPitch],
            Output::Bandwidth => &[
                InputSlot::ExitGap,
                InputSlot::GratingPitch,
                InputSlot::MirrorPitch,
            ],
            Output::Grating => &[InputSlot::GratingHorizontal],
        }
    }
}

/// Recompute steps triggered by an accepted sample on `slot`, in run order.
pub fn dependents(slot: InputSlot) -> &'static [Output] {
    match slot {
        InputSlot::GratingPitch | InputSlot::MirrorPitch => &[Output::Energy, Output::Bandwidth],
        InputSlot::ExitGap => &[Output::Bandwidth],
        InputSlot::GratingHorizontal => &[Output::Grating],
    }
}

/// Last accepted sample of one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    /// Last accepted value, `None` until the first sample
    pub value: Option<f64>,
    /// Timestamp of the last accepted sample
    pub timestamp: Option<DateTime<Utc>>,
}

/// The four input slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonoState {
    slots: [SlotState; 4],
}

impl MonoState {
    /// All slots unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last accepted value of `slot`.
    pub fn value(&self, slot: InputSlot) -> Option<f64> {
        self.slots[slot.index()].value
    }

    /// Full state of `slot`.
    pub fn slot(&self, slot: InputSlot) -> SlotState {
        self.slots[slot.index()]
    }

    /// Store an accepted sample.
    pub fn set(&mut self, slot: InputSlot, sample: Sample) {
        self.slots[slot.index()] = SlotState {
            value: Some(sample.value),
            timestamp: Some(sample.timestamp),
        };
    }

    /// Values of `slots`, or `None` if any is unset.
    pub fn values(&self, slots: &[InputSlot]) -> Option<Vec<f64>> {
        slots.iter().map(|s| self.value(*s)).collect()
    }
}

/// Result of handling one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Within the deadband; nothing changed.
    Rejected,
    /// Stored, and these steps were recomputed and published.
    Accepted {
        /// Steps that ran, in order
        recomputed: Vec<Output>,
    },
}

/// Owns the slot state and turns samples into published outputs.
///
/// One instance is driven by one task. Each call to [`UpdateDispatcher::handle`]
/// runs to completion before the next sample is looked at.
pub struct UpdateDispatcher {
    state: MonoState,
    deadband: Deadband,
    calculator: Arc<dyn MonoCalculator>,
    records: Arc<OutputRecords>,
}

impl std::fmt::Debug for UpdateDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateDispatcher")
            .field("state", &self.state)
            .field("deadband", &self.deadband)
            .finish()
    }
}

impl UpdateDispatcher {
    /// Create a dispatcher with every slot unset.
    pub fn new(
        deadband: Deadband,
        calculator: Arc<dyn MonoCalculator>,
        records: Arc<OutputRecords>,
    ) -> Self {
        Self {
            state: MonoState::new(),
            deadband,
            calculator,
            records,
        }
    }

    /// Current slot state.
    pub fn state(&self) -> &MonoState {
        &self.state
    }

    /// The records this dispatcher publishes to.
    pub fn records(&self) -> &Arc<OutputRecords> {
        &self.records
    }

    /// Handle one sample for `slot`.
    ///
    /// On acceptance the value is stored before any recompute runs. If a
    /// calculation fails the error is returned and the remaining steps for
    /// this sample are skipped; the stored value is kept.
    pub async fn handle(&mut self, slot: InputSlot, sample: Sample) -> AppResult<UpdateOutcome> {
        let current = self.state.value(slot);
        if !self.deadband.accepts(current, sample.value) {
            trace!(%slot, value = sample.value, ?current, "within deadband");
            return Ok(UpdateOutcome::Rejected);
        }

        debug!(%slot, value = sample.value, ?current, "accepted");
        self.state.set(slot, sample);

        let steps = dependents(slot);
        for step in steps {
            self.recompute(*step, sample.timestamp).await?;
        }
        Ok(UpdateOutcome::Accepted {
            recomputed: steps.to_vec(),
        })
    }

    /// Run one recompute step and publish its result with `timestamp`.
    ///
    /// If any required slot is unset the step publishes its default (0 or an
    /// empty string) without calling the calculator.
    pub async fn recompute(&self, output: Output, timestamp: DateTime<Utc>) -> AppResult<()> {
        let inputs = self.state.values(output.requires());
        match output {
            Output::Energy => {
                let result = match inputs.as_deref() {
                    Some(&[grating_pitch, mirror_pitch]) => {
                        self.calculator
                            .energy_and_cff(grating_pitch, mirror_pitch)
                            .await?
                    }
                    _ => EnergyCff {
                        energy: 0.0,
                        cff: 0.0,
                    },
                };
                self.records.energy.publish(result.energy, timestamp);
                self.records.cff.publish(result.cff, timestamp);
                debug!(energy = result.energy, cff = result.cff, "published energy");
            }
            Output::Bandwidth => {
                let bandwidth = match inputs.as_deref() {
                    Some(&[exit_gap, grating_pitch, mirror_pitch]) => {
                        self.calculator
                            .bandwidth(exit_gap, grating_pitch, mirror_pitch)
                            .await?
                    }
                    _ => 0.0,
                };
                self.records.bandwidth.publish(bandwidth, timestamp);
                debug!(bandwidth, "published bandwidth");
            }
            Output::Grating => {
                let grating = match inputs {
                    Some(_) => self.calculator.grating().await?,
                    None => String::new(),
                };
                debug!(grating = %grating, "published grating");
                self.records.grating.publish(grating, timestamp);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{CalcCall, MockCalculator};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn dispatcher() -> (UpdateDispatcher, Arc<MockCalculator>, Arc<OutputRecords>) {
        let calc = Arc::new(MockCalculator::new("MEG"));
        let records = Arc::new(OutputRecords::new("TST:"));
        let dispatcher = UpdateDispatcher::new(Deadband::default(), calc.clone(), records.clone());
        (dispatcher, calc, records)
    }

    #[test]
    fn test_dependency_table() {
        assert_eq!(
            dependents(InputSlot::GratingPitch),
            &[Output::Energy, Output::Bandwidth]
        );
        assert_eq!(
            dependents(InputSlot::MirrorPitch),
            &[Output::Energy, Output::Bandwidth]
        );
        assert_eq!(dependents(InputSlot::ExitGap), &[Output::Bandwidth]);
        assert_eq!(dependents(InputSlot::GratingHorizontal), &[Output::Grating]);
    }

    #[test]
    fn test_every_required_slot_triggers_the_step() {
        for output in [Output::Energy, Output::Bandwidth, Output::Grating] {
            for slot in output.requires() {
                assert!(dependents(*slot).contains(&output), "{slot} -> {output:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_defaults_before_ready() {
        let (mut d, calc, records) = dispatcher();

        let outcome = d
            .handle(InputSlot::GratingPitch, Sample::new(10.0, ts(1)))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Accepted {
                recomputed: vec![Output::Energy, Output::Bandwidth]
            }
        );
        assert!(calc.calls().is_empty());
        assert_eq!(records.energy.get(), 0.0);
        assert_eq!(records.cff.get(), 0.0);
        assert_eq!(records.bandwidth.get(), 0.0);
        // Defaults are still published with the sample time
        assert_eq!(records.energy.timestamp(), ts(1));
        assert_eq!(records.grating.get(), "");
    }

    #[tokio::test]
    async fn test_energy_computed_when_both_pitches_set() {
        let (mut d, calc, records) = dispatcher();
        d.handle(InputSlot::GratingPitch, Sample::new(10.0, ts(1)))
            .await
            .unwrap();
        d.handle(InputSlot::MirrorPitch, Sample::new(5.0, ts(2)))
            .await
            .unwrap();

        assert_eq!(calc.calls(), vec![CalcCall::EnergyAndCff(10.0, 5.0)]);
        assert_eq!(records.energy.get(), 1005.0);
        assert_eq!(records.cff.get(), 5.0);
        assert_eq!(records.energy.timestamp(), ts(2));
        assert_eq!(records.cff.timestamp(), ts(2));
        // Bandwidth still waits on the exit gap
        assert_eq!(records.bandwidth.get(), 0.0);
        assert_eq!(records.bandwidth.timestamp(), ts(2));
    }

    #[tokio::test]
    async fn test_bandwidth_needs_all_three() {
        let (mut d, calc, records) = dispatcher();
        d.handle(InputSlot::ExitGap, Sample::new(100.0, ts(1)))
            .await
            .unwrap();
        d.handle(InputSlot::GratingPitch, Sample::new(10.0, ts(2)))
            .await
            .unwrap();
        assert_eq!(records.bandwidth.get(), 0.0);

        d.handle(InputSlot::MirrorPitch, Sample::new(5.0, ts(3)))
            .await
            .unwrap();
        assert_eq!(records.bandwidth.get(), 16.0);
        assert_eq!(records.bandwidth.timestamp(), ts(3));
        assert!(calc.calls().contains(&CalcCall::Bandwidth(100.0, 10.0, 5.0)));
    }

    #[tokio::test]
    async fn test_within_deadband_changes_nothing() {
        let (mut d, calc, records) = dispatcher();
        d.handle(InputSlot::GratingPitch, Sample::new(10.0, ts(1)))
            .await
            .unwrap();
        d.handle(InputSlot::MirrorPitch, Sample::new(5.0, ts(2)))
            .await
            .unwrap();
        calc.clear_calls();
        let before = d.state().clone();
        let energy_before = records.energy.stamped();
        let mut rx = records.energy.subscribe();

        let outcome = d
            .handle(InputSlot::GratingPitch, Sample::new(10.03, ts(3)))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Rejected);
        assert_eq!(d.state(), &before);
        assert!(calc.calls().is_empty());
        assert_eq!(records.energy.stamped(), energy_before);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_outside_deadband_updates_and_recomputes() {
        let (mut d, calc, records) = dispatcher();
        d.handle(InputSlot::MirrorPitch, Sample::new(5.0, ts(1)))
            .await
            .unwrap();
        d.handle(InputSlot::GratingPitch, Sample::new(10.0, ts(2)))
            .await
            .unwrap();
        calc.clear_calls();

        let outcome = d
            .handle(InputSlot::GratingPitch, Sample::new(10.10, ts(3)))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Accepted { .. }));
        assert_eq!(d.state().value(InputSlot::GratingPitch), Some(10.10));
        assert_eq!(d.state().slot(InputSlot::GratingPitch).timestamp, Some(ts(3)));
        assert_eq!(calc.calls(), vec![CalcCall::EnergyAndCff(10.10, 5.0)]);
        assert_eq!(records.energy.timestamp(), ts(3));
    }

    #[tokio::test]
    async fn test_exit_gap_does_not_touch_energy() {
        let (mut d, calc, records) = dispatcher();
        d.handle(InputSlot::GratingPitch, Sample::new(10.0, ts(1)))
            .await
            .unwrap();
        d.handle(InputSlot::MirrorPitch, Sample::new(5.0, ts(2)))
            .await
            .unwrap();
        calc.clear_calls();
        let energy_before = records.energy.stamped();
        let cff_before = records.cff.stamped();

        let outcome = d
            .handle(InputSlot::ExitGap, Sample::new(50.0, ts(3)))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Accepted {
                recomputed: vec![Output::Bandwidth]
            }
        );
        assert_eq!(calc.calls(), vec![CalcCall::Bandwidth(50.0, 10.0, 5.0)]);
        assert_eq!(records.energy.stamped(), energy_before);
        assert_eq!(records.cff.stamped(), cff_before);
    }

    #[tokio::test]
    async fn test_grating_only_after_horizontal_sample() {
        let (mut d, calc, records) = dispatcher();
        d.handle(InputSlot::GratingPitch, Sample::new(10.0, ts(1)))
            .await
            .unwrap();
        d.handle(InputSlot::MirrorPitch, Sample::new(5.0, ts(2)))
            .await
            .unwrap();
        d.handle(InputSlot::ExitGap, Sample::new(50.0, ts(3)))
            .await
            .unwrap();
        assert!(!calc.calls().contains(&CalcCall::Grating));
        assert_eq!(records.grating.get(), "");

        let energy_before = records.energy.stamped();
        let bandwidth_before = records.bandwidth.stamped();
        d.handle(InputSlot::GratingHorizontal, Sample::new(-3.2, ts(4)))
            .await
            .unwrap();
        assert_eq!(calc.calls().last(), Some(&CalcCall::Grating));
        assert_eq!(records.grating.get(), "MEG");
        assert_eq!(records.grating.timestamp(), ts(4));
        assert_eq!(records.energy.stamped(), energy_before);
        assert_eq!(records.bandwidth.stamped(), bandwidth_before);
    }

    #[tokio::test]
    async fn test_calculation_error_keeps_value_and_outputs() {
        let (mut d, calc, records) = dispatcher();
        d.handle(InputSlot::GratingPitch, Sample::new(10.0, ts(1)))
            .await
            .unwrap();
        d.handle(InputSlot::MirrorPitch, Sample::new(5.0, ts(2)))
            .await
            .unwrap();
        let energy_before = records.energy.stamped();

        calc.set_failing(true);
        calc.clear_calls();
        let result = d
            .handle(InputSlot::MirrorPitch, Sample::new(6.0, ts(3)))
            .await;
        assert!(result.is_err());
        assert_eq!(d.state().value(InputSlot::MirrorPitch), Some(6.0));
        assert_eq!(records.energy.stamped(), energy_before);
        // The bandwidth step after the failing energy step never ran
        assert_eq!(calc.calls(), vec![CalcCall::EnergyAndCff(10.0, 6.0)]);

        calc.set_failing(false);
        d.handle(InputSlot::MirrorPitch, Sample::new(7.0, ts(4)))
            .await
            .unwrap();
        assert_eq!(records.energy.get(), 1007.0);
    }

    #[test]
    fn test_state_values_requires_all() {
        let mut state = MonoState::new();
        state.set(InputSlot::GratingPitch, Sample::new(1.0, ts(0)));
        assert_eq!(state.values(Output::Energy.requires()), None);
        state.set(InputSlot::MirrorPitch, Sample::new(2.0, ts(0)));
        assert_eq!(
            state.values(Output::Energy.requires()),
            Some(vec![1.0, 2.0])
        );
    }
}
