//! A mock calculator that records every call.
//!
//! The formulas are arbitrary but deterministic so tests can predict the
//! published values:
//!
//! - energy = 100 * grating_pitch + mirror_pitch
//! - cff = grating_pitch - mirror_pitch
//! - bandwidth = exit_gap / 100 + grating_pitch + mirror_pitch

use super::{EnergyCff, MonoCalculator};
use crate::error::{AppResult, CalcError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One recorded calculator invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CalcCall {
    /// `energy_and_cff(grating_pitch, mirror_pitch)`
    EnergyAndCff(f64, f64),
    /// `bandwidth(exit_gap, grating_pitch, mirror_pitch)`
    Bandwidth(f64, f64, f64),
    /// `grating()`
    Grating,
}

/// Deterministic, call-recording [`MonoCalculator`].
#[derive(Debug)]
pub struct MockCalculator {
    grating: Mutex<String>,
    calls: Mutex<Vec<CalcCall>>,
    failing: AtomicBool,
}

impl Default for MockCalculator {
    fn default() -> Self {
        Self::new("MEG")
    }
}

impl MockCalculator {
    /// Create a calculator that reports `grating` as the active grating.
    pub fn new(grating: impl Into<String>) -> Self {
        Self {
            grating: Mutex::new(grating.into()),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Change the reported grating.
    pub fn set_grating(&self, grating: impl Into<String>) {
        *self.grating.lock().unwrap_or_else(|p| p.into_inner()) = grating.into();
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls made so far.
    pub fn calls(&self) -> Vec<CalcCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn record(&self, call: CalcCall) -> AppResult<()> {
        let function = match &call {
            CalcCall::EnergyAndCff(..) => "calc_E",
            CalcCall::Bandwidth(..) => "calc_BW",
            CalcCall::Grating => "get_grating",
        };
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CalcError::Script {
                function: function.to_string(),
                message: "mock failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MonoCalculator for MockCalculator {
    async fn energy_and_cff(
        &self,
        grating_pitch: f64,
        mirror_pitch: f64,
    ) -> AppResult<EnergyCff> {
        self.record(CalcCall::EnergyAndCff(grating_pitch, mirror_pitch))?;
        Ok(EnergyCff {
            energy: 100.0 * grating_pitch + mirror_pitch,
            cff: grating_pitch - mirror_pitch,
        })
    }

    async fn bandwidth(
        &self,
        exit_gap: f64,
        grating_pitch: f64,
        mirror_pitch: f64,
    ) -> AppResult<f64> {
        self.record(CalcCall::Bandwidth(exit_gap, grating_pitch, mirror_pitch))?;
        Ok(exit_gap / 100.0 + grating_pitch + mirror_pitch)
    }

    async fn grating(&self) -> AppResult<String> {
        self.record(CalcCall::Grating)?;
        Ok(self.grating.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}
