//! Calculation collaborator boundary.
//!
//! The formulas that turn motor positions into photon energy, bandwidth and
//! grating identity are maintained by beamline scientists outside this crate.
//! The IOC only sees them through [`MonoCalculator`]. Production uses the
//! Rhai-backed [`ScriptCalculator`](crate::scripting::ScriptCalculator); tests
//! use [`MockCalculator`].

pub mod mock;

pub use mock::{CalcCall, MockCalculator};

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Energy and cff, produced together by one calculation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyCff {
    /// Photon energy in eV
    pub energy: f64,
    /// Fixed-focus constant
    pub cff: f64,
}

/// The three functions the IOC needs from the calculation module.
///
/// All three are treated as pure. An `Err` aborts only the update that made
/// the call.
#[async_trait]
pub trait MonoCalculator: Send + Sync {
    /// Energy and cff from grating pitch and mirror pitch.
    async fn energy_and_cff(&self, grating_pitch: f64, mirror_pitch: f64)
        -> AppResult<EnergyCff>;

    /// Bandwidth from exit gap, grating pitch and mirror pitch.
    async fn bandwidth(
        &self,
        exit_gap: f64,
        grating_pitch: f64,
        mirror_pitch: f64,
    ) -> AppResult<f64>;

    /// Name of the grating currently in the beam.
    async fn grating(&self) -> AppResult<String>;
}
