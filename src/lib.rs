//! Soft IOC for the SP1K1 monochromator.
//!
//! Watches four motor read-backs (grating pitch, mirror pitch, exit-slit gap
//! and grating horizontal position) and publishes the derived photon energy,
//! cff, bandwidth and active grating as records under a configurable prefix.
//! The physics lives in a facility-maintained Rhai file loaded at startup.
//!
//! The binary wires these pieces together; the library is used directly by
//! the integration tests.

pub mod calc;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ioc;
pub mod record;
pub mod scripting;
pub mod signal;

pub use error::{AppResult, CalcError};
