//! Script-backed calculation module.
//!
//! The facility keeps its monochromator formulas in a Rhai file that
//! scientists edit in place. [`ScriptCalculator`] loads that file once at
//! startup and exposes its functions through
//! [`MonoCalculator`](crate::calc::MonoCalculator).
//!
//! # Script Contract
//!
//! ```text
//! fn requires() { ["rix.db"] }            // optional: facility namespaces used
//!
//! fn calc_E(g_pi, m_pi) { [energy, cff] }
//! fn calc_BW(exit_gap, g_pi, m_pi) { bandwidth }
//! fn get_grating() { "MEG" }
//! ```
//!
//! Every namespace named by `requires()` (and by
//! `calculation.stub_namespaces` in the settings) is bound to an empty object
//! map, with dots replaced by underscores, so `rix_db.anything` evaluates to
//! `()` and the file loads without the facility's full runtime.

pub mod script_calc;

pub use script_calc::{stub_identifier, ScriptCalculator};
