//! Custom error types for the IOC.
//!
//! `CalcError` is the single error type of the library. It follows the same
//! pattern as the rest of the stack: `thiserror` derives the `Display` output and
//! `#[from]` conversions let `?` lift errors from figment, I/O and serde_json.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: figment failed to read or deserialize the settings sources.
//! - **`Configuration`**: settings parsed but are semantically invalid (negative
//!   deadband, empty PV name, ...). Raised by `Settings::validate`.
//! - **`ScriptLoad`**: the calculation file could not be read or compiled. Fatal
//!   at startup since no output can ever be computed without it.
//! - **`Script`** / **`ScriptResult`**: a calculation function raised, or returned
//!   something that is not the expected shape. These terminate only the update
//!   that triggered the call.
//! - **`Subscription`**: the control-system client refused a signal name.
//! - **`Decode`**: a line of sample input could not be decoded.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CalcError>;

/// Errors raised by the calc IOC library.
#[derive(Error, Debug)]
pub enum CalcError {
    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The calculation file could not be loaded.
    #[error("Failed to load calculation module '{module}' from {path:?}: {message}")]
    ScriptLoad {
        /// Logical module name.
        module: String,
        /// File the module was loaded from.
        path: PathBuf,
        /// Underlying reason.
        message: String,
    },

    /// A calculation function raised.
    #[error("Calculation '{function}' failed: {message}")]
    Script {
        /// Function that was called.
        function: String,
        /// Error reported by the script engine.
        message: String,
    },

    /// A calculation function returned an unexpected value.
    #[error("Calculation '{function}' returned {found}, expected {expected}")]
    ScriptResult {
        /// Function that was called.
        function: String,
        /// Expected return shape.
        expected: String,
        /// Type actually returned.
        found: String,
    },

    /// The control-system client could not subscribe to a signal.
    #[error("Subscription to '{0}' failed")]
    Subscription(String),

    /// A sample could not be decoded.
    #[error("Malformed sample: {0}")]
    Decode(#[from] serde_json::Error),

    /// A blocking calculation task panicked or was cancelled.
    #[error("Calculation task failed: {0}")]
    Join(String),
}

impl From<figment::Error> for CalcError {
    fn from(err: figment::Error) -> Self {
        CalcError::Config(Box::new(err))
    }
}
