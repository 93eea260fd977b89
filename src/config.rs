//! Configuration system using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (the SP1K1 deployment)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SP1K1_`, nested with `__`
//!
//! ```text
//! SP1K1_SERVER__PREFIX="SP1K1:MONO:TEST:"
//! SP1K1_DISPATCH__DEADBAND=0.1
//! SP1K1_CALCULATION__PATH=/tmp/rix_utilities.rhai
//! ```
//!
//! The CLI applies its own flags on top of the loaded settings before
//! [`Settings::validate`] runs.

use crate::error::{AppResult, CalcError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SP1K1_";

/// Top-level IOC settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Output record server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream motor read-back PV names
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Change filtering
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Calculation module location
    #[serde(default)]
    pub calculation: CalculationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name, used in log output
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Output record configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Prefix prepended to every published record name
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

/// The four signals the IOC subscribes to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Grating pitch read-back
    #[serde(default = "default_grating_pitch")]
    pub grating_pitch: String,
    /// Mirror pitch read-back
    #[serde(default = "default_mirror_pitch")]
    pub mirror_pitch: String,
    /// Exit slit gap read-back
    #[serde(default = "default_exit_gap")]
    pub exit_gap: String,
    /// Grating horizontal read-back
    #[serde(default = "default_grating_horizontal")]
    pub grating_horizontal: String,
}

/// Deadband applied to every upstream signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Motor moves smaller than or equal to this are ignored
    #[serde(default = "default_deadband")]
    pub deadband: f64,
}

/// Where the calculation module lives and what it needs from the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculationConfig {
    /// Path to the scientist-maintained calculation file
    #[serde(default = "default_calc_path")]
    pub path: PathBuf,
    /// Logical module name the file is registered under
    #[serde(default = "default_module_name")]
    pub module_name: String,
    /// Extra facility namespaces bound as empty stubs, on top of the ones the
    /// script declares itself
    #[serde(default)]
    pub stub_namespaces: Vec<String>,
    /// Rhai operation budget per calculation call
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "ioc-rix-sp1k1-calc".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_prefix() -> String {
    "SP1K1:MONO:CALC:".to_string()
}

fn default_grating_pitch() -> String {
    "SP1K1:MONO:MMS:G_PI.RBV".to_string()
}

fn default_mirror_pitch() -> String {
    "SP1K1:MONO:MMS:M_PI.RBV".to_string()
}

fn default_exit_gap() -> String {
    "SL1K2:EXIT:MMS:GAP.RBV".to_string()
}

fn default_grating_horizontal() -> String {
    "SP1K1:MONO:MMS:G_H.RBV".to_string()
}

fn default_deadband() -> f64 {
    0.05
}

fn default_calc_path() -> PathBuf {
    PathBuf::from("/cds/home/opr/rixopr/scripts/rix_utilities.rhai")
}

fn default_module_name() -> String {
    "rix_utilities".to_string()
}

fn default_max_operations() -> u64 {
    100_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            grating_pitch: default_grating_pitch(),
            mirror_pitch: default_mirror_pitch(),
            exit_gap: default_exit_gap(),
            grating_horizontal: default_grating_horizontal(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadband: default_deadband(),
        }
    }
}

impl Default for CalculationConfig {
    fn default() -> Self {
        Self {
            path: default_calc_path(),
            module_name: default_module_name(),
            stub_namespaces: Vec::new(),
            max_operations: default_max_operations(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    ///
    /// A missing file is not an error; figment treats it as an empty source.
    /// Validation is left to the caller so CLI overrides can be applied first.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string layered over the defaults.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    ///
    /// Checks the log level, that the deadband is finite and non-negative,
    /// that every PV name is non-empty and that the four upstream names are
    /// distinct.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(CalcError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let deadband = self.dispatch.deadband;
        if !deadband.is_finite() || deadband < 0.0 {
            return Err(CalcError::Configuration(format!(
                "Invalid deadband {}. Must be a finite value >= 0",
                deadband
            )));
        }

        if self.server.prefix.is_empty() {
            return Err(CalcError::Configuration(
                "'server.prefix' cannot be empty".to_string(),
            ));
        }

        let upstream = self.upstream.names();
        let mut seen = std::collections::HashSet::new();
        for name in upstream {
            if name.is_empty() {
                return Err(CalcError::Configuration(
                    "Upstream PV names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(name) {
                return Err(CalcError::Configuration(format!(
                    "Duplicate upstream PV name: '{}'",
                    name
                )));
            }
        }

        if self.calculation.module_name.is_empty() {
            return Err(CalcError::Configuration(
                "'calculation.module_name' cannot be empty".to_string(),
            ));
        }
        if self.calculation.max_operations == 0 {
            return Err(CalcError::Configuration(
                "'calculation.max_operations' must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl UpstreamConfig {
    /// Names in slot order: grating pitch, mirror pitch, exit gap, grating horizontal.
    pub fn names(&self) -> [&str; 4] {
        [
            &self.grating_pitch,
            &self.mirror_pitch,
            &self.exit_gap,
            &self.grating_horizontal,
        ]
    }
}
