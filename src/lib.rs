pub mod batch;
pub mod calibrate;
pub mod cli;
pub mod config;
pub mod dbase;
pub mod error;
pub mod events;
pub mod export;
pub mod persist;
pub mod photometer;
pub mod reader;
pub mod ring;
pub mod stats;
pub mod writer;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

/// Version string recorded in every persisted calibration summary.
pub const CALVERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// The two ends of a calibration: the known-good reference photometer and the
/// unit under test. A role selects configuration sections and tags every
/// derived record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ref,
    Test,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Ref, Role::Test];

    /// Config section holding the device parameters for this role.
    pub fn device_section(&self) -> &'static str {
        match self {
            Role::Ref => "ref-device",
            Role::Test => "test-device",
        }
    }

    /// Config section holding the statistics parameters for this role.
    pub fn stats_section(&self) -> &'static str {
        match self {
            Role::Ref => "ref-stats",
            Role::Test => "test-stats",
        }
    }

    /// Short fixed-width tag for log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Role::Ref => "REF.",
            Role::Test => "TEST",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Ref => write!(f, "ref"),
            Role::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ref" => Ok(Role::Ref),
            "test" => Ok(Role::Test),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Central tendency
// ---------------------------------------------------------------------------

/// Central-tendency estimator used over ring-buffer frequencies. Doubles as
/// the method tag of the `best()` summary selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CentralTendency {
    Median,
    Mean,
    Mode,
}

impl fmt::Display for CentralTendency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralTendency::Median => write!(f, "median"),
            CentralTendency::Mean => write!(f, "mean"),
            CentralTendency::Mode => write!(f, "mode"),
        }
    }
}

impl FromStr for CentralTendency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "median" => Ok(CentralTendency::Median),
            "mean" => Ok(CentralTendency::Mean),
            "mode" => Ok(CentralTendency::Mode),
            _ => Err(format!("unknown central tendency: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Calibration kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Calibration {
    Auto,
    Manual,
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Calibration::Auto => write!(f, "auto"),
            Calibration::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for Calibration {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Calibration::Auto),
            "manual" => Ok(Calibration::Manual),
            _ => Err(format!("unknown calibration kind: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Photometer model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Model {
    TessW,
    TessP,
    Tas,
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Model::TessW => write!(f, "TESS-W"),
            Model::TessP => write!(f, "TESS-P"),
            Model::Tas => write!(f, "TAS"),
        }
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TESS-W" | "TESSW" => Ok(Model::TessW),
            "TESS-P" | "TESSP" => Ok(Model::TessP),
            "TAS" => Ok(Model::Tas),
            _ => Err(format!("unknown photometer model: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Sample message
// ---------------------------------------------------------------------------

/// One timestamped reading produced by a photometer adapter. Immutable once
/// produced; deduplicated downstream by `(tstamp, role)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// UTC instant the reading was taken, microsecond precision.
    pub tstamp: DateTime<Utc>,
    /// Device sequence counter. Monotonic but may reset; absent on the old
    /// wire protocol.
    pub seq: Option<i64>,
    /// Measured frequency in Hz.
    pub freq: f64,
    /// Box (ambient) temperature in °C.
    pub tamb: Option<f64>,
    /// Sky temperature in °C.
    pub tsky: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display_lowercase() {
        assert_eq!(Role::Ref.to_string(), "ref");
        assert_eq!(Role::Test.to_string(), "test");
    }

    #[test]
    fn test_role_sections() {
        assert_eq!(Role::Ref.device_section(), "ref-device");
        assert_eq!(Role::Ref.stats_section(), "ref-stats");
        assert_eq!(Role::Test.device_section(), "test-device");
        assert_eq!(Role::Test.stats_section(), "test-stats");
    }

    #[test]
    fn test_central_tendency_round_trip() {
        for c in [
            CentralTendency::Median,
            CentralTendency::Mean,
            CentralTendency::Mode,
        ] {
            assert_eq!(c.to_string().parse::<CentralTendency>(), Ok(c));
        }
    }

    #[test]
    fn test_central_tendency_rejects_unknown() {
        assert!("average".parse::<CentralTendency>().is_err());
    }

    #[test]
    fn test_model_parses_display_form() {
        assert_eq!("TESS-W".parse::<Model>(), Ok(Model::TessW));
        assert_eq!("tessw".parse::<Model>(), Ok(Model::TessW));
        assert_eq!(Model::TessW.to_string(), "TESS-W");
    }

    #[test]
    fn test_calibration_round_trip() {
        assert_eq!("auto".parse::<Calibration>(), Ok(Calibration::Auto));
        assert_eq!(Calibration::Manual.to_string(), "manual");
    }
}
