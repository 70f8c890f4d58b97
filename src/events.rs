//! Typed calibration lifecycle events and the observer seam. Handlers are
//! invoked synchronously from the publishing task and must not block; the
//! persistence subscriber only enqueues owned copies.

use std::collections::HashMap;

use serde::Serialize;

use crate::{CentralTendency, Role, Sample};

/// Per-role statistics of one calibration round. All three estimates are
/// `None` when the round was degenerate for that role (too few samples,
/// multimodal ring, or `freq <= freq_offset`).
#[derive(Debug, Clone, Serialize)]
pub struct RoundStats {
    pub freq: Option<f64>,
    pub stdev: Option<f64>,
    pub mag: Option<f64>,
    /// Ring length at snapshot time.
    pub nsamples: usize,
    /// Timestamp of the oldest sample in the snapshot.
    pub begin_tstamp: chrono::DateTime<chrono::Utc>,
    /// Timestamp of the newest sample in the snapshot.
    pub end_tstamp: chrono::DateTime<chrono::Utc>,
    /// Window span in seconds.
    pub duration: f64,
}

/// ROUND event payload.
#[derive(Debug, Clone, Serialize)]
pub struct RoundInfo {
    /// 1-based round number.
    pub current: usize,
    pub nrounds: usize,
    /// `mag_REF - mag_TEST`, when both magnitudes exist.
    pub mag_diff: Option<f64>,
    /// `zp_abs + mag_diff`, when computable.
    pub zero_point: Option<f64>,
    pub stats: HashMap<Role, RoundStats>,
}

/// Per-role ring snapshots taken together with a round's statistics.
pub type RoundSamples = HashMap<Role, Vec<Sample>>;

/// SUMMARY event payload.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryInfo {
    pub zero_point_seq: Vec<Option<f64>>,
    pub ref_freq_seq: Vec<Option<f64>>,
    pub test_freq_seq: Vec<Option<f64>>,
    pub best_ref_freq: f64,
    pub best_ref_freq_method: CentralTendency,
    pub best_ref_mag: f64,
    pub best_test_freq: f64,
    pub best_test_freq_method: CentralTendency,
    pub best_test_mag: f64,
    pub mag_diff: f64,
    pub best_zero_point: f64,
    pub best_zero_point_method: CentralTendency,
    pub final_zero_point: f64,
}

impl SummaryInfo {
    pub fn best_freq(&self, role: Role) -> f64 {
        match role {
            Role::Ref => self.best_ref_freq,
            Role::Test => self.best_test_freq,
        }
    }

    pub fn best_freq_method(&self, role: Role) -> CentralTendency {
        match role {
            Role::Ref => self.best_ref_freq_method,
            Role::Test => self.best_test_freq_method,
        }
    }

    pub fn best_mag(&self, role: Role) -> f64 {
        match role {
            Role::Ref => self.best_ref_mag,
            Role::Test => self.best_test_mag,
        }
    }
}

/// WRITE_ZP event payload.
#[derive(Debug, Clone, Serialize)]
pub struct WriteZpInfo {
    pub role: Role,
    /// The zero point transmitted to the device (2-decimal precision).
    pub zero_point: f64,
    /// The zero point read back after the write, when the read succeeded.
    pub stored: Option<f64>,
    pub timeout: bool,
    /// True iff the read-back value equals the transmitted one.
    pub ok: bool,
}

/// Calibration lifecycle observer. Default bodies make every hook optional.
pub trait CalibrationObserver: Send + Sync {
    fn on_reading(&self, role: Role, sample: &Sample) {
        let _ = (role, sample);
    }

    fn on_cal_start(&self) {}

    fn on_round(&self, info: &RoundInfo, samples: &RoundSamples) {
        let _ = (info, samples);
    }

    fn on_summary(&self, info: &SummaryInfo) {
        let _ = info;
    }

    fn on_cal_end(&self) {}

    fn on_write_zp(&self, info: &WriteZpInfo) {
        let _ = info;
    }
}
