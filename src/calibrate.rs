//! # Module: calibrate
//!
//! ## Responsibility
//! The calibration protocol: prefill both rings, run the statistics rounds
//! while background producers keep the rings fresh, select the best series
//! values and derive the final Zero Point. Publishes the lifecycle events
//! (`CAL_START`, `READING`, `ROUND`, `SUMMARY`, `CAL_END`).
//!
//! ## Guarantees
//! - Exactly `nrounds` ROUND events precede exactly one SUMMARY, which
//!   precedes exactly one CAL_END on every successful run.
//! - Round snapshots are taken in the same critical section as the
//!   statistics that describe them.
//! - Producers observe the stop flag before every queue read; a timeout or
//!   transport failure aborts the run with no SUMMARY and no CAL_END.
//!
//! ## NOT Responsible For
//! - Persistence (see: persist module).
//! - Device write-back (see: writer module).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::events::{CalibrationObserver, RoundInfo, RoundSamples, RoundStats, SummaryInfo};
use crate::reader::Reader;
use crate::ring::RingBuffer;
use crate::stats;
use crate::{CentralTendency, Error, Result, Role, Sample};

/// How long a prefill may wait for a single sample before the adapter is
/// declared unresponsive.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Calibration options as given on the command line; `None` defers to the
/// configuration store.
#[derive(Debug, Clone, Default)]
pub struct CalibParams {
    pub buffer: Option<usize>,
    pub period: Option<f64>,
    pub central: Option<CentralTendency>,
    pub zp_fict: Option<f64>,
    pub rounds: Option<usize>,
    pub zp_offset: Option<f64>,
    pub author: Option<String>,
}

pub struct Calibrator {
    reader: Reader,
    params: CalibParams,
    session: DateTime<Utc>,
    capacity: usize,
    period: f64,
    central: CentralTendency,
    nrounds: usize,
    zp_fict: f64,
    zp_offset: f64,
    zp_abs: f64,
    author: String,
    sample_timeout: Duration,
    rings: HashMap<Role, Arc<Mutex<RingBuffer>>>,
    observers: Vec<Arc<dyn CalibrationObserver>>,
}

impl Calibrator {
    pub fn new(reader: Reader, params: CalibParams) -> Self {
        Calibrator {
            reader,
            params,
            session: Utc::now(),
            capacity: 0,
            period: 0.0,
            central: CentralTendency::Median,
            nrounds: 0,
            zp_fict: 0.0,
            zp_offset: 0.0,
            zp_abs: 0.0,
            author: String::new(),
            sample_timeout: SAMPLE_TIMEOUT,
            rings: HashMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Arc<dyn CalibrationObserver>) {
        self.observers.push(observer);
    }

    pub fn set_sample_timeout(&mut self, timeout: Duration) {
        self.sample_timeout = timeout;
    }

    // -- accessors used by the persistence layer and the CLI ---------------

    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut Reader {
        &mut self.reader
    }

    pub fn session(&self) -> DateTime<Utc> {
        self.session
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn nrounds(&self) -> usize {
        self.nrounds
    }

    pub fn central(&self) -> CentralTendency {
        self.central
    }

    pub fn zp_fict(&self) -> f64 {
        self.zp_fict
    }

    pub fn zp_offset(&self) -> f64 {
        self.zp_offset
    }

    pub fn zp_abs(&self) -> f64 {
        self.zp_abs
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn buffer(&self, role: Role) -> Option<Arc<Mutex<RingBuffer>>> {
        self.reader.buffer(role)
    }

    /// Resolves the effective calibration parameters, initializes the
    /// reader, fetches both device descriptors and sizes the rings.
    pub async fn init(&mut self) -> Result<()> {
        self.reader.init().await?;
        self.session = Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now);

        let stats_section = Role::Test.stats_section();
        self.capacity =
            self.reader
                .config()
                .resolve(self.params.buffer, stats_section, "samples")?;
        self.period = self
            .reader
            .config()
            .resolve(self.params.period, stats_section, "period")?;
        self.central =
            self.reader
                .config()
                .resolve(self.params.central, stats_section, "central")?;
        self.zp_fict =
            self.reader
                .config()
                .resolve(self.params.zp_fict, "calibration", "zp_fict")?;
        self.nrounds = self
            .reader
            .config()
            .resolve(self.params.rounds, "calibration", "rounds")?;
        self.zp_offset =
            self.reader
                .config()
                .resolve(self.params.zp_offset, "calibration", "offset")?;
        self.author = self.reader.config().resolve(
            self.params.author.clone(),
            "calibration",
            "author",
        )?;
        // The absolute ZP is the stored ZP of the reference photometer.
        self.zp_abs = self
            .reader
            .config()
            .resolve(None::<f64>, "ref-device", "zp")?;

        for role in Role::ALL {
            self.reader.info(role).await?;
            let ring = Arc::new(Mutex::new(RingBuffer::new(self.capacity, self.central)));
            self.rings.insert(role, ring.clone());
            self.reader.replace_ring(role, ring);
        }
        info!(
            session = %self.session,
            capacity = self.capacity,
            rounds = self.nrounds,
            period = self.period,
            central = %self.central,
            zp_fict = self.zp_fict,
            zp_abs = self.zp_abs,
            "calibration parameters resolved"
        );
        Ok(())
    }

    /// Runs the full protocol and returns the final Zero Point to write to
    /// the test photometer. On failure the producers are torn down and no
    /// SUMMARY/CAL_END is published.
    pub async fn calibrate(&mut self) -> Result<f64> {
        self.notify_cal_start();
        let result = self.run_protocol().await;
        if result.is_err() {
            self.reader.shutdown();
        }
        result
    }

    async fn run_protocol(&mut self) -> Result<f64> {
        let mut q_ref = self
            .reader
            .take_queue(Role::Ref)
            .ok_or_else(|| Error::transport(Role::Ref, "sample queue unavailable"))?;
        let mut q_test = self
            .reader
            .take_queue(Role::Test)
            .ok_or_else(|| Error::transport(Role::Test, "sample queue unavailable"))?;
        let ring_ref = self.ring(Role::Ref)?;
        let ring_test = self.ring(Role::Test)?;

        // Prefill: both rings must be full before the first round.
        let (filled_ref, filled_test) = tokio::join!(
            self.fill_buffer(Role::Ref, &mut q_ref, &ring_ref),
            self.fill_buffer(Role::Test, &mut q_test, &ring_test),
        );
        filled_ref?;
        filled_test?;
        info!(capacity = self.capacity, "both buffers filled, rounds begin");

        // Producers keep overwriting the rings during the rounds.
        let (stop_tx, stop_rx) = watch::channel(false);
        let producers = vec![
            spawn_producer(ring_ref.clone(), q_ref, stop_rx.clone()),
            spawn_producer(ring_test.clone(), q_test, stop_rx),
        ];

        let mut zero_points: Vec<Option<f64>> = Vec::with_capacity(self.nrounds);
        let mut ref_freqs: Vec<Option<f64>> = Vec::with_capacity(self.nrounds);
        let mut test_freqs: Vec<Option<f64>> = Vec::with_capacity(self.nrounds);

        for current in 1..=self.nrounds {
            let mut round_stats = HashMap::new();
            let mut round_samples = RoundSamples::new();
            for role in Role::ALL {
                // Snapshot and statistics must agree, so both come from the
                // same copy taken under one lock acquisition.
                let snapshot = self.ring(role)?.lock().unwrap().snapshot();
                let stats = self.round_statistics(role, &snapshot);
                round_stats.insert(role, stats);
                round_samples.insert(role, snapshot);
            }
            let mag_diff = match (
                round_stats[&Role::Ref].mag,
                round_stats[&Role::Test].mag,
            ) {
                (Some(ref_mag), Some(test_mag)) => Some(ref_mag - test_mag),
                _ => None,
            };
            let zero_point = mag_diff.map(|d| self.zp_abs + d);
            zero_points.push(zero_point);
            ref_freqs.push(round_stats[&Role::Ref].freq);
            test_freqs.push(round_stats[&Role::Test].freq);

            let round_info = RoundInfo {
                current,
                nrounds: self.nrounds,
                mag_diff,
                zero_point,
                stats: round_stats,
            };
            self.notify_round(&round_info, &round_samples);
            if current != self.nrounds {
                sleep(Duration::from_secs_f64(self.period.max(0.0))).await;
            }
        }

        // Stop the producers before the summary: the series are final now.
        let _ = stop_tx.send(true);
        for producer in producers {
            let _ = producer.await;
        }

        let (best_zero_point_method, best_zero_point) = stats::best(&zero_points)?;
        let (best_ref_freq_method, best_ref_freq) = stats::best(&ref_freqs)?;
        let (best_test_freq_method, best_test_freq) = stats::best(&test_freqs)?;
        let final_zero_point = best_zero_point + self.zp_offset;
        // Summary magnitudes use the raw best frequencies, uncorrected by
        // freq_offset. Established protocol; do not "fix".
        let best_ref_mag = self.zp_fict - 2.5 * best_ref_freq.log10();
        let best_test_mag = self.zp_fict - 2.5 * best_test_freq.log10();
        let mag_diff = -2.5 * (best_ref_freq / best_test_freq).log10();

        let summary = SummaryInfo {
            zero_point_seq: zero_points,
            ref_freq_seq: ref_freqs,
            test_freq_seq: test_freqs,
            best_ref_freq,
            best_ref_freq_method,
            best_ref_mag,
            best_test_freq,
            best_test_freq_method,
            best_test_mag,
            mag_diff,
            best_zero_point,
            best_zero_point_method,
            final_zero_point,
        };
        self.notify_summary(&summary);
        self.notify_cal_end();
        Ok(final_zero_point)
    }

    /// Instrumental magnitude under the fictitious ZP. Fails when the
    /// frequency does not clear the device offset.
    fn magnitude(&self, freq: f64, freq_offset: f64) -> Result<f64> {
        let shifted = freq - freq_offset;
        if shifted > 0.0 {
            Ok(self.zp_fict - 2.5 * shifted.log10())
        } else {
            Err(Error::Domain { freq, freq_offset })
        }
    }

    fn ring(&self, role: Role) -> Result<Arc<Mutex<RingBuffer>>> {
        self.rings
            .get(&role)
            .cloned()
            .ok_or_else(|| Error::transport(role, "ring not initialized"))
    }

    async fn fill_buffer(
        &self,
        role: Role,
        queue: &mut mpsc::UnboundedReceiver<Sample>,
        ring: &Arc<Mutex<RingBuffer>>,
    ) -> Result<()> {
        loop {
            if ring.lock().unwrap().len() >= self.capacity {
                return Ok(());
            }
            let sample = match timeout(self.sample_timeout, queue.recv()).await {
                Err(_) => {
                    return Err(Error::timeout(role, "no samples while filling buffer"));
                }
                Ok(None) => {
                    return Err(Error::transport(
                        role,
                        "sample stream ended while filling buffer",
                    ));
                }
                Ok(Some(sample)) => sample,
            };
            ring.lock().unwrap().append(sample.clone());
            for observer in &self.observers {
                observer.on_reading(role, &sample);
            }
        }
    }

    /// Statistics of one round for one role, computed over a detached ring
    /// snapshot. Degenerate rounds (too few samples, multimodal ring under
    /// MODE, or frequency at/below the device offset) nullify the metrics
    /// for this role and round only.
    fn round_statistics(&self, role: Role, snapshot: &[Sample]) -> RoundStats {
        let freq_offset = self
            .reader
            .phot_info(role)
            .map(|i| i.freq_offset_or_zero())
            .unwrap_or(0.0);
        let freqs: Vec<f64> = snapshot.iter().map(|s| s.freq).collect();
        let (begin_tstamp, end_tstamp) = match (snapshot.first(), snapshot.last()) {
            (Some(first), Some(last)) => (first.tstamp, last.tstamp),
            _ => (self.session, self.session),
        };
        let duration = (end_tstamp - begin_tstamp)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1e6;

        let mut freq = None;
        let mut stdev = None;
        let mut mag = None;
        match stats::central(&freqs, self.central) {
            Ok(estimate) if freqs.len() >= 2 => match self.magnitude(estimate, freq_offset) {
                Ok(m) => {
                    freq = Some(estimate);
                    stdev = stats::sample_stdev(&freqs);
                    mag = Some(m);
                }
                Err(e) => {
                    warn!(role = %role, error = %e, "round metrics dropped");
                }
            },
            Ok(_) => {
                warn!(role = %role, n = freqs.len(), "not enough samples for statistics");
            }
            Err(e) => {
                warn!(role = %role, error = %e, "statistics error");
            }
        }
        RoundStats {
            freq,
            stdev,
            mag,
            nsamples: snapshot.len(),
            begin_tstamp,
            end_tstamp,
            duration,
        }
    }

    // -- event publication --------------------------------------------------

    fn notify_cal_start(&self) {
        for observer in &self.observers {
            observer.on_cal_start();
        }
    }

    fn notify_round(&self, info: &RoundInfo, samples: &RoundSamples) {
        for observer in &self.observers {
            observer.on_round(info, samples);
        }
    }

    fn notify_summary(&self, info: &SummaryInfo) {
        for observer in &self.observers {
            observer.on_summary(info);
        }
    }

    fn notify_cal_end(&self) {
        for observer in &self.observers {
            observer.on_cal_end();
        }
    }

    pub fn notify_write_zp(&self, info: &crate::events::WriteZpInfo) {
        for observer in &self.observers {
            observer.on_write_zp(info);
        }
    }
}

/// Drains the adapter queue into the ring until the stop flag flips or the
/// stream ends. The flag is checked before every queue read.
fn spawn_producer(
    ring: Arc<Mutex<RingBuffer>>,
    mut queue: mpsc::UnboundedReceiver<Sample>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *stop.borrow() {
                return;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
                sample = queue.recv() => {
                    match sample {
                        Some(sample) => ring.lock().unwrap().append(sample),
                        None => return,
                    }
                }
            }
        }
    })
}
