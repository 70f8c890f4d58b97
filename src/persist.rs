//! # Module: persist
//!
//! ## Responsibility
//! Database-backed calibration: a single consumer task drains lifecycle
//! events (owned copies, never references into live rings) and, on CAL_END,
//! commits the whole entity graph in one transaction. Post-commit, the
//! zero-point write-back result is recorded on the TEST summary.
//!
//! ## Guarantees
//! - The graph is built leaf-first: photometers, summaries, rounds and
//!   samples, then the round/sample links. Any failure rolls everything
//!   back.
//! - Sample rows are the per-role set-union of all round snapshots, keyed
//!   by `(tstamp, role)`; a sample links to every round of its role whose
//!   window contains its timestamp.
//! - An aborted calibration never commits: the event queue dies before
//!   CAL_END.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::calibrate::Calibrator;
use crate::dbase::{encode_tstamp, Database};
use crate::events::{
    CalibrationObserver, RoundInfo, RoundSamples, SummaryInfo, WriteZpInfo,
};
use crate::photometer::PhotometerInfo;
use crate::writer;
use crate::{Calibration, CentralTendency, Error, Result, Role, CALVERSION};

/// Owned event copies fed to the database task.
enum DbEvent {
    CalStart,
    Round(RoundInfo, RoundSamples),
    Summary(SummaryInfo),
    CalEnd,
}

/// Observer that forwards lifecycle events into the database queue.
struct DbFeeder {
    tx: mpsc::UnboundedSender<DbEvent>,
}

impl CalibrationObserver for DbFeeder {
    fn on_cal_start(&self) {
        let _ = self.tx.send(DbEvent::CalStart);
    }

    fn on_round(&self, info: &RoundInfo, samples: &RoundSamples) {
        let _ = self
            .tx
            .send(DbEvent::Round(info.clone(), samples.clone()));
    }

    fn on_summary(&self, info: &SummaryInfo) {
        let _ = self.tx.send(DbEvent::Summary(info.clone()));
    }

    fn on_cal_end(&self) {
        let _ = self.tx.send(DbEvent::CalEnd);
    }
}

/// Facts fixed at init time that the commit needs besides the events.
#[derive(Clone)]
struct PersistContext {
    session: DateTime<Utc>,
    nrounds: usize,
    central: CentralTendency,
    zp_fict: f64,
    zp_offset: f64,
    zp_abs: f64,
    author: String,
    phot_info: HashMap<Role, PhotometerInfo>,
}

/// What the database task hands back after a successful commit.
pub struct PersistOutcome {
    conn: Connection,
    pub summary_ids: HashMap<Role, i64>,
}

/// Wraps the volatile calibrator with transactional persistence.
pub struct PersistentCalibrator {
    calibrator: Calibrator,
    database: Database,
    db_task: Option<JoinHandle<Result<PersistOutcome>>>,
    outcome: Option<PersistOutcome>,
}

impl PersistentCalibrator {
    pub fn new(calibrator: Calibrator, database: Database) -> Self {
        PersistentCalibrator {
            calibrator,
            database,
            db_task: None,
            outcome: None,
        }
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    pub fn subscribe(&mut self, observer: Arc<dyn CalibrationObserver>) {
        self.calibrator.subscribe(observer);
    }

    pub async fn init(&mut self) -> Result<()> {
        self.calibrator.init().await?;
        let mut phot_info = HashMap::new();
        for role in Role::ALL {
            let info = self
                .calibrator
                .reader()
                .phot_info(role)
                .cloned()
                .ok_or_else(|| Error::transport(role, "photometer info unavailable"))?;
            phot_info.insert(role, info);
        }
        let ctx = PersistContext {
            session: self.calibrator.session(),
            nrounds: self.calibrator.nrounds(),
            central: self.calibrator.central(),
            zp_fict: self.calibrator.zp_fict(),
            zp_offset: self.calibrator.zp_offset(),
            zp_abs: self.calibrator.zp_abs(),
            author: self.calibrator.author().to_string(),
            phot_info,
        };
        let conn = self.database.open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.calibrator.subscribe(Arc::new(DbFeeder { tx }));
        self.db_task = Some(tokio::spawn(db_writer(conn, ctx, rx)));
        Ok(())
    }

    /// Runs the calibration and waits for the record to be committed.
    pub async fn calibrate(&mut self) -> Result<f64> {
        let zero_point = match self.calibrator.calibrate().await {
            Ok(zp) => zp,
            Err(e) => {
                // No CAL_END was published; make sure the task dies without
                // committing anything.
                if let Some(task) = self.db_task.take() {
                    task.abort();
                }
                return Err(e);
            }
        };
        let task = self
            .db_task
            .take()
            .ok_or_else(|| Error::Task("persistence task not running".to_string()))?;
        let outcome = task
            .await
            .map_err(|e| Error::Task(format!("persistence task died: {e}")))??;
        self.outcome = Some(outcome);
        Ok(zero_point)
    }

    /// Post-commit write-back: runs the Writer against the TEST photometer
    /// and records the outcome on the just-inserted TEST summary. The REF
    /// summary keeps `upd_flag = false` forever.
    pub async fn write_zp(&mut self, zero_point: f64) -> Result<WriteZpInfo> {
        let photometer = self
            .calibrator
            .reader()
            .photometer(Role::Test)
            .ok_or_else(|| Error::transport(Role::Test, "photometer unavailable"))?;
        let outcome = writer::write_and_verify(&photometer, zero_point).await;
        self.calibrator.notify_write_zp(&outcome);

        let persisted = self
            .outcome
            .as_ref()
            .ok_or_else(|| Error::Task("no committed calibration record".to_string()))?;
        let test_id = persisted
            .summary_ids
            .get(&Role::Test)
            .copied()
            .ok_or_else(|| Error::Task("TEST summary id missing".to_string()))?;
        let comment = if outcome.ok {
            None
        } else {
            Some(writer::describe_outcome(&outcome))
        };
        persisted.conn.execute(
            "UPDATE summary_t SET upd_flag = ?1, comment = ?2 WHERE id = ?3",
            rusqlite::params![outcome.ok, comment, test_id],
        )?;
        Ok(outcome)
    }

    /// Summary row ids of the committed record, keyed by role.
    pub fn summary_ids(&self) -> Option<&HashMap<Role, i64>> {
        self.outcome.as_ref().map(|o| &o.summary_ids)
    }
}

/// Single-consumer database loop: accumulate, then commit once on CAL_END.
async fn db_writer(
    mut conn: Connection,
    ctx: PersistContext,
    mut rx: mpsc::UnboundedReceiver<DbEvent>,
) -> Result<PersistOutcome> {
    let mut rounds: Vec<(RoundInfo, RoundSamples)> = Vec::new();
    let mut summary: Option<SummaryInfo> = None;
    while let Some(event) = rx.recv().await {
        match event {
            DbEvent::CalStart => {}
            DbEvent::Round(info, samples) => rounds.push((info, samples)),
            DbEvent::Summary(info) => summary = Some(info),
            DbEvent::CalEnd => {
                let summary = summary
                    .take()
                    .ok_or_else(|| Error::Task("CAL_END without SUMMARY".to_string()))?;
                let summary_ids = commit(&mut conn, &ctx, &rounds, &summary)?;
                info!(
                    session = %ctx.session,
                    rounds = rounds.len(),
                    "calibration record committed"
                );
                return Ok(PersistOutcome { conn, summary_ids });
            }
        }
    }
    Err(Error::Task(
        "calibration aborted before CAL_END".to_string(),
    ))
}

fn commit(
    conn: &mut Connection,
    ctx: &PersistContext,
    rounds: &[(RoundInfo, RoundSamples)],
    summary: &SummaryInfo,
) -> Result<HashMap<Role, i64>> {
    let tx = conn.transaction()?;

    let mut summary_ids = HashMap::new();
    for role in Role::ALL {
        let info = ctx
            .phot_info
            .get(&role)
            .ok_or_else(|| Error::transport(role, "photometer info missing"))?;
        let phot_id = upsert_photometer(&tx, info)?;
        let summ_id = insert_summary(&tx, ctx, summary, role, phot_id, info)?;
        summary_ids.insert(role, summ_id);
    }

    // Rounds, remembering each row's id and window for the link step.
    let mut round_windows: HashMap<Role, Vec<(i64, DateTime<Utc>, DateTime<Utc>)>> =
        HashMap::new();
    for (round_info, samples) in rounds {
        for role in Role::ALL {
            let stats = round_info
                .stats
                .get(&role)
                .ok_or_else(|| Error::transport(role, "round stats missing"))?;
            let snapshot_len = samples.get(&role).map(|s| s.len()).unwrap_or(0);
            debug_assert_eq!(snapshot_len, stats.nsamples);
            let zero_point = match role {
                Role::Test => round_info.zero_point,
                Role::Ref => None,
            };
            tx.execute(
                "INSERT INTO rounds_t (summ_id, seq, role, freq, stddev, mag, central, \
                 zp_fict, zero_point, nsamples, begin_tstamp, end_tstamp, duration) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    summary_ids[&role],
                    round_info.current as i64,
                    role.to_string(),
                    stats.freq,
                    stats.stdev,
                    stats.mag,
                    ctx.central.to_string(),
                    ctx.zp_fict,
                    zero_point,
                    stats.nsamples as i64,
                    encode_tstamp(stats.begin_tstamp),
                    encode_tstamp(stats.end_tstamp),
                    stats.duration,
                ],
            )?;
            round_windows.entry(role).or_default().push((
                tx.last_insert_rowid(),
                stats.begin_tstamp,
                stats.end_tstamp,
            ));
        }
    }

    // Samples: set-union of the snapshots per role, then the sliding-window
    // links.
    for role in Role::ALL {
        // Keyed by the stored timestamp text so deduplication matches the
        // table's (tstamp, role) uniqueness.
        let mut union = BTreeMap::new();
        for (_, samples) in rounds {
            if let Some(snapshot) = samples.get(&role) {
                for sample in snapshot {
                    union.insert(encode_tstamp(sample.tstamp), sample.clone());
                }
            }
        }
        let windows = round_windows.get(&role).cloned().unwrap_or_default();
        for (tstamp, sample) in union {
            tx.execute(
                "INSERT INTO samples_t (summ_id, tstamp, role, seq, freq, temp_box) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    summary_ids[&role],
                    tstamp,
                    role.to_string(),
                    sample.seq,
                    sample.freq,
                    sample.tamb,
                ],
            )?;
            let sample_id = tx.last_insert_rowid();
            for (round_id, begin, end) in &windows {
                if *begin <= sample.tstamp && sample.tstamp <= *end {
                    tx.execute(
                        "INSERT INTO samples_rounds_t (round_id, sample_id) VALUES (?1, ?2)",
                        rusqlite::params![round_id, sample_id],
                    )?;
                }
            }
        }
    }

    tx.commit()?;
    Ok(summary_ids)
}

fn upsert_photometer(tx: &Transaction<'_>, info: &PhotometerInfo) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM photometer_t WHERE name = ?1 AND mac = ?2",
            rusqlite::params![info.name, info.mac],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    info!(name = %info.name, mac = %info.mac, "creating photometer row");
    tx.execute(
        "INSERT INTO photometer_t (name, mac, model, sensor, firmware, freq_offset, \
         filter, plug, box, collector) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            info.name,
            info.mac,
            info.model.to_string(),
            info.sensor,
            info.firmware,
            info.freq_offset_or_zero(),
            info.filter,
            info.plug,
            info.box_,
            info.collector,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_summary(
    tx: &Transaction<'_>,
    ctx: &PersistContext,
    summary: &SummaryInfo,
    role: Role,
    phot_id: i64,
    info: &PhotometerInfo,
) -> Result<i64> {
    // REF anchors to the absolute ZP; TEST carries the calibration result.
    let (zp_offset, prev_zp, zero_point, zero_point_method) = match role {
        Role::Test => (
            ctx.zp_offset,
            info.zp,
            summary.best_zero_point,
            Some(summary.best_zero_point_method.to_string()),
        ),
        Role::Ref => (0.0, Some(ctx.zp_abs), ctx.zp_abs, None),
    };
    tx.execute(
        "INSERT INTO summary_t (phot_id, session, role, calibration, calversion, author, \
         nrounds, zp_offset, prev_zp, zero_point, zero_point_method, freq, freq_method, \
         mag, upd_flag, comment) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0, NULL)",
        rusqlite::params![
            phot_id,
            encode_tstamp(ctx.session),
            role.to_string(),
            Calibration::Auto.to_string(),
            CALVERSION,
            ctx.author,
            ctx.nrounds as i64,
            zp_offset,
            prev_zp,
            zero_point,
            zero_point_method,
            summary.best_freq(role),
            summary.best_freq_method(role).to_string(),
            summary.best_mag(role),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}
