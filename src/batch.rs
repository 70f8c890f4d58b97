//! Calibration batch lifecycle: a batch is a named time interval grouping
//! many calibration sessions for bulk reporting and export. At most one
//! batch is open at any time; the calibration count is fixed at close.

use std::collections::BTreeSet;

use chrono::{DateTime, Timelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::dbase::{decode_tstamp, encode_tstamp, Database};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub begin_tstamp: DateTime<Utc>,
    pub end_tstamp: Option<DateTime<Utc>>,
    pub email_sent: bool,
    pub calibrations: Option<i64>,
    pub comment: Option<String>,
}

pub struct BatchController {
    conn: Connection,
}

impl BatchController {
    pub fn open_db(db: &Database) -> Result<Self> {
        Ok(BatchController { conn: db.open()? })
    }

    /// Opens a new batch. Fails with `BatchState` if one is already open.
    pub fn open(&mut self, comment: Option<&str>) -> Result<DateTime<Utc>> {
        let begin = Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now);
        let tx = self.conn.transaction()?;
        if is_open_tx(&tx)? {
            return Err(Error::BatchState("batch already open".to_string()));
        }
        tx.execute(
            "INSERT INTO batch_t (begin_tstamp, end_tstamp, email_sent, comment) \
             VALUES (?1, NULL, 0, ?2)",
            rusqlite::params![encode_tstamp(begin), comment],
        )?;
        tx.commit()?;
        info!(begin = %begin, "batch opened");
        Ok(begin)
    }

    pub fn is_open(&self) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM batch_t WHERE end_tstamp IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Closes the open batch, counting the calibration sessions that fell
    /// inside it (one session spans a REF and a TEST summary, whatever the
    /// `upd_flag` says). Fails with `BatchState` if none is open.
    pub fn close(&mut self) -> Result<(DateTime<Utc>, DateTime<Utc>, i64)> {
        let end = Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now);
        let tx = self.conn.transaction()?;
        let begin: Option<String> = tx
            .query_row(
                "SELECT begin_tstamp FROM batch_t WHERE end_tstamp IS NULL",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let begin_raw =
            begin.ok_or_else(|| Error::BatchState("no open batch".to_string()))?;
        let begin = decode_tstamp(&begin_raw)?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(DISTINCT session) FROM summary_t WHERE session BETWEEN ?1 AND ?2",
            rusqlite::params![encode_tstamp(begin), encode_tstamp(end)],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE batch_t SET end_tstamp = ?1, calibrations = ?2, email_sent = 0 \
             WHERE begin_tstamp = ?3",
            rusqlite::params![encode_tstamp(end), count, begin_raw],
        )?;
        tx.commit()?;
        info!(begin = %begin, end = %end, calibrations = count, "batch closed");
        Ok((begin, end, count))
    }

    /// Deletes closed batches that grouped no calibrations.
    pub fn purge(&mut self) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM batch_t WHERE calibrations = 0 AND end_tstamp IS NOT NULL",
            [],
        )?;
        Ok(n)
    }

    /// Sessions not contained in any closed batch interval.
    pub fn orphan(&self) -> Result<BTreeSet<DateTime<Utc>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT session FROM summary_t")?;
        let mut all_sessions = BTreeSet::new();
        for row in stmt.query_map([], |row| row.get::<_, String>(0))? {
            all_sessions.insert(decode_tstamp(&row?)?);
        }
        let mut stmt = self.conn.prepare(
            "SELECT begin_tstamp, end_tstamp FROM batch_t WHERE end_tstamp IS NOT NULL",
        )?;
        let intervals: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        let mut in_batches = BTreeSet::new();
        for (begin, end) in intervals {
            let begin = decode_tstamp(&begin)?;
            let end = decode_tstamp(&end)?;
            for session in &all_sessions {
                if begin <= *session && *session <= end {
                    in_batches.insert(*session);
                }
            }
        }
        Ok(all_sessions.difference(&in_batches).copied().collect())
    }

    /// All batches, most recent first.
    pub fn view(&self) -> Result<Vec<BatchRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT begin_tstamp, end_tstamp, email_sent, calibrations, comment \
             FROM batch_t ORDER BY begin_tstamp DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        let mut batches = Vec::new();
        for row in rows {
            let (begin, end, email_sent, calibrations, comment) = row?;
            batches.push(BatchRow {
                begin_tstamp: decode_tstamp(&begin)?,
                end_tstamp: end.as_deref().map(decode_tstamp).transpose()?,
                email_sent,
                calibrations,
                comment,
            });
        }
        Ok(batches)
    }

    /// The open batch when one exists, otherwise the most recently begun
    /// closed one.
    pub fn latest(&self) -> Result<Option<BatchRow>> {
        let batches = self.view()?;
        Ok(batches
            .iter()
            .find(|b| b.end_tstamp.is_none())
            .or_else(|| batches.first())
            .cloned())
    }

    /// Looks a closed batch up by its begin instant.
    pub fn by_date(&self, begin: DateTime<Utc>) -> Result<Option<BatchRow>> {
        Ok(self
            .view()?
            .into_iter()
            .find(|b| b.begin_tstamp == begin && b.end_tstamp.is_some()))
    }
}

fn is_open_tx(tx: &rusqlite::Transaction<'_>) -> Result<bool> {
    let n: i64 = tx.query_row(
        "SELECT COUNT(*) FROM batch_t WHERE end_tstamp IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}
