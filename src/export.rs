//! Streams persisted summaries, rounds and samples of a time window into
//! `;`-delimited UTF-8 text files. Summaries are filtered to written-back
//! calibrations; rounds and samples make an exception for the bench's
//! reference unit, whose summaries never get the update flag.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::dbase::{decode_tstamp, encode_tstamp, Database};
use crate::Result;

/// The reference unit permanently installed on the calibration bench.
pub const REFERENCE_NAME: &str = "stars3";

pub const SUMMARY_EXPORT_HEADERS: [&str; 23] = [
    "model",
    "name",
    "mac",
    "firmware",
    "sensor",
    "session",
    "calibration",
    "calversion",
    "ref_mag",
    "ref_freq",
    "test_mag",
    "test_freq",
    "mag_diff",
    "raw_zero_point",
    "offset",
    "zero_point",
    "prev_zp",
    "filter",
    "plug",
    "box",
    "collector",
    "author",
    "comment",
];

pub const ROUND_EXPORT_HEADERS: [&str; 12] = [
    "Model",
    "Name",
    "MAC",
    "Session (UTC)",
    "Role",
    "Round",
    "Freq (Hz)",
    "\u{03c3} (Hz)",
    "Mag",
    "ZP",
    "# Samples",
    "\u{0394}T (s.)",
];

pub const SAMPLE_EXPORT_HEADERS: [&str; 10] = [
    "Model",
    "Name",
    "MAC",
    "Session (UTC)",
    "Role",
    "Round",
    "Timestamp",
    "Freq (Hz)",
    "Box Temp (\u{2103})",
    "Sequence #",
];

pub struct Exporter {
    conn: Connection,
    base_dir: PathBuf,
    prefix: String,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Exporter {
    pub fn new(
        db: &Database,
        base_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Self> {
        Ok(Exporter {
            conn: db.open()?,
            base_dir: base_dir.into(),
            prefix: prefix.into(),
            range,
        })
    }

    /// Writes the three window files and returns their paths.
    pub fn export(&self) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.base_dir)?;
        let summaries = self.write_file("summary", &SUMMARY_EXPORT_HEADERS, self.query_summaries()?)?;
        let rounds = self.write_file("rounds", &ROUND_EXPORT_HEADERS, self.query_rounds()?)?;
        let samples = self.write_file("samples", &SAMPLE_EXPORT_HEADERS, self.query_samples()?)?;
        Ok(vec![summaries, rounds, samples])
    }

    /// Writes the summaries-only "all" export: every photometer's most
    /// recent written-back calibration.
    pub fn export_all_summaries(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.base_dir)?;
        let rows = filter_latest_summary(self.query_all_summaries()?);
        self.write_file("summary", &SUMMARY_EXPORT_HEADERS, rows)
    }

    fn write_file(
        &self,
        kind: &str,
        headers: &[&str],
        rows: Vec<Vec<String>>,
    ) -> Result<PathBuf> {
        let path = self
            .base_dir
            .join(format!("{}_{}.csv", kind, self.prefix));
        info!(file = %path.display(), rows = rows.len(), "exporting");
        write_delimited(&path, headers, &rows)?;
        Ok(path)
    }

    fn query_summaries(&self) -> Result<Vec<Vec<String>>> {
        let sql = "SELECT model, name, mac, firmware, sensor, session, calibration, \
                   calversion, ref_mag, ref_freq, test_mag, test_freq, mag_diff, \
                   raw_zero_point, zp_offset, zero_point, prev_zp, filter, plug, box, \
                   collector, author, comment \
                   FROM summary_v WHERE session BETWEEN ?1 AND ?2 AND upd_flag = 1 \
                   ORDER BY CAST(SUBSTR(name, 6) AS INTEGER), session";
        let (t0, t1) = self.range_params();
        self.query_rows(sql, rusqlite::params![t0, t1], &[5], &[])
    }

    fn query_all_summaries(&self) -> Result<Vec<Vec<String>>> {
        let sql = "SELECT model, name, mac, firmware, sensor, session, calibration, \
                   calversion, ref_mag, ref_freq, test_mag, test_freq, mag_diff, \
                   raw_zero_point, zp_offset, zero_point, prev_zp, filter, plug, box, \
                   collector, author, comment \
                   FROM summary_v WHERE name LIKE 'stars%' AND upd_flag = 1 \
                   ORDER BY CAST(SUBSTR(name, 6) AS INTEGER), session";
        self.query_rows(sql, rusqlite::params![], &[5], &[])
    }

    fn query_rounds(&self) -> Result<Vec<Vec<String>>> {
        let sql = "SELECT model, name, mac, session, role, round, freq, stddev, mag, \
                   zero_point, nsamples, duration \
                   FROM rounds_v WHERE session BETWEEN ?1 AND ?2 \
                   AND (upd_flag = 1 OR (upd_flag = 0 AND name = ?3)) \
                   ORDER BY session, round";
        let (t0, t1) = self.range_params();
        self.query_rows(sql, rusqlite::params![t0, t1, REFERENCE_NAME], &[3], &[])
    }

    fn query_samples(&self) -> Result<Vec<Vec<String>>> {
        let sql = "SELECT model, name, mac, session, role, round, tstamp, freq, \
                   temp_box, seq \
                   FROM samples_v WHERE session BETWEEN ?1 AND ?2 \
                   AND (upd_flag = 1 OR (upd_flag = 0 AND name = ?3)) \
                   ORDER BY session, round, tstamp";
        let (t0, t1) = self.range_params();
        self.query_rows(sql, rusqlite::params![t0, t1, REFERENCE_NAME], &[3], &[6])
    }

    /// The export window, or a text-sortable open interval when exporting
    /// everything.
    fn range_params(&self) -> (String, String) {
        match self.range {
            Some((t0, t1)) => (encode_tstamp(t0), encode_tstamp(t1)),
            None => ("0000-01-01T00:00:00".to_string(), "9999-12-31T23:59:59".to_string()),
        }
    }

    /// Runs a query and renders every column to text. `session_cols` are
    /// re-rendered without sub-second digits, `tstamp_cols` keep them.
    fn query_rows(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        session_cols: &[usize],
        tstamp_cols: &[usize],
    ) -> Result<Vec<Vec<String>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ncols = stmt.column_count();
        let rows = stmt.query_map(params, |row| {
            let mut fields = Vec::with_capacity(ncols);
            for i in 0..ncols {
                fields.push(row.get::<_, Value>(i)?);
            }
            Ok(fields)
        })?;
        let mut result = Vec::new();
        for row in rows {
            let fields = row?;
            let mut rendered = Vec::with_capacity(fields.len());
            for (i, value) in fields.iter().enumerate() {
                let mut text = render_value(value);
                if session_cols.contains(&i) {
                    text = render_instant(&text, "%Y-%m-%d %H:%M:%S");
                } else if tstamp_cols.contains(&i) {
                    text = render_instant(&text, "%Y-%m-%d %H:%M:%S%.6f");
                }
                rendered.push(text);
            }
            result.push(rendered);
        }
        Ok(result)
    }
}

/// Keeps only the most recent session per photometer name. Input comes
/// sorted by name then ascending session.
fn filter_latest_summary(rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let mut result: Vec<Vec<String>> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for row in rows {
        let name = row.get(1).cloned().unwrap_or_default();
        match result.last() {
            Some(last) if last.get(1) == Some(&name) => {
                *result.last_mut().expect("nonempty") = row;
                *counts.last_mut().expect("nonempty") += 1;
            }
            _ => {
                result.push(row);
                counts.push(1);
            }
        }
    }
    for (row, n) in result.iter().zip(&counts) {
        if *n > 1 {
            warn!(
                name = row.get(1).map(String::as_str).unwrap_or(""),
                summaries = n,
                "several summaries, keeping the most recent session"
            );
        }
    }
    result
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(t) => t.clone(),
        Value::Blob(_) => String::new(),
    }
}

fn render_instant(stored: &str, format: &str) -> String {
    match decode_tstamp(stored) {
        Ok(t) => t.format(format).to_string(),
        Err(_) => stored.to_string(),
    }
}

fn write_delimited(path: &Path, headers: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", headers.join(";"))?;
    for row in rows {
        let line: Vec<String> = row.iter().map(|f| quote_field(f)).collect();
        writeln!(out, "{}", line.join(";"))?;
    }
    out.flush()?;
    Ok(())
}

fn quote_field(field: &str) -> String {
    if field.contains(';') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
