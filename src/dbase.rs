//! SQLite storage layout: the calibration tables, the export views that
//! pivot REF/TEST pairs, factory config seeding and the timestamp codec.
//! Timestamps are stored as fixed-width UTC text so lexicographic `BETWEEN`
//! behaves like instant comparison.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::{Error, Result};

/// Storage format, microsecond precision.
pub const TSTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
/// Display format for sessions and batch boundaries.
pub const TSTAMP_SHORT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn encode_tstamp(t: DateTime<Utc>) -> String {
    t.format(TSTAMP_FORMAT).to_string()
}

pub fn decode_tstamp(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TSTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, TSTAMP_SHORT))
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::Timestamp(s.to_string()))
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS config_t (
    section  TEXT NOT NULL,
    property TEXT NOT NULL,
    value    TEXT,
    PRIMARY KEY (section, property)
);

CREATE TABLE IF NOT EXISTS batch_t (
    begin_tstamp TEXT PRIMARY KEY,
    end_tstamp   TEXT,
    email_sent   INTEGER NOT NULL DEFAULT 0,
    calibrations INTEGER,
    comment      TEXT
);

CREATE TABLE IF NOT EXISTS photometer_t (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    mac         TEXT NOT NULL,
    model       TEXT,
    sensor      TEXT,
    firmware    TEXT,
    freq_offset REAL,
    filter      TEXT,
    plug        TEXT,
    box         TEXT,
    collector   TEXT,
    UNIQUE (name, mac)
);

CREATE TABLE IF NOT EXISTS summary_t (
    id                INTEGER PRIMARY KEY,
    phot_id           INTEGER NOT NULL REFERENCES photometer_t(id),
    session           TEXT NOT NULL,
    role              TEXT NOT NULL,
    calibration       TEXT,
    calversion        TEXT,
    author            TEXT,
    nrounds           INTEGER,
    zp_offset         REAL,
    prev_zp           REAL,
    zero_point        REAL,
    zero_point_method TEXT,
    freq              REAL,
    freq_method       TEXT,
    mag               REAL,
    upd_flag          INTEGER NOT NULL DEFAULT 0,
    comment           TEXT,
    UNIQUE (session, role)
);

CREATE TABLE IF NOT EXISTS rounds_t (
    id           INTEGER PRIMARY KEY,
    summ_id      INTEGER NOT NULL REFERENCES summary_t(id),
    seq          INTEGER NOT NULL,
    role         TEXT NOT NULL,
    freq         REAL,
    stddev       REAL,
    mag          REAL,
    central      TEXT,
    zp_fict      REAL,
    zero_point   REAL,
    nsamples     INTEGER,
    begin_tstamp TEXT,
    end_tstamp   TEXT,
    duration     REAL,
    UNIQUE (summ_id, seq, role)
);

CREATE TABLE IF NOT EXISTS samples_t (
    id       INTEGER PRIMARY KEY,
    summ_id  INTEGER NOT NULL REFERENCES summary_t(id),
    tstamp   TEXT NOT NULL,
    role     TEXT NOT NULL,
    seq      INTEGER,
    freq     REAL,
    temp_box REAL,
    UNIQUE (tstamp, role)
);

CREATE TABLE IF NOT EXISTS samples_rounds_t (
    round_id  INTEGER NOT NULL REFERENCES rounds_t(id),
    sample_id INTEGER NOT NULL REFERENCES samples_t(id),
    PRIMARY KEY (round_id, sample_id)
);

CREATE VIEW IF NOT EXISTS summary_v AS
SELECT p.model                        AS model,
       p.name                         AS name,
       p.mac                          AS mac,
       p.firmware                     AS firmware,
       p.sensor                       AS sensor,
       t.session                      AS session,
       t.calibration                  AS calibration,
       t.calversion                   AS calversion,
       r.mag                          AS ref_mag,
       r.freq                         AS ref_freq,
       t.mag                          AS test_mag,
       t.freq                         AS test_freq,
       (r.mag - t.mag)                AS mag_diff,
       t.zero_point                   AS raw_zero_point,
       t.zp_offset                    AS zp_offset,
       (t.zero_point + t.zp_offset)   AS zero_point,
       t.prev_zp                      AS prev_zp,
       p.filter                       AS filter,
       p.plug                         AS plug,
       p.box                          AS box,
       p.collector                    AS collector,
       t.author                       AS author,
       t.comment                      AS comment,
       t.upd_flag                     AS upd_flag
FROM summary_t AS t
JOIN summary_t AS r ON r.session = t.session AND r.role = 'ref'
JOIN photometer_t AS p ON p.id = t.phot_id
WHERE t.role = 'test';

CREATE VIEW IF NOT EXISTS rounds_v AS
SELECT p.model      AS model,
       p.name       AS name,
       p.mac        AS mac,
       s.session    AS session,
       r.role       AS role,
       r.seq        AS round,
       r.freq       AS freq,
       r.stddev     AS stddev,
       r.mag        AS mag,
       r.zero_point AS zero_point,
       r.nsamples   AS nsamples,
       r.duration   AS duration,
       s.upd_flag   AS upd_flag
FROM rounds_t AS r
JOIN summary_t AS s ON s.id = r.summ_id
JOIN photometer_t AS p ON p.id = s.phot_id;

CREATE VIEW IF NOT EXISTS samples_v AS
SELECT p.model    AS model,
       p.name     AS name,
       p.mac      AS mac,
       s.session  AS session,
       m.role     AS role,
       r.seq      AS round,
       m.tstamp   AS tstamp,
       m.freq     AS freq,
       m.temp_box AS temp_box,
       m.seq      AS seq,
       s.upd_flag AS upd_flag
FROM samples_t AS m
JOIN samples_rounds_t AS j ON j.sample_id = m.id
JOIN rounds_t AS r ON r.id = j.round_id
JOIN summary_t AS s ON s.id = m.summ_id
JOIN photometer_t AS p ON p.id = s.phot_id;
"#;

/// Factory configuration installed into an empty `config_t`, mirroring a
/// stock calibration bench: a legacy reference unit on UDP and a test unit
/// reached over the TESS-W access point.
const CONFIG_DEFAULTS: &[(&str, &str, &str)] = &[
    ("ref-device", "model", "TESS-W"),
    ("ref-device", "sensor", "TSL237"),
    ("ref-device", "old-proto", "true"),
    ("ref-device", "endpoint", "udp://0.0.0.0:2255"),
    ("ref-device", "zp", "20.44"),
    ("test-device", "model", "TESS-W"),
    ("test-device", "sensor", "TSL237"),
    ("test-device", "old-proto", "false"),
    ("test-device", "endpoint", "tcp://192.168.4.1:23"),
    ("ref-stats", "samples", "75"),
    ("ref-stats", "period", "5.0"),
    ("ref-stats", "central", "median"),
    ("test-stats", "samples", "75"),
    ("test-stats", "period", "5.0"),
    ("test-stats", "central", "median"),
    ("calibration", "zp_fict", "20.50"),
    ("calibration", "rounds", "5"),
    ("calibration", "offset", "0.0"),
    ("calibration", "author", ""),
];

/// Handle to the calibration database file. Each component opens its own
/// connection; SQLite serializes writers.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Database { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a connection, installing the schema and the factory config on
    /// first use.
    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        seed_config(&conn)?;
        Ok(conn)
    }
}

fn seed_config(conn: &Connection) -> Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM config_t", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    info!("installing factory configuration");
    let mut stmt =
        conn.prepare("INSERT INTO config_t (section, property, value) VALUES (?1, ?2, ?3)")?;
    for (section, property, value) in CONFIG_DEFAULTS {
        stmt.execute(rusqlite::params![section, property, value])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("zpcal.db"));
        (dir, db)
    }

    #[test]
    fn test_open_creates_schema_and_seeds_config() {
        let (_dir, db) = temp_db();
        let conn = db.open().unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM config_t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, CONFIG_DEFAULTS.len() as i64);
    }

    #[test]
    fn test_reopen_does_not_reseed() {
        let (_dir, db) = temp_db();
        {
            let conn = db.open().unwrap();
            conn.execute(
                "UPDATE config_t SET value = '33' WHERE section = 'calibration' AND property = 'rounds'",
                [],
            )
            .unwrap();
        }
        let conn = db.open().unwrap();
        let v: String = conn
            .query_row(
                "SELECT value FROM config_t WHERE section = 'calibration' AND property = 'rounds'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(v, "33");
    }

    #[test]
    fn test_tstamp_round_trip_microseconds() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap()
            + chrono::Duration::microseconds(123456);
        let s = encode_tstamp(t);
        assert_eq!(s, "2024-06-01T12:30:45.123456");
        assert_eq!(decode_tstamp(&s).unwrap(), t);
    }

    #[test]
    fn test_tstamp_decode_short_form() {
        let t = decode_tstamp("2024-06-01T12:30:45").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap());
    }

    #[test]
    fn test_tstamp_text_order_matches_instant_order() {
        let early = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        assert!(encode_tstamp(early) < encode_tstamp(late));
    }

    #[test]
    fn test_tstamp_decode_rejects_garbage() {
        assert!(decode_tstamp("yesterday").is_err());
    }
}
