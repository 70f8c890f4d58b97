//! Batch lifecycle and orphan-set properties over a temporary database,
//! with calibration summaries planted directly in the store.

use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use tempfile::TempDir;

use zpcal::batch::BatchController;
use zpcal::dbase::{encode_tstamp, Database};
use zpcal::{Error, Role};

fn test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("zpcal.db"));
    db.open().unwrap();
    (dir, db)
}

/// Plants a photometer and one summary row per role for the given session.
fn plant_session(conn: &Connection, name: &str, session: &str) {
    conn.execute(
        "INSERT OR IGNORE INTO photometer_t (name, mac) VALUES (?1, ?2)",
        rusqlite::params![name, format!("MAC-{name}")],
    )
    .unwrap();
    let phot_id: i64 = conn
        .query_row(
            "SELECT id FROM photometer_t WHERE name = ?1",
            [name],
            |r| r.get(0),
        )
        .unwrap();
    for role in Role::ALL {
        conn.execute(
            "INSERT INTO summary_t (phot_id, session, role) VALUES (?1, ?2, ?3)",
            rusqlite::params![phot_id, session, role.to_string()],
        )
        .unwrap();
    }
}

fn plant_closed_batch(conn: &Connection, begin: &str, end: &str, calibrations: i64) {
    conn.execute(
        "INSERT INTO batch_t (begin_tstamp, end_tstamp, email_sent, calibrations) \
         VALUES (?1, ?2, 0, ?3)",
        rusqlite::params![begin, end, calibrations],
    )
    .unwrap();
}

// ---------------------------------------------------------------------------
// Open / close / double-open
// ---------------------------------------------------------------------------

#[test]
fn test_batch_lifecycle_counts_sessions() {
    let (_dir, db) = test_db();
    let mut ctrl = BatchController::open_db(&db).unwrap();
    assert!(!ctrl.is_open().unwrap());

    let begin = ctrl.open(Some("june run")).unwrap();
    assert!(ctrl.is_open().unwrap());

    // One calibration lands inside the batch: a REF and a TEST summary
    // sharing the session count as ONE calibration.
    let conn = db.open().unwrap();
    let session = encode_tstamp(begin + chrono::Duration::seconds(1));
    plant_session(&conn, "stars289", &session);

    let second = ctrl.open(None);
    assert!(matches!(second, Err(Error::BatchState(_))));

    // close() runs at now >= session, so the session is inside the window.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let (b, e, count) = ctrl.close().unwrap();
    assert_eq!(b, begin);
    assert!(e >= b);
    assert_eq!(count, 1);
    assert!(!ctrl.is_open().unwrap());
}

#[test]
fn test_close_without_open_fails() {
    let (_dir, db) = test_db();
    let mut ctrl = BatchController::open_db(&db).unwrap();
    assert!(matches!(ctrl.close(), Err(Error::BatchState(_))));
}

#[test]
fn test_reopen_after_close_is_allowed() {
    let (_dir, db) = test_db();
    let mut ctrl = BatchController::open_db(&db).unwrap();
    ctrl.open(None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    ctrl.close().unwrap();
    assert!(ctrl.open(None).is_ok());
}

// ---------------------------------------------------------------------------
// purge
// ---------------------------------------------------------------------------

#[test]
fn test_purge_removes_only_empty_closed_batches() {
    let (_dir, db) = test_db();
    let conn = db.open().unwrap();
    plant_closed_batch(&conn, "2024-06-01T00:00:00.000000", "2024-06-02T00:00:00.000000", 0);
    plant_closed_batch(&conn, "2024-06-03T00:00:00.000000", "2024-06-04T00:00:00.000000", 2);
    // An open batch with no calibrations yet must survive.
    conn.execute(
        "INSERT INTO batch_t (begin_tstamp, end_tstamp, email_sent) \
         VALUES ('2024-06-05T00:00:00.000000', NULL, 0)",
        [],
    )
    .unwrap();

    let mut ctrl = BatchController::open_db(&db).unwrap();
    assert_eq!(ctrl.purge().unwrap(), 1);
    let remaining: i64 = conn
        .query_row("SELECT COUNT(*) FROM batch_t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(remaining, 2);
}

// ---------------------------------------------------------------------------
// Orphan set
// ---------------------------------------------------------------------------

#[test]
fn test_orphan_is_sessions_outside_closed_batches() {
    let (_dir, db) = test_db();
    let conn = db.open().unwrap();
    plant_closed_batch(&conn, "2024-06-01T00:00:00.000000", "2024-06-02T00:00:00.000000", 1);
    plant_session(&conn, "stars289", "2024-06-01T12:00:00.000000"); // inside
    plant_session(&conn, "stars290", "2024-06-03T12:00:00.000000"); // orphan
    plant_session(&conn, "stars291", "2024-06-04T12:00:00.000000"); // orphan

    let ctrl = BatchController::open_db(&db).unwrap();
    let orphans = ctrl.orphan().unwrap();
    assert_eq!(orphans.len(), 2);
    assert!(orphans.contains(&Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()));
    assert!(orphans.contains(&Utc.with_ymd_and_hms(2024, 6, 4, 12, 0, 0).unwrap()));
}

#[test]
fn test_orphan_ignores_open_batch_interval() {
    let (_dir, db) = test_db();
    let conn = db.open().unwrap();
    // An open batch does not adopt sessions.
    conn.execute(
        "INSERT INTO batch_t (begin_tstamp, end_tstamp, email_sent) \
         VALUES ('2024-06-01T00:00:00.000000', NULL, 0)",
        [],
    )
    .unwrap();
    plant_session(&conn, "stars289", "2024-06-01T12:00:00.000000");

    let ctrl = BatchController::open_db(&db).unwrap();
    assert_eq!(ctrl.orphan().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// view / latest / by_date
// ---------------------------------------------------------------------------

#[test]
fn test_view_sorted_most_recent_first() {
    let (_dir, db) = test_db();
    let conn = db.open().unwrap();
    plant_closed_batch(&conn, "2024-06-01T00:00:00.000000", "2024-06-02T00:00:00.000000", 1);
    plant_closed_batch(&conn, "2024-06-03T00:00:00.000000", "2024-06-04T00:00:00.000000", 0);

    let ctrl = BatchController::open_db(&db).unwrap();
    let rows = ctrl.view().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].begin_tstamp > rows[1].begin_tstamp);
    assert_eq!(rows[0].calibrations, Some(0));
}

#[test]
fn test_latest_prefers_open_batch() {
    let (_dir, db) = test_db();
    let conn = db.open().unwrap();
    plant_closed_batch(&conn, "2024-06-01T00:00:00.000000", "2024-06-02T00:00:00.000000", 1);
    conn.execute(
        "INSERT INTO batch_t (begin_tstamp, end_tstamp, email_sent) \
         VALUES ('2024-05-01T00:00:00.000000', NULL, 0)",
        [],
    )
    .unwrap();

    let ctrl = BatchController::open_db(&db).unwrap();
    let latest = ctrl.latest().unwrap().unwrap();
    assert!(latest.end_tstamp.is_none());
    assert_eq!(
        latest.begin_tstamp,
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    );
}

#[test]
fn test_latest_falls_back_to_most_recent_closed() {
    let (_dir, db) = test_db();
    let conn = db.open().unwrap();
    plant_closed_batch(&conn, "2024-06-01T00:00:00.000000", "2024-06-02T00:00:00.000000", 1);
    plant_closed_batch(&conn, "2024-06-03T00:00:00.000000", "2024-06-04T00:00:00.000000", 0);

    let ctrl = BatchController::open_db(&db).unwrap();
    let latest = ctrl.latest().unwrap().unwrap();
    assert_eq!(
        latest.begin_tstamp,
        Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()
    );
}

#[test]
fn test_by_date_finds_closed_batch_only() {
    let (_dir, db) = test_db();
    let conn = db.open().unwrap();
    plant_closed_batch(&conn, "2024-06-01T00:00:00.000000", "2024-06-02T00:00:00.000000", 1);
    conn.execute(
        "INSERT INTO batch_t (begin_tstamp, end_tstamp, email_sent) \
         VALUES ('2024-06-05T00:00:00.000000', NULL, 0)",
        [],
    )
    .unwrap();

    let ctrl = BatchController::open_db(&db).unwrap();
    let found = ctrl
        .by_date(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        .unwrap();
    assert!(found.is_some());
    let open = ctrl
        .by_date(Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap())
        .unwrap();
    assert!(open.is_none());
}

// ---------------------------------------------------------------------------
// "all" summaries export over planted data
// ---------------------------------------------------------------------------

#[test]
fn test_export_all_requires_update_flag() {
    let (dir, db) = test_db();
    let conn = db.open().unwrap();
    plant_session(&conn, "stars289", "2024-06-01T12:00:00.000000");
    // Without upd_flag nothing qualifies.
    let exporter =
        zpcal::export::Exporter::new(&db, dir.path().join("all"), "all", None).unwrap();
    let path = exporter.export_all_summaries().unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    assert_eq!(text.lines().count(), 1); // header only

    conn.execute("UPDATE summary_t SET upd_flag = 1 WHERE role = 'test'", [])
        .unwrap();
    let path = exporter.export_all_summaries().unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    assert_eq!(text.lines().count(), 2);
}
