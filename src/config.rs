//! Read-only configuration lookup keyed by `(section, property)`, plus the
//! argument-over-config precedence rule used uniformly by the reader and the
//! calibrator: an explicit argument wins iff it is present, otherwise the
//! stored value is parsed.

use std::fmt::Display;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension};

use crate::dbase::Database;
use crate::{Error, Result};

pub struct ConfigStore {
    conn: Connection,
}

impl ConfigStore {
    pub fn open(db: &Database) -> Result<Self> {
        Ok(ConfigStore { conn: db.open()? })
    }

    /// Raw lookup. `Ok(None)` when the key is absent.
    pub fn load(&self, section: &str, property: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM config_t WHERE section = ?1 AND property = ?2",
                rusqlite::params![section, property],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// Applies the precedence rule: `arg` wins iff non-null, otherwise the
    /// stored value is parsed into `T`.
    pub fn resolve<T>(&self, arg: Option<T>, section: &str, property: &str) -> Result<T>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        if let Some(value) = arg {
            return Ok(value);
        }
        let raw = self
            .load(section, property)?
            .ok_or_else(|| Error::MissingConfig {
                section: section.to_string(),
                property: property.to_string(),
            })?;
        raw.trim().parse().map_err(|e: <T as FromStr>::Err| {
            Error::InvalidConfig {
                section: section.to_string(),
                property: property.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CentralTendency;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("cfg.db"));
        let cfg = ConfigStore::open(&db).unwrap();
        (dir, cfg)
    }

    #[test]
    fn test_load_seeded_value() {
        let (_dir, cfg) = store();
        assert_eq!(
            cfg.load("test-stats", "samples").unwrap().as_deref(),
            Some("75")
        );
    }

    #[test]
    fn test_load_missing_key_is_none() {
        let (_dir, cfg) = store();
        assert!(cfg.load("test-stats", "no-such-key").unwrap().is_none());
    }

    #[test]
    fn test_resolve_argument_wins() {
        let (_dir, cfg) = store();
        let n: usize = cfg.resolve(Some(9), "test-stats", "samples").unwrap();
        assert_eq!(n, 9);
    }

    #[test]
    fn test_resolve_zero_argument_still_wins() {
        // The falsy-value pitfall: 0 and false must beat the stored value.
        let (_dir, cfg) = store();
        let n: usize = cfg.resolve(Some(0), "test-stats", "samples").unwrap();
        assert_eq!(n, 0);
        let b: bool = cfg.resolve(Some(false), "ref-device", "old-proto").unwrap();
        assert!(!b);
    }

    #[test]
    fn test_resolve_falls_back_to_config() {
        let (_dir, cfg) = store();
        let n: usize = cfg.resolve(None, "test-stats", "samples").unwrap();
        assert_eq!(n, 75);
        let c: CentralTendency = cfg.resolve(None, "test-stats", "central").unwrap();
        assert_eq!(c, CentralTendency::Median);
    }

    #[test]
    fn test_resolve_missing_key_fails() {
        let (_dir, cfg) = store();
        let r: Result<f64> = cfg.resolve(None, "test-stats", "no-such-key");
        assert!(matches!(r, Err(Error::MissingConfig { .. })));
    }

    #[test]
    fn test_resolve_unparsable_value_fails() {
        let (_dir, cfg) = store();
        let r: Result<f64> = cfg.resolve(None, "ref-device", "model");
        assert!(matches!(r, Err(Error::InvalidConfig { .. })));
    }
}
