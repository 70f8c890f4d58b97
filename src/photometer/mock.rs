//! Scripted in-process photometer used by the test suite and offline demos.
//! Emits a cyclic frequency feed at a fixed cadence and simulates the
//! zero-point write-back behaviors a real device can exhibit.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::{now_us, Photometer, PhotometerInfo};
use crate::{Error, Result, Role, Sample};

/// What `save_zero_point` does with the transmitted value.
#[derive(Debug, Clone, Copy)]
pub enum WriteBehavior {
    /// Store exactly what was written (the happy path).
    Store,
    /// Always report this value on read-back, regardless of what was written.
    Fixed(f64),
    /// Never answer.
    Timeout,
}

pub struct MockPhotometer {
    role: Role,
    info: Mutex<PhotometerInfo>,
    feed: Vec<f64>,
    interval: Duration,
    write: WriteBehavior,
    info_timeout: bool,
}

impl MockPhotometer {
    pub fn new(role: Role, info: PhotometerInfo, feed: Vec<f64>, interval: Duration) -> Self {
        MockPhotometer {
            role,
            info: Mutex::new(info),
            feed,
            interval,
            write: WriteBehavior::Store,
            info_timeout: false,
        }
    }

    pub fn with_write_behavior(mut self, write: WriteBehavior) -> Self {
        self.write = write;
        self
    }

    /// Makes `get_info` fail with a timeout, for abort-path tests.
    pub fn with_info_timeout(mut self) -> Self {
        self.info_timeout = true;
        self
    }

    /// A plausible descriptor for tests that don't care about the details.
    pub fn default_info(role: Role, name: &str, zp: f64) -> PhotometerInfo {
        PhotometerInfo {
            name: name.to_string(),
            mac: match role {
                Role::Ref => "AA:BB:CC:DD:EE:01".to_string(),
                Role::Test => "AA:BB:CC:DD:EE:02".to_string(),
            },
            model: crate::Model::TessW,
            sensor: Some("TSL237".to_string()),
            firmware: Some("1.0".to_string()),
            zp: Some(zp),
            freq_offset: Some(0.0),
            filter: Some("UV/IR-740".to_string()),
            plug: Some("USB-A".to_string()),
            box_: Some("FSH714".to_string()),
            collector: None,
            endpoint: None,
        }
    }
}

#[async_trait]
impl Photometer for MockPhotometer {
    fn role(&self) -> Role {
        self.role
    }

    async fn get_info(&self) -> Result<PhotometerInfo> {
        if self.info_timeout {
            return Err(Error::timeout(self.role, "info query"));
        }
        Ok(self.info.lock().unwrap().clone())
    }

    async fn save_zero_point(&self, zero_point: f64) -> Result<()> {
        match self.write {
            WriteBehavior::Store => {
                self.info.lock().unwrap().zp = Some(zero_point);
                Ok(())
            }
            WriteBehavior::Fixed(stored) => {
                self.info.lock().unwrap().zp = Some(stored);
                Ok(())
            }
            WriteBehavior::Timeout => Err(Error::timeout(self.role, "zero point write")),
        }
    }

    async fn readings(&self, tx: mpsc::UnboundedSender<Sample>) {
        if self.feed.is_empty() {
            // A silent but connected device: hold the channel open.
            loop {
                sleep(Duration::from_secs(3600)).await;
                if tx.is_closed() {
                    return;
                }
            }
        }
        let mut seq: i64 = 0;
        loop {
            for &freq in &self.feed {
                sleep(self.interval).await;
                seq += 1;
                let sample = Sample {
                    tstamp: now_us(),
                    seq: Some(seq),
                    freq,
                    tamb: Some(11.0),
                    tsky: Some(-9.0),
                };
                if tx.send(sample).is_err() {
                    return;
                }
            }
        }
    }
}
