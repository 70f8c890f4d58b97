//! # Module: photometer
//!
//! ## Responsibility
//! The adapter seam between the calibration core and real devices: the
//! `Photometer` trait (info query, ZP write, background sample feed), the
//! `PhotometerInfo` descriptor and the endpoint-scheme builder.
//!
//! ## NOT Responsible For
//! - Buffering or statistics (see: ring module).
//! - Parameter resolution (see: reader module).

pub mod mock;
pub mod tessw;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Error, Model, Result, Role, Sample};

/// Command timeout applied by drivers to `get_info` / `save_zero_point`.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(4);

/// Receipt instant for a sample. Samples carry microsecond precision;
/// sub-microsecond digits would not survive storage.
pub fn now_us() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1000 * 1000)
        .unwrap_or(now)
}

/// Descriptor queried once per role at startup. `(name, mac)` identifies a
/// physical unit across calibration sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotometerInfo {
    pub name: String,
    pub mac: String,
    pub model: Model,
    pub sensor: Option<String>,
    pub firmware: Option<String>,
    /// The zero point currently stored in the device.
    pub zp: Option<f64>,
    pub freq_offset: Option<f64>,
    pub filter: Option<String>,
    pub plug: Option<String>,
    #[serde(rename = "box")]
    pub box_: Option<String>,
    pub collector: Option<String>,
    /// Filled in by the reader with the endpoint actually used.
    pub endpoint: Option<String>,
}

impl PhotometerInfo {
    /// Frequency offset with the null-means-zero default applied.
    pub fn freq_offset_or_zero(&self) -> f64 {
        self.freq_offset.unwrap_or(0.0)
    }
}

/// Opaque producer of timestamped samples for one role. The core makes no
/// assumption about the wire protocol behind it.
#[async_trait]
pub trait Photometer: Send + Sync {
    fn role(&self) -> Role;

    /// Queries the device descriptor. May fail with `Timeout` or `Transport`.
    async fn get_info(&self) -> Result<PhotometerInfo>;

    /// Writes a zero point to the device. May fail with `Timeout` or
    /// `Transport`.
    async fn save_zero_point(&self, zero_point: f64) -> Result<()>;

    /// Background reading loop: pushes decoded samples into `tx` until the
    /// receiver is dropped or the transport fails. Run under `tokio::spawn`.
    async fn readings(&self, tx: mpsc::UnboundedSender<Sample>);
}

/// Builds a photometer adapter from `(model, role, endpoint, old_proto)`.
/// Endpoint schemes: `tcp://host:port` (full duplex), `udp://host:port`
/// (readings only).
pub struct PhotometerBuilder;

impl PhotometerBuilder {
    pub fn build(
        &self,
        model: Model,
        role: Role,
        endpoint: &str,
        old_proto: bool,
    ) -> Result<Arc<dyn Photometer>> {
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            Ok(Arc::new(tessw::TessDriver::tcp(
                model,
                role,
                addr.to_string(),
                old_proto,
            )))
        } else if let Some(addr) = endpoint.strip_prefix("udp://") {
            Ok(Arc::new(tessw::TessDriver::udp(
                model,
                role,
                addr.to_string(),
                old_proto,
            )))
        } else {
            Err(Error::transport(
                role,
                format!("unsupported endpoint: {endpoint}"),
            ))
        }
    }
}
