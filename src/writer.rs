//! Zero-point write-back with read-verify. The outcome is always captured in
//! a `WriteZpInfo` instead of thrown: the calibration record is already
//! committed by the time this runs, and a verify mismatch is a recorded
//! fact, not an abort.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::ConfigStore;
use crate::events::WriteZpInfo;
use crate::photometer::{Photometer, PhotometerInfo};
use crate::reader::DeviceParams;
use crate::{Error, Result, Role};

/// Rounds to the precision actually transmitted to the device.
fn to_device_precision(zero_point: f64) -> f64 {
    (zero_point * 100.0).round() / 100.0
}

/// Issues `save_zero_point` then re-queries the device, classifying the
/// outcome: `ok` iff the read-back value equals the transmitted one,
/// `timeout` iff the adapter timed out at either step.
pub async fn write_and_verify(photometer: &Arc<dyn Photometer>, zero_point: f64) -> WriteZpInfo {
    let transmitted = to_device_precision(zero_point);
    let mut outcome = WriteZpInfo {
        role: Role::Test,
        zero_point: transmitted,
        stored: None,
        timeout: false,
        ok: false,
    };
    match photometer.save_zero_point(transmitted).await {
        Err(Error::Timeout { .. }) => {
            outcome.timeout = true;
            return outcome;
        }
        Err(e) => {
            error!(error = %e, "zero point write failed");
            return outcome;
        }
        Ok(()) => {}
    }
    match photometer.get_info().await {
        Err(Error::Timeout { .. }) => {
            outcome.timeout = true;
            outcome
        }
        Err(e) => {
            error!(error = %e, "zero point read-back failed");
            outcome
        }
        Ok(info) => {
            outcome.stored = info.zp;
            outcome.ok = info
                .zp
                .map(|stored| to_device_precision(stored) == transmitted)
                .unwrap_or(false);
            outcome
        }
    }
}

/// One-line human summary for logs and the TEST summary comment.
pub fn describe_outcome(info: &WriteZpInfo) -> String {
    if info.ok {
        format!("ZP {:.2} written and verified", info.zero_point)
    } else if info.timeout {
        format!("ZP write timeout, {:.2} not verified", info.zero_point)
    } else {
        match info.stored {
            Some(stored) => format!(
                "ZP verify mismatch: wrote {:.2}, read back {:.2}",
                info.zero_point, stored
            ),
            None => format!("ZP write failed, {:.2} not stored", info.zero_point),
        }
    }
}

/// Standalone write controller behind the `write zp` subcommand: binds the
/// TEST photometer only and performs one verified write.
pub struct Writer {
    cfg: ConfigStore,
    params: DeviceParams,
    photometer: Option<Arc<dyn Photometer>>,
    info: Option<PhotometerInfo>,
}

impl Writer {
    pub fn new(cfg: ConfigStore, test_params: DeviceParams) -> Self {
        Writer {
            cfg,
            params: test_params,
            photometer: None,
            info: None,
        }
    }

    /// Injects a pre-built adapter, bypassing the endpoint builder.
    pub fn attach(&mut self, photometer: Arc<dyn Photometer>) {
        self.photometer = Some(photometer);
    }

    pub async fn init(&mut self) -> Result<()> {
        if self.photometer.is_some() {
            return Ok(());
        }
        let section = Role::Test.device_section();
        let model = self.cfg.resolve(self.params.model, section, "model")?;
        let endpoint = self
            .cfg
            .resolve(self.params.endpoint.clone(), section, "endpoint")?;
        let old_proto = self
            .cfg
            .resolve(self.params.old_proto, section, "old-proto")?;
        let photometer = crate::photometer::PhotometerBuilder.build(
            model,
            Role::Test,
            &endpoint,
            old_proto,
        )?;
        self.photometer = Some(photometer);
        Ok(())
    }

    pub async fn info(&mut self) -> Result<PhotometerInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let photometer = self
            .photometer
            .as_ref()
            .ok_or_else(|| Error::transport(Role::Test, "writer not initialized"))?;
        let info = photometer.get_info().await?;
        self.info = Some(info.clone());
        Ok(info)
    }

    pub async fn write_zp(&mut self, zero_point: f64) -> Result<WriteZpInfo> {
        let photometer = self
            .photometer
            .clone()
            .ok_or_else(|| Error::transport(Role::Test, "writer not initialized"))?;
        let outcome = write_and_verify(&photometer, zero_point).await;
        info!(
            zero_point = outcome.zero_point,
            stored = ?outcome.stored,
            ok = outcome.ok,
            timeout = outcome.timeout,
            "zero point write-back"
        );
        Ok(outcome)
    }
}
