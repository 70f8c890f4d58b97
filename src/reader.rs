//! Binds one photometer adapter per active role: resolves effective device
//! parameters (argument over config), launches the background reading tasks
//! and exposes per-role sample iteration. The calibrator builds on top of
//! this and swaps the capacity-1 rings for calibration-sized ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

use crate::config::ConfigStore;
use crate::photometer::{Photometer, PhotometerBuilder, PhotometerInfo};
use crate::ring::RingBuffer;
use crate::{CentralTendency, Error, Model, Result, Role, Sample};

/// Per-role device options as given on the command line; `None` defers to
/// the configuration store.
#[derive(Debug, Clone, Default)]
pub struct DeviceParams {
    pub model: Option<Model>,
    pub sensor: Option<String>,
    pub endpoint: Option<String>,
    pub old_proto: Option<bool>,
    /// Log every raw sample for this role.
    pub raw_message: bool,
}

/// Device options after applying the precedence rule.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub model: Model,
    pub sensor: String,
    pub endpoint: String,
    pub old_proto: bool,
    pub raw_message: bool,
}

pub struct Reader {
    cfg: ConfigStore,
    roles: Vec<Role>,
    params: HashMap<Role, DeviceParams>,
    resolved: HashMap<Role, ResolvedDevice>,
    photometers: HashMap<Role, Arc<dyn Photometer>>,
    queues: HashMap<Role, mpsc::UnboundedReceiver<Sample>>,
    rings: HashMap<Role, Arc<Mutex<RingBuffer>>>,
    infos: HashMap<Role, PhotometerInfo>,
    tasks: Vec<JoinHandle<()>>,
}

impl Reader {
    pub fn new(
        cfg: ConfigStore,
        ref_params: Option<DeviceParams>,
        test_params: Option<DeviceParams>,
    ) -> Self {
        let mut roles = Vec::new();
        let mut params = HashMap::new();
        if let Some(p) = ref_params {
            roles.push(Role::Ref);
            params.insert(Role::Ref, p);
        }
        if let Some(p) = test_params {
            roles.push(Role::Test);
            params.insert(Role::Test, p);
        }
        Reader {
            cfg,
            roles,
            params,
            resolved: HashMap::new(),
            photometers: HashMap::new(),
            queues: HashMap::new(),
            rings: HashMap::new(),
            infos: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Injects a pre-built adapter for a role, bypassing the endpoint
    /// builder. Must be called before `init()`.
    pub fn attach(&mut self, role: Role, photometer: Arc<dyn Photometer>) {
        self.photometers.insert(role, photometer);
        if !self.roles.contains(&role) {
            self.roles.push(role);
            self.params.insert(role, DeviceParams::default());
        }
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn config(&self) -> &ConfigStore {
        &self.cfg
    }

    pub fn device(&self, role: Role) -> Option<&ResolvedDevice> {
        self.resolved.get(&role)
    }

    pub fn photometer(&self, role: Role) -> Option<Arc<dyn Photometer>> {
        self.photometers.get(&role).cloned()
    }

    /// Cached descriptor, available after `info()` has run for the role.
    pub fn phot_info(&self, role: Role) -> Option<&PhotometerInfo> {
        self.infos.get(&role)
    }

    pub fn buffer(&self, role: Role) -> Option<Arc<Mutex<RingBuffer>>> {
        self.rings.get(&role).cloned()
    }

    pub(crate) fn replace_ring(&mut self, role: Role, ring: Arc<Mutex<RingBuffer>>) {
        self.rings.insert(role, ring);
    }

    /// Resolves parameters, builds the adapters and launches their reading
    /// tasks. Roles with an attached adapter keep it.
    pub async fn init(&mut self) -> Result<()> {
        info!(roles = ?self.roles, "initializing reader");
        let builder = PhotometerBuilder;
        for role in self.roles.clone() {
            let params = self.params.get(&role).cloned().unwrap_or_default();
            let section = role.device_section();
            let resolved = ResolvedDevice {
                model: self.cfg.resolve(params.model, section, "model")?,
                sensor: self.cfg.resolve(params.sensor, section, "sensor")?,
                endpoint: self.cfg.resolve(params.endpoint, section, "endpoint")?,
                old_proto: self.cfg.resolve(params.old_proto, section, "old-proto")?,
                raw_message: params.raw_message,
            };
            if !self.photometers.contains_key(&role) {
                let phot = builder.build(
                    resolved.model,
                    role,
                    &resolved.endpoint,
                    resolved.old_proto,
                )?;
                self.photometers.insert(role, phot);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.queues.insert(role, rx);
            let phot = self
                .photometers
                .get(&role)
                .cloned()
                .ok_or_else(|| Error::transport(role, "no adapter for role"))?;
            self.tasks.push(tokio::spawn(async move {
                phot.readings(tx).await;
            }));
            self.rings.insert(
                role,
                Arc::new(Mutex::new(RingBuffer::new(1, CentralTendency::Median))),
            );
            self.resolved.insert(role, resolved);
        }
        Ok(())
    }

    /// Queries, overlays and caches the descriptor for a role. Failures
    /// propagate to the caller and abort whatever operation needed it.
    pub async fn info(&mut self, role: Role) -> Result<PhotometerInfo> {
        if let Some(cached) = self.infos.get(&role) {
            return Ok(cached.clone());
        }
        let phot = self
            .photometers
            .get(&role)
            .cloned()
            .ok_or_else(|| Error::transport(role, "role not active"))?;
        let mut info = phot.get_info().await.map_err(|e| {
            error!(role = %role, error = %e, "failed contacting photometer");
            e
        })?;
        if let Some(resolved) = self.resolved.get(&role) {
            info.endpoint = Some(resolved.endpoint.clone());
            if info.sensor.is_none() {
                info.sensor = Some(resolved.sensor.clone());
            }
        }
        info.freq_offset = Some(info.freq_offset_or_zero());
        self.infos.insert(role, info.clone());
        Ok(info)
    }

    /// Takes the role's queue and turns it into a stream of tagged samples.
    /// Pure iteration, no buffering; at most one stream per role.
    pub fn receive(&mut self, role: Role) -> Option<impl Stream<Item = (Role, Sample)>> {
        let rx = self.queues.remove(&role)?;
        Some(UnboundedReceiverStream::new(rx).map(move |sample| (role, sample)))
    }

    /// Hands the raw queue to the calibrator, which owns consumption during
    /// prefill and rounds.
    pub(crate) fn take_queue(&mut self, role: Role) -> Option<mpsc::UnboundedReceiver<Sample>> {
        self.queues.remove(&role)
    }

    /// Cancels the background reading tasks.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
