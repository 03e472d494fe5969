//! The live fleet: discovery, one [Fabricator] per recognized device, and
//! one Drive Loop task per Fabricator.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use chrono::Local;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinSet,
};

use crate::{
    fabricator::{FabricatorRecord, FleetContext},
    models::{known_profiles, profile_for},
    Config, EmulatorRegistry, EventBus, Fabricator, FabricatorId, FabricatorStatus, FleetPorts, Job, JobId,
    JobStatus, PersistenceGateway, PortInfo, Profile,
};

/// Every Fabricator of this process.
pub struct Registry {
    ctx: FleetContext,
    emulators: EmulatorRegistry,
    profiles: Vec<Profile>,
    names: HashMap<String, String>,
    export_dir: PathBuf,
    fabricators: RwLock<BTreeMap<FabricatorId, Arc<Fabricator>>>,
    loops: Mutex<JoinSet<()>>,
}

impl Registry {
    /// Create an empty registry driving devices found on `ports`.
    pub fn new(config: &Config, ports: FleetPorts, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let emulators = ports.emulators().clone();
        Self {
            ctx: FleetContext {
                ports: Arc::new(ports),
                gateway,
                events: EventBus::default(),
                timeouts: config.protocol,
                baud: config.serial.baud,
            },
            emulators,
            profiles: known_profiles(),
            names: config
                .fabricators
                .iter()
                .map(|f| (f.hardware_id.clone(), f.name.clone()))
                .collect(),
            export_dir: config.export_dir(),
            fabricators: RwLock::new(BTreeMap::new()),
            loops: Mutex::new(JoinSet::new()),
        }
    }

    /// Bus every fabricator publishes on.
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// Persistence gateway shared by the fleet.
    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.ctx.gateway
    }

    /// Supported model profiles.
    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    /// Enumerate ports once. Recognized devices not yet managed get a
    /// Fabricator with its queue restored and its Drive Loop started; managed
    /// devices that vanished are marked offline, and offline ones that came
    /// back are woken. Returns the Fabricators added by this scan.
    pub async fn discover(&self) -> Result<Vec<Arc<Fabricator>>> {
        let ports = self.ctx.ports.available_ports().await?;
        let known: Vec<Arc<Fabricator>> = self.fabricators.read().await.values().cloned().collect();

        let mut added = vec![];
        for port in &ports {
            if let Some(fab) = known.iter().find(|fab| fab.device_path() == port.device_path) {
                if fab.status() == FabricatorStatus::Offline {
                    tracing::debug!(fabricator = fab.id().0, "device is back");
                    fab.wake();
                }
                continue;
            }

            let Some(profile) = profile_for(&self.profiles, port) else {
                tracing::trace!(port = port.device_path, "no known model; skipping");
                continue;
            };

            match self.add(port, profile).await {
                Ok(Some(fab)) => added.push(fab),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    port = port.device_path,
                    error = format!("{:?}", e),
                    "failed to register device; retrying next scan"
                ),
            }
        }

        for fab in known {
            if !ports.iter().any(|port| port.device_path == fab.device_path()) {
                fab.mark_offline().await;
            }
        }

        Ok(added)
    }

    async fn add(&self, port: &PortInfo, profile: &Profile) -> Result<Option<Arc<Fabricator>>> {
        let descriptor = profile.descriptor();
        let name = self
            .names
            .get(&port.hardware_id)
            .cloned()
            .unwrap_or_else(|| format!("{} {} ({})", descriptor.manufacturer, descriptor.model, port.device_path));

        let id = self
            .ctx
            .gateway
            .register_fabricator(&FabricatorRecord {
                name: name.clone(),
                device_path: port.device_path.clone(),
                hardware_id: port.hardware_id.clone(),
                model: descriptor.model.to_owned(),
            })
            .await?;

        if self.fabricators.read().await.contains_key(&id) {
            tracing::debug!(fabricator = id.0, port = port.device_path, "device already managed on another port");
            return Ok(None);
        }

        let fab = Arc::new(Fabricator::new(id, &name, port.clone(), profile.clone(), self.ctx.clone()));
        match self.queue_restore(&fab).await {
            Ok(restored) => tracing::debug!(fabricator = id.0, restored = restored, "queue restored"),
            Err(e) => tracing::warn!(fabricator = id.0, error = format!("{:?}", e), "failed to restore queue"),
        }

        tracing::info!(
            fabricator = id.0,
            name = name,
            port = port.device_path,
            model = descriptor.model,
            "managing new device"
        );
        self.fabricators.write().await.insert(id, fab.clone());
        self.loops.lock().await.spawn(fab.clone().drive());
        Ok(Some(fab))
    }

    /// Rescan every `interval`, forever.
    pub async fn discover_forever(&self, interval: Duration) {
        loop {
            if let Err(e) = self.discover().await {
                tracing::warn!(error = format!("{:?}", e), "discovery failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Re-derive `fab`'s queue from persisted jobs.
    ///
    /// Jobs found `printing` or `paused` were interrupted by a previous
    /// process lifetime; they are demoted to `inqueue` and start over from
    /// the beginning. Relative order is kept and jobs already queued are
    /// skipped, so restoring twice is harmless. Jobs whose payload was
    /// scrubbed are left out. Returns how many were added.
    pub async fn queue_restore(&self, fab: &Fabricator) -> Result<usize> {
        let records = self.ctx.gateway.queue_snapshot(fab.id()).await?;

        let mut restored = 0;
        for record in records {
            if !matches!(record.status, JobStatus::Inqueue | JobStatus::Printing | JobStatus::Paused) {
                continue;
            }
            if record.payload.is_none() {
                tracing::debug!(job_id = record.id.0, "payload scrubbed; not restoring");
                continue;
            }

            let mut job = Job::from_record(record);
            if job.status() != JobStatus::Inqueue {
                tracing::info!(job_id = job.id().0, status = job.status().to_string(), "requeueing interrupted job");
                job.requeue();
                if let Err(e) = self.ctx.gateway.update_job_status(job.id(), JobStatus::Inqueue).await {
                    tracing::warn!(job_id = job.id().0, error = format!("{:?}", e), "failed to persist job status");
                }
            }

            if fab.restore(job.shared()).await {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Every managed Fabricator, by id.
    pub async fn fabricators(&self) -> Vec<Arc<Fabricator>> {
        self.fabricators.read().await.values().cloned().collect()
    }

    /// The Fabricator with `id`.
    pub async fn get(&self, id: FabricatorId) -> Option<Arc<Fabricator>> {
        self.fabricators.read().await.get(&id).cloned()
    }

    /// Port, name and hardware id of the first emulated device, if any.
    pub fn emulator_port(&self) -> Option<PortInfo> {
        self.emulators.first_port()
    }

    /// Registry of emulated devices.
    pub fn emulators(&self) -> &EmulatorRegistry {
        &self.emulators
    }

    /// Toggle a job's exemption from retention cleanup.
    pub async fn set_favorite(&self, job_id: JobId, favorite: bool) -> Result<()> {
        self.ctx.gateway.set_favorite(job_id, favorite).await
    }

    /// Directory exported payloads are written to.
    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Write a stored job's decompressed payload into the export directory.
    pub async fn export_job(&self, job_id: JobId) -> Result<PathBuf> {
        let Some(record) = self.ctx.gateway.find_job(job_id).await? else {
            anyhow::bail!("no job {}", job_id);
        };
        Ok(Job::from_record(record).export(&self.export_dir).await?)
    }

    /// Scrub the payloads of finished, non-favorite jobs older than
    /// `max_age`.
    pub async fn clear_space(&self, max_age: chrono::Duration) -> Result<usize> {
        let scrubbed = self.ctx.gateway.clear_space(Local::now() - max_age).await?;
        if scrubbed > 0 {
            tracing::info!(scrubbed = scrubbed, "cleared old job payloads");
        }
        Ok(scrubbed)
    }

    /// Stop every Drive Loop and close idle links.
    pub async fn shutdown(&self) {
        self.loops.lock().await.shutdown().await;
        for fab in self.fabricators().await {
            if let Err(e) = fab.disconnect().await {
                tracing::debug!(fabricator = fab.id().0, error = format!("{:?}", e), "disconnect failed");
            }
        }
    }
}
