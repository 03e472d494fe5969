//! A managed printer: its state machine, its queue and the request side
//! operations other tasks use to steer it.

mod drive;
mod print;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use chrono::Local;
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, Notify};

use crate::{
    job::{payload, NewJob},
    models::ModelDescriptor,
    protocol::{send_command, ProtocolTimeouts, ResponseValue},
    Connection, Event, EventBus, FabricatorError, Issue, Job, JobId, JobQueue, JobStatus, PersistenceGateway, PortInfo,
    Ports, Profile, QueueError, SharedJob,
};

/// Identifier of a [Fabricator], assigned by the persistence gateway.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Display, FromStr,
)]
#[display("{0}")]
#[serde(transparent)]
pub struct FabricatorId(pub u64);

/// State of a [Fabricator].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum FabricatorStatus {
    /// No usable link to the device.
    Offline,

    /// Link open, startup sequence running.
    Configuring,

    /// Idle and able to take the next job.
    Ready,

    /// Streaming a job.
    Printing,

    /// A job is held between lines.
    Paused,

    /// A job just finished; about to become ready.
    Complete,

    /// Something failed. Stays here until an operator releases it.
    Error,
}

/// A fabricator as the persistence gateway stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricatorRecord {
    /// Human name.
    pub name: String,

    /// Port path the device was last seen on.
    pub device_path: String,

    /// Hardware id; stable across re-plugging.
    pub hardware_id: String,

    /// Model name.
    pub model: String,
}

/// Snapshot of a fabricator for status polling.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct FabricatorInfo {
    /// Id.
    pub id: FabricatorId,

    /// Human name.
    pub name: String,

    /// Port the device is on.
    pub device_path: String,

    /// Hardware id.
    pub hardware_id: String,

    /// Model identity and limits.
    pub model: ModelDescriptor,

    /// Current status.
    pub status: FabricatorStatus,

    /// Job being printed, or the failed job awaiting release.
    pub current_job: Option<JobId>,

    /// Queued job ids, next first.
    pub queue: Vec<JobId>,
}

/// Collaborators every fabricator of a fleet shares.
#[derive(Clone)]
pub struct FleetContext {
    /// Where links come from.
    pub ports: Arc<dyn Ports>,

    /// Where state transitions are reported.
    pub gateway: Arc<dyn PersistenceGateway>,

    /// Where events are published.
    pub events: EventBus,

    /// Response wait budgets.
    pub timeouts: ProtocolTimeouts,

    /// Baud rate for models that don't name one.
    pub baud: u32,
}

// Lookup key plus a non-owning handle; the job is owned by its queue or
// the print in progress.
#[derive(Debug)]
struct CurrentJob {
    id: JobId,
    job: Weak<Mutex<Job>>,
}

/// One managed printer.
///
/// The [Connection] is only ever touched by the task running
/// [Fabricator::drive]; request handlers steer a running job through the
/// job's pause flag, the cancel flag and the status field.
pub struct Fabricator {
    id: FabricatorId,
    name: String,
    port: PortInfo,
    profile: Profile,
    ctx: FleetContext,

    status: watch::Sender<FabricatorStatus>,
    queue: Mutex<JobQueue>,
    connection: Mutex<Option<Connection>>,
    current: Mutex<Option<CurrentJob>>,

    wake: Notify,
    resumed: Notify,
    cancel_requested: AtomicBool,
}

impl Fabricator {
    /// Create an offline fabricator for the device on `port`.
    pub fn new(id: FabricatorId, name: &str, port: PortInfo, profile: Profile, ctx: FleetContext) -> Self {
        Self {
            id,
            name: name.to_owned(),
            port,
            profile,
            ctx,
            status: watch::Sender::new(FabricatorStatus::Offline),
            queue: Mutex::new(JobQueue::new(id)),
            connection: Mutex::new(None),
            current: Mutex::new(None),
            wake: Notify::new(),
            resumed: Notify::new(),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Id.
    pub fn id(&self) -> FabricatorId {
        self.id
    }

    /// Human name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port the device is on.
    pub fn device_path(&self) -> &str {
        &self.port.device_path
    }

    /// Hardware id.
    pub fn hardware_id(&self) -> &str {
        &self.port.hardware_id
    }

    /// Model profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Current status.
    pub fn status(&self) -> FabricatorStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<FabricatorStatus> {
        self.status.subscribe()
    }

    /// Listen for fleet events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.events.subscribe()
    }

    /// Queued job ids, next first.
    pub async fn queue_snapshot(&self) -> Vec<JobId> {
        self.queue.lock().await.job_ids()
    }

    /// Id of the job being printed, or of the failed job awaiting release.
    pub async fn current_job_id(&self) -> Option<JobId> {
        self.current.lock().await.as_ref().map(|current| current.id)
    }

    /// Snapshot for status polling.
    pub async fn info(&self) -> FabricatorInfo {
        FabricatorInfo {
            id: self.id,
            name: self.name.clone(),
            device_path: self.port.device_path.clone(),
            hardware_id: self.port.hardware_id.clone(),
            model: *self.profile.descriptor(),
            status: self.status(),
            current_job: self.current_job_id().await,
            queue: self.queue_snapshot().await,
        }
    }

    pub(crate) fn set_status(&self, status: FabricatorStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::info!(
                fabricator = self.id.0,
                from = previous.to_string(),
                to = status.to_string(),
                "status changed"
            );
        }
    }

    /// Nudge the Drive Loop: new work, or the device may be back.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    fn baud(&self) -> u32 {
        self.profile.descriptor().baud.unwrap_or(self.ctx.baud)
    }

    fn not_connected(&self) -> FabricatorError {
        FabricatorError::connection(
            self.device_path(),
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no open link"),
        )
    }

    /// Connect to the device and bring it to `ready`.
    ///
    /// The device must be among the enumerated ports. If the startup
    /// sequence fails the link is kept open for diagnostics and the
    /// fabricator enters `error`.
    pub async fn initialize(&self) -> Result<(), FabricatorError> {
        let status = self.status();
        if matches!(status, FabricatorStatus::Printing | FabricatorStatus::Paused) {
            return Err(FabricatorError::InvalidState {
                status,
                action: "initialize",
            });
        }

        let ports = self
            .ctx
            .ports
            .available_ports()
            .await
            .map_err(|e| FabricatorError::connection(self.device_path(), e))?;
        if !ports.iter().any(|port| port.device_path == self.port.device_path) {
            self.set_status(FabricatorStatus::Offline);
            return Err(FabricatorError::Discovery {
                device_path: self.port.device_path.clone(),
            });
        }

        let mut slot = self.connection.lock().await;
        if let Some(stale) = slot.take() {
            if let Err(e) = stale.close().await {
                tracing::debug!(error = format!("{:?}", e), "closing stale link failed");
            }
        }

        let mut conn = match self.ctx.ports.open(self.device_path(), self.baud()).await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_status(FabricatorStatus::Offline);
                return Err(FabricatorError::connection(self.device_path(), e));
            }
        };

        self.set_status(FabricatorStatus::Configuring);
        let result = self.startup_on(&mut conn).await;
        *slot = Some(conn);
        drop(slot);

        if let Err(e) = result {
            tracing::warn!(
                fabricator = self.id.0,
                error = format!("{:?}", e),
                "startup sequence failed"
            );
            self.set_status(FabricatorStatus::Error);
            self.record_issue(Issue::new(format!("startup failed: {}", e), None)).await;
            return Err(e);
        }
        Ok(())
    }

    async fn startup_on(&self, conn: &mut Connection) -> Result<(), FabricatorError> {
        for line in &self.profile.table().startup {
            self.send(conn, line).await?;
        }
        self.reset_on(conn, true).await
    }

    /// Home the axes and zero the extruder on the open link. With
    /// `initializing`, a successful reset makes the fabricator `ready`.
    pub async fn reset(&self, initializing: bool) -> Result<(), FabricatorError> {
        let mut slot = self.connection.lock().await;
        let Some(conn) = slot.as_mut() else {
            return Err(self.not_connected());
        };
        self.reset_on(conn, initializing).await
    }

    async fn reset_on(&self, conn: &mut Connection, initializing: bool) -> Result<(), FabricatorError> {
        for line in &self.profile.table().home {
            self.send(conn, line).await?;
        }
        if initializing {
            self.set_status(FabricatorStatus::Ready);
        }
        Ok(())
    }

    async fn send(&self, conn: &mut Connection, line: &str) -> Result<Vec<ResponseValue>, FabricatorError> {
        let table = self.profile.table();
        send_command(conn, table, &self.ctx.timeouts, &table.limit_feed_rate(line)).await
    }

    /// Store a new job and append it to this fabricator's queue.
    ///
    /// `raw` may be plain or gzip-compressed G-code.
    pub async fn submit(
        &self,
        name: &str,
        file_name_original: &str,
        raw: &[u8],
        favorite: bool,
    ) -> Result<JobId, FabricatorError> {
        let payload = payload::ingest(raw);
        let job_id = self
            .ctx
            .gateway
            .insert_job(NewJob {
                fabricator_id: Some(self.id),
                name: name.to_owned(),
                file_name_original: file_name_original.to_owned(),
                payload: payload.clone(),
                favorite,
                status: JobStatus::Inqueue,
            })
            .await
            .map_err(FabricatorError::Persistence)?;

        self.enqueue(Job::new(job_id, name, file_name_original, payload, favorite).shared())
            .await?;
        Ok(job_id)
    }

    /// Append an existing job. Fails if it is already queued here.
    pub async fn enqueue(&self, job: SharedJob) -> Result<(), FabricatorError> {
        let job_id = {
            let mut job = job.lock().await;
            job.set_fabricator_id(self.id);
            job.id()
        };
        if !self.queue.lock().await.add_to_back(job_id, job) {
            return Err(QueueError::Duplicate(job_id).into());
        }
        tracing::info!(fabricator = self.id.0, job_id = job_id.0, "job queued");
        self.ctx.events.emit(Event::JobStatusUpdate {
            job_id,
            status: JobStatus::Inqueue,
        });
        self.wake();
        Ok(())
    }

    /// Append a job restored from persistence; a job already queued is
    /// left alone. Returns whether it was added.
    pub(crate) async fn restore(&self, job: SharedJob) -> bool {
        let job_id = job.lock().await.id();
        let added = self.queue.lock().await.add_to_back(job_id, job);
        if added {
            self.wake();
        }
        added
    }

    /// Take a job out of the queue, wherever it sits.
    pub async fn remove_job(&self, job_id: JobId) -> Result<SharedJob, FabricatorError> {
        let job = self.queue.lock().await.remove_by_id(job_id)?;
        tracing::info!(fabricator = self.id.0, job_id = job_id.0, "job removed from queue");
        Ok(job)
    }

    async fn current_job(&self, action: &'static str) -> Result<SharedJob, FabricatorError> {
        let current = self.current.lock().await;
        current
            .as_ref()
            .and_then(|current| current.job.upgrade())
            .ok_or(FabricatorError::InvalidState {
                status: self.status(),
                action,
            })
    }

    /// Hold the running job at the next line boundary.
    pub async fn pause(&self) -> Result<(), FabricatorError> {
        let status = self.status();
        if status != FabricatorStatus::Printing {
            return Err(FabricatorError::InvalidState { status, action: "pause" });
        }
        let job = self.current_job("pause").await?;
        let mut job = job.lock().await;
        if job.status() != JobStatus::Printing {
            return Err(FabricatorError::InvalidState {
                status: self.status(),
                action: "pause",
            });
        }

        job.set_paused(true);
        job.pause_clock(Local::now());
        self.ctx.events.emit(Event::FilePauseUpdate {
            job_id: job.id(),
            paused: true,
        });
        self.ctx.events.emit_times(job.id(), job.time());
        self.set_job_status(&mut job, JobStatus::Paused).await;
        self.set_status(FabricatorStatus::Paused);
        Ok(())
    }

    /// Continue a paused job. The total and ETA move back by the time spent
    /// paused.
    pub async fn resume(&self) -> Result<(), FabricatorError> {
        let status = self.status();
        if status != FabricatorStatus::Paused {
            return Err(FabricatorError::InvalidState { status, action: "resume" });
        }
        let job = self.current_job("resume").await?;
        let mut job = job.lock().await;
        if job.status() != JobStatus::Paused {
            return Err(FabricatorError::InvalidState {
                status: self.status(),
                action: "resume",
            });
        }

        job.set_paused(false);
        if let Some(paused_for) = job.resume_clock(Local::now()) {
            tracing::debug!(job_id = job.id().0, paused_for = paused_for, "resuming");
        }
        self.ctx.events.emit(Event::FilePauseUpdate {
            job_id: job.id(),
            paused: false,
        });
        self.ctx.events.emit_times(job.id(), job.time());
        self.set_job_status(&mut job, JobStatus::Printing).await;
        self.set_status(FabricatorStatus::Printing);
        self.resumed.notify_one();
        Ok(())
    }

    /// Abort the running job at the next line boundary: the model's cancel
    /// command is sent, then its shutdown sequence.
    pub async fn cancel(&self) -> Result<(), FabricatorError> {
        let status = self.status();
        if !matches!(status, FabricatorStatus::Printing | FabricatorStatus::Paused) {
            return Err(FabricatorError::InvalidState { status, action: "cancel" });
        }
        tracing::info!(fabricator = self.id.0, "cancel requested");
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.resumed.notify_one();
        Ok(())
    }

    /// Operator acknowledgment after a failed (or finished) job: the build
    /// was taken off the plate and the fabricator may take the next job.
    pub async fn release(&self) -> Result<(), FabricatorError> {
        let status = self.status();
        if !matches!(status, FabricatorStatus::Error | FabricatorStatus::Complete) {
            return Err(FabricatorError::InvalidState { status, action: "release" });
        }

        if let Some(current) = self.current.lock().await.take() {
            if let Some(job) = current.job.upgrade() {
                job.lock().await.set_released(true);
            }
            self.ctx.events.emit(Event::ReleaseJob {
                job_id: current.id,
                released: true,
            });
        }
        self.set_status(FabricatorStatus::Ready);
        Ok(())
    }

    /// Close the link and go offline. Refused while a job holds the link.
    pub async fn disconnect(&self) -> Result<(), FabricatorError> {
        let Ok(mut slot) = self.connection.try_lock() else {
            return Err(FabricatorError::InvalidState {
                status: self.status(),
                action: "disconnect",
            });
        };
        if let Some(conn) = slot.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = format!("{:?}", e), "closing link failed");
            }
        }
        self.set_status(FabricatorStatus::Offline);
        Ok(())
    }

    /// The device vanished from the port list. A running job finds out
    /// through its next read.
    pub async fn mark_offline(&self) {
        match self.status() {
            FabricatorStatus::Offline => {}
            FabricatorStatus::Printing | FabricatorStatus::Paused => {
                tracing::warn!(fabricator = self.id.0, "device removed while printing");
            }
            _ => {
                if let Err(e) = self.disconnect().await {
                    tracing::debug!(error = format!("{:?}", e), "link busy; leaving it to the drive loop");
                }
            }
        }
    }

    async fn set_job_status(&self, job: &mut Job, status: JobStatus) {
        job.set_status(status);
        self.ctx.events.emit(Event::JobStatusUpdate {
            job_id: job.id(),
            status,
        });
        if let Err(e) = self.ctx.gateway.update_job_status(job.id(), status).await {
            tracing::warn!(
                job_id = job.id().0,
                status = status.to_string(),
                error = format!("{:?}", e),
                "failed to persist job status"
            );
        }
    }

    async fn record_issue(&self, mut issue: Issue) -> Issue {
        match self.ctx.gateway.record_issue(&issue).await {
            Ok(id) => issue.id = Some(id),
            Err(e) => tracing::warn!(
                fabricator = self.id.0,
                error = format!("{:?}", e),
                "failed to persist issue"
            ),
        }
        issue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::PrusaMk3, EmulatorRegistry, FleetPorts, MemoryGateway};
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    fn fabricator(gateway: Arc<MemoryGateway>) -> Fabricator {
        let ctx = FleetContext {
            ports: Arc::new(FleetPorts::emulated_only(EmulatorRegistry::default())),
            gateway,
            events: EventBus::default(),
            timeouts: ProtocolTimeouts::default(),
            baud: 115200,
        };
        let port = PortInfo {
            device_path: "/dev/emu0".to_owned(),
            description: "Original Prusa MK3 - CDC".to_owned(),
            hardware_id: "n/a".to_owned(),
        };
        Fabricator::new(FabricatorId(1), "left", port, Profile::new(&PrusaMk3), ctx)
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(FabricatorStatus::Configuring.to_string(), "configuring");
        assert_eq!("paused".parse::<FabricatorStatus>().ok(), Some(FabricatorStatus::Paused));
    }

    #[tokio::test]
    async fn test_submit_and_remove() -> TestResult {
        let gateway = Arc::new(MemoryGateway::new());
        let fab = fabricator(gateway.clone());

        let a = fab.submit("a", "a.gcode", b"G28\n", false).await?;
        let b = fab.submit("b", "b.gcode", b"G28\n", false).await?;
        assert_eq!(fab.queue_snapshot().await, vec![a, b]);
        assert_eq!(gateway.find_job(a).await?.map(|job| job.status), Some(JobStatus::Inqueue));

        let job = fab.remove_job(a).await?;
        assert_eq!(job.lock().await.fabricator_id(), Some(FabricatorId(1)));
        assert_eq!(fab.queue_snapshot().await, vec![b]);

        let err = fab.remove_job(a).await.unwrap_err();
        assert!(matches!(err, FabricatorError::Queue(QueueError::UnknownJob(id)) if id == a));

        let again = fab.remove_job(b).await?;
        fab.enqueue(again.clone()).await?;
        let err = fab.enqueue(again).await.unwrap_err();
        assert!(matches!(err, FabricatorError::Queue(QueueError::Duplicate(id)) if id == b));
        Ok(())
    }

    #[tokio::test]
    async fn test_submit_needs_gateway() -> TestResult {
        let gateway = Arc::new(MemoryGateway::new());
        let fab = fabricator(gateway.clone());
        gateway.set_failing(true);

        let err = fab.submit("a", "a.gcode", b"G28\n", false).await.unwrap_err();
        assert!(matches!(err, FabricatorError::Persistence(_)));
        assert!(fab.queue_snapshot().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_requests_need_matching_state() -> TestResult {
        let fab = fabricator(Arc::new(MemoryGateway::new()));
        assert_eq!(fab.status(), FabricatorStatus::Offline);

        assert!(matches!(fab.pause().await, Err(FabricatorError::InvalidState { .. })));
        assert!(matches!(fab.resume().await, Err(FabricatorError::InvalidState { .. })));
        assert!(matches!(fab.cancel().await, Err(FabricatorError::InvalidState { .. })));
        assert!(matches!(fab.release().await, Err(FabricatorError::InvalidState { .. })));
        assert!(matches!(fab.reset(false).await, Err(FabricatorError::Connection { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_without_device() -> TestResult {
        let fab = fabricator(Arc::new(MemoryGateway::new()));
        let err = fab.initialize().await.unwrap_err();
        assert!(matches!(err, FabricatorError::Discovery { .. }));
        assert_eq!(fab.status(), FabricatorStatus::Offline);
        Ok(())
    }
}
