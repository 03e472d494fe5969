//! Common traits used throughout this crate at the seams to the outside
//! world (serial ports, persistence) and between a device model and the
//! Fabricator that drives it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::{
    fabricator::FabricatorRecord,
    job::{JobRecord, NewJob},
    models::ModelDescriptor,
    protocol::CommandTable,
    Connection, FabricatorId, Issue, IssueId, JobId, JobStatus, PortInfo,
};

/// Source of serial links. Implemented for real OS serial ports and for
/// emulated devices.
#[async_trait]
pub trait Ports: Send + Sync {
    /// Enumerate the ports that are present right now.
    async fn available_ports(&self) -> std::io::Result<Vec<PortInfo>>;

    /// Open a line-oriented link to the device at `device_path`.
    async fn open(&self, device_path: &str, baud: u32) -> std::io::Result<Connection>;
}

/// External store of jobs, fabricators and issues.
///
/// The control core calls this after every state transition. Failures are
/// logged by the caller and never roll back the in-memory state machine.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Register a fabricator, returning the existing id when one with the
    /// same hardware id is already known.
    async fn register_fabricator(&self, fabricator: &FabricatorRecord) -> Result<FabricatorId>;

    /// Store a new job, returning its id.
    async fn insert_job(&self, job: NewJob) -> Result<JobId>;

    /// Record a job's new status.
    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()>;

    /// Record a job's progress fraction.
    async fn update_job_progress(&self, job_id: JobId, progress: f64) -> Result<()>;

    /// All jobs bound to `fabricator_id`, in submission order.
    async fn queue_snapshot(&self, fabricator_id: FabricatorId) -> Result<Vec<JobRecord>>;

    /// Store an issue, linking it to its job when one is set.
    async fn record_issue(&self, issue: &Issue) -> Result<IssueId>;

    /// Look a job up by id.
    async fn find_job(&self, job_id: JobId) -> Result<Option<JobRecord>>;

    /// Delete a job.
    async fn delete_job(&self, job_id: JobId) -> Result<()>;

    /// Toggle whether a job is exempt from retention cleanup.
    async fn set_favorite(&self, job_id: JobId, favorite: bool) -> Result<()>;

    /// Scrub the payloads of terminal, non-favorite jobs submitted before
    /// `cutoff`. Returns how many were scrubbed.
    async fn clear_space(&self, cutoff: DateTime<Local>) -> Result<usize>;
}

/// A physical printer model: fixed identity, limits and housekeeping
/// commands of the hardware.
pub trait Model {
    /// Identity and limits of this model.
    fn descriptor(&self) -> ModelDescriptor;

    /// Homing sequence (axis home plus extruder zero) used by `reset`.
    fn home_sequence(&self) -> Vec<String>;

    /// Cool-down and motor-disable commands run after a job ends.
    fn shutdown_sequence(&self) -> Vec<String>;

    /// Command that aborts the running build on the device.
    fn cancel_command(&self) -> String;

    /// Token whose transmission marks the start of the timed part of a
    /// build (after heating). `None` starts the clock with the job.
    fn begin_timing_command(&self) -> Option<String> {
        None
    }
}

/// Capability: the model needs a fixed command sequence after connecting
/// (mechanical homing, heater priming).
pub trait StartupSequence {
    /// Commands sent once, in order, after the link opens.
    fn startup_sequence(&self) -> Vec<String>;
}

/// Capability: the model has its own protocol table on top of its family's.
pub trait ResponseCodes {
    /// Table shared by every model of the family.
    fn family_table(&self) -> CommandTable;

    /// Entries specific to this model; these win over the family table.
    fn model_table(&self) -> CommandTable;
}
