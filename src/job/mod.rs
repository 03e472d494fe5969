//! A unit of work for a Fabricator: a compressed G-code payload plus its
//! lifecycle, progress and timing bookkeeping.

pub mod estimate;
pub mod payload;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Local};
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{FabricatorId, JobError};

/// Suffix appended to the file name of a job whose payload was scrubbed.
pub const SCRUBBED_SUFFIX: &str = ": Removed after 6 months";

/// Identifier of a [Job], assigned by the persistence gateway.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Display, FromStr,
)]
#[display("{0}")]
#[serde(transparent)]
pub struct JobId(pub u64);

/// Identifier of an [Issue], assigned by the persistence gateway.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Display, FromStr,
)]
#[display("{0}")]
#[serde(transparent)]
pub struct IssueId(pub u64);

/// Lifecycle of a [Job].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum JobStatus {
    /// Waiting in a queue.
    Inqueue,

    /// Being streamed to a device.
    Printing,

    /// Streaming halted between lines until resumed.
    Paused,

    /// Every line was acknowledged.
    Complete,

    /// Streaming failed or was cancelled.
    Error,
}

impl JobStatus {
    /// True for states a job never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// A recorded error description, optionally linked to the job that caused
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Issue {
    /// Id, once stored.
    pub id: Option<IssueId>,

    /// What went wrong.
    pub description: String,

    /// Job that produced the issue.
    pub job_id: Option<JobId>,
}

impl Issue {
    /// Create a new, not yet stored, issue.
    pub fn new(description: impl Into<String>, job_id: Option<JobId>) -> Self {
        Self {
            id: None,
            description: description.into(),
            job_id,
        }
    }
}

/// Timing bookkeeping of a job, in the order the `set_time` event indexes
/// its slots.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTime {
    /// Slot 0: estimated total duration, in seconds, including pauses.
    pub total_seconds: f64,

    /// Slot 1: estimated completion time.
    pub eta: Option<DateTime<Local>>,

    /// Slot 2: when the timed part of the build started.
    pub started_at: Option<DateTime<Local>>,

    /// Slot 3: when the current pause started.
    pub paused_at: Option<DateTime<Local>>,
}

/// A job shared between its queue, the Drive Loop executing it and request
/// handlers.
pub type SharedJob = Arc<Mutex<Job>>;

/// Fields needed to store a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Fabricator the job is submitted to.
    pub fabricator_id: Option<FabricatorId>,

    /// Display name.
    pub name: String,

    /// Name of the uploaded file.
    pub file_name_original: String,

    /// Gzip-compressed payload.
    pub payload: Bytes,

    /// Exempt from retention cleanup.
    pub favorite: bool,

    /// Initial status.
    pub status: JobStatus,
}

/// A job as the persistence gateway stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Id.
    pub id: JobId,

    /// Fabricator the job is bound to.
    pub fabricator_id: Option<FabricatorId>,

    /// Display name.
    pub name: String,

    /// Name of the uploaded file.
    pub file_name_original: String,

    /// Gzip-compressed payload; `None` once scrubbed.
    pub payload: Option<Bytes>,

    /// Lifecycle status.
    pub status: JobStatus,

    /// Progress fraction.
    pub progress: f64,

    /// Exempt from retention cleanup.
    pub favorite: bool,

    /// Linked issue.
    pub issue_id: Option<IssueId>,

    /// When the job was submitted.
    pub submitted_at: DateTime<Local>,
}

/// One submitted print task.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    fabricator_id: Option<FabricatorId>,
    name: String,
    file_name_original: String,
    payload: Option<Bytes>,
    status: JobStatus,
    progress: f64,
    favorite: bool,
    paused: bool,
    released: bool,
    time_started: bool,
    time: JobTime,
    issue: Option<Issue>,
    submitted_at: DateTime<Local>,
}

impl Job {
    /// Create a queued job around an already compressed `payload` (see
    /// [payload::ingest]).
    pub fn new(id: JobId, name: &str, file_name_original: &str, payload: Bytes, favorite: bool) -> Self {
        Self {
            id,
            fabricator_id: None,
            name: name.to_owned(),
            file_name_original: file_name_original.to_owned(),
            payload: Some(payload),
            status: JobStatus::Inqueue,
            progress: 0.0,
            favorite,
            paused: false,
            released: false,
            time_started: false,
            time: JobTime::default(),
            issue: None,
            submitted_at: Local::now(),
        }
    }

    /// Rebuild a job from its stored form.
    pub fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.id,
            fabricator_id: record.fabricator_id,
            name: record.name,
            file_name_original: record.file_name_original,
            payload: record.payload,
            status: record.status,
            progress: record.progress,
            favorite: record.favorite,
            paused: false,
            released: false,
            time_started: false,
            time: JobTime::default(),
            issue: None,
            submitted_at: record.submitted_at,
        }
    }

    /// Stored form of this job.
    pub fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            fabricator_id: self.fabricator_id,
            name: self.name.clone(),
            file_name_original: self.file_name_original.clone(),
            payload: self.payload.clone(),
            status: self.status,
            progress: self.progress,
            favorite: self.favorite,
            issue_id: self.issue.as_ref().and_then(|issue| issue.id),
            submitted_at: self.submitted_at,
        }
    }

    /// Wrap the job for sharing.
    pub fn shared(self) -> SharedJob {
        Arc::new(Mutex::new(self))
    }

    /// Id.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the uploaded file.
    pub fn file_name_original(&self) -> &str {
        &self.file_name_original
    }

    /// Fabricator the job is bound to.
    pub fn fabricator_id(&self) -> Option<FabricatorId> {
        self.fabricator_id
    }

    /// Bind the job to a fabricator.
    pub fn set_fabricator_id(&mut self, fabricator_id: FabricatorId) {
        self.fabricator_id = Some(fabricator_id);
    }

    /// Lifecycle status.
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move to `status`.
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    /// Progress fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Record progress. Ignored unless the job is printing; returns whether
    /// the value changed.
    pub fn set_progress(&mut self, progress: f64) -> bool {
        if self.status != JobStatus::Printing {
            return false;
        }
        let progress = progress.clamp(0.0, 1.0);
        if progress == self.progress {
            return false;
        }
        self.progress = progress;
        true
    }

    /// Exempt from retention cleanup.
    pub fn favorite(&self) -> bool {
        self.favorite
    }

    /// Toggle the retention exemption.
    pub fn set_favorite(&mut self, favorite: bool) {
        self.favorite = favorite;
    }

    /// Whether a pause has been requested.
    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Request (or withdraw a request for) a pause at the next line
    /// boundary.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether the finished build has been taken off the plate.
    pub fn released(&self) -> bool {
        self.released
    }

    /// Mark the finished build as taken off the plate.
    pub fn set_released(&mut self, released: bool) {
        self.released = released;
    }

    /// Timing bookkeeping.
    pub fn time(&self) -> &JobTime {
        &self.time
    }

    /// Whether the job clock has started.
    pub fn time_started(&self) -> bool {
        self.time_started
    }

    /// Linked issue.
    pub fn issue(&self) -> Option<&Issue> {
        self.issue.as_ref()
    }

    /// Link an issue.
    pub fn set_issue(&mut self, issue: Issue) {
        self.issue = Some(issue);
    }

    /// When the job was submitted.
    pub fn submitted_at(&self) -> DateTime<Local> {
        self.submitted_at
    }

    /// Whether the payload is still stored.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Compressed payload.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Decompressed G-code text.
    pub fn gcode(&self) -> Result<String, JobError> {
        let compressed = self.payload.as_ref().ok_or(JobError::MissingPayload(self.id))?;
        Ok(String::from_utf8(payload::decompress(compressed)?)?)
    }

    /// Estimated print duration read from the payload's comments.
    pub fn estimated_seconds(&self) -> Option<u64> {
        self.gcode().ok().and_then(|text| estimate::time_from_gcode(&text))
    }

    /// Put the job back in line: status `inqueue`, progress and timing
    /// cleared. Used when an execution from a previous process lifetime is
    /// restored.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Inqueue;
        self.progress = 0.0;
        self.paused = false;
        self.time_started = false;
        self.time = JobTime::default();
    }

    /// Start the job clock at `now` using `estimate_seconds` as the total.
    /// An estimate too large to place on the calendar counts as none.
    pub fn start_clock(&mut self, now: DateTime<Local>, estimate_seconds: u64) {
        let eta = i64::try_from(estimate_seconds)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|estimate| now.checked_add_signed(estimate));

        self.time_started = true;
        self.time.total_seconds = if eta.is_some() { estimate_seconds as f64 } else { 0.0 };
        self.time.eta = eta;
        self.time.started_at = Some(now);
        self.time.paused_at = None;
    }

    /// Freeze the clock at `now`.
    pub fn pause_clock(&mut self, now: DateTime<Local>) {
        if self.time.paused_at.is_none() {
            self.time.paused_at = Some(now);
        }
    }

    /// Resume the clock at `now`, pushing the total and ETA back by the
    /// paused duration. Returns the paused duration in seconds.
    pub fn resume_clock(&mut self, now: DateTime<Local>) -> Option<f64> {
        let paused_at = self.time.paused_at.take()?;
        let paused_for = (now - paused_at).max(ChronoDuration::zero());
        self.time.total_seconds += paused_for.num_milliseconds() as f64 / 1000.0;
        self.time.eta = self.time.eta.and_then(|eta| eta.checked_add_signed(paused_for));
        Some(paused_for.num_milliseconds() as f64 / 1000.0)
    }

    /// Drop the stored payload. Only allowed for terminal, non-favorite
    /// jobs.
    pub fn scrub_payload(&mut self) -> Result<(), JobError> {
        if self.favorite || !self.status.is_terminal() {
            return Err(JobError::Retained(self.id));
        }
        self.payload = None;
        if !self.file_name_original.contains(SCRUBBED_SUFFIX) {
            self.file_name_original.push_str(SCRUBBED_SUFFIX);
        }
        Ok(())
    }

    /// Unique export name: the original file name with the job id appended
    /// to its stem.
    pub fn export_file_name(&self) -> String {
        let original = Path::new(&self.file_name_original);
        let stem = original
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_name_original.clone());
        match original.extension() {
            Some(ext) => format!("{}_{}.{}", stem, self.id, ext.to_string_lossy()),
            None => format!("{}_{}", stem, self.id),
        }
    }

    /// Write the decompressed payload into `dir`, returning the file path.
    pub async fn export(&self, dir: &Path) -> Result<PathBuf, JobError> {
        let compressed = self.payload.as_ref().ok_or(JobError::MissingPayload(self.id))?;
        let raw = payload::decompress(compressed)?;
        tokio::fs::create_dir_all(dir).await.map_err(JobError::Export)?;
        let path = dir.join(self.export_file_name());
        tokio::fs::write(&path, raw).await.map_err(JobError::Export)?;
        tracing::debug!(job_id = self.id.0, path = format!("{:?}", path), "exported job payload");
        Ok(path)
    }
}
