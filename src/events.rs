//! Fire-and-forget notifications about job state, for whoever is listening
//! (a websocket bridge, a UI, tests).

use chrono::{DateTime, Local};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{JobId, JobStatus};

/// Value of one of the job timing slots carried by [Event::SetTime].
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum TimeValue {
    /// Slot 0: total seconds.
    Seconds(f64),

    /// Slots 1-3: a point in time.
    Timestamp(DateTime<Local>),

    /// The slot was cleared.
    Unset,
}

/// Events emitted by the control core.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A job moved to a new status.
    JobStatusUpdate {
        /// Job.
        job_id: JobId,

        /// New status.
        status: JobStatus,
    },

    /// A printing job advanced.
    ProgressUpdate {
        /// Job.
        job_id: JobId,

        /// Fraction in `[0, 1]`.
        progress: f64,
    },

    /// A pause was requested or withdrawn.
    FilePauseUpdate {
        /// Job.
        job_id: JobId,

        /// Whether the job is paused.
        paused: bool,
    },

    /// A finished build was taken off the plate.
    ReleaseJob {
        /// Job.
        job_id: JobId,

        /// Released flag.
        released: bool,
    },

    /// One of the job timing slots changed.
    SetTime {
        /// Job.
        job_id: JobId,

        /// New slot value.
        new_time: TimeValue,

        /// Slot index: 0 total, 1 ETA, 2 start, 3 pause start.
        index: u8,
    },
}

impl TimeValue {
    fn from_timestamp(timestamp: Option<DateTime<Local>>) -> Self {
        timestamp.map(Self::Timestamp).unwrap_or(Self::Unset)
    }
}

/// Broadcast channel the core publishes [Event]s on.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus buffering at most `capacity` events per slow
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Listen for events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish `event`. Nobody listening is not an error.
    pub fn emit(&self, event: Event) {
        tracing::trace!(event = format!("{:?}", event), "emit");
        let _ = self.sender.send(event);
    }

    /// Publish every timing slot of a job.
    pub fn emit_times(&self, job_id: JobId, time: &crate::job::JobTime) {
        self.emit(Event::SetTime {
            job_id,
            new_time: TimeValue::Seconds(time.total_seconds),
            index: 0,
        });
        for (index, slot) in [(1, time.eta), (2, time.started_at), (3, time.paused_at)] {
            self.emit(Event::SetTime {
                job_id,
                new_time: TimeValue::from_timestamp(slot),
                index,
            });
        }
    }
}
