//! Error taxonomy for the fabricator control core.

use crate::JobId;

/// Errors raised while driving a Fabricator.
#[derive(Debug, thiserror::Error)]
pub enum FabricatorError {
    /// The Fabricator's device path is not among the enumerated ports.
    #[error("device {device_path} is not connected")]
    Discovery {
        /// Path the Fabricator expected to find (`/dev/ttyACM0`, etc).
        device_path: String,
    },

    /// The serial link could not be opened, or dropped while in use.
    #[error("connection to {device_path} failed: {source}")]
    Connection {
        /// Path of the device the link belongs to.
        device_path: String,

        /// Underlying i/o failure.
        #[source]
        source: std::io::Error,
    },

    /// The device answered a command with something unexpected, or did not
    /// answer within the command's budget.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Invalid job queue operation.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Problem with a job's payload.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The Fabricator is not in a state where the request makes sense.
    #[error("fabricator is {status}, cannot {action}")]
    InvalidState {
        /// Current status.
        status: crate::FabricatorStatus,

        /// What was requested.
        action: &'static str,
    },

    /// The persistence gateway rejected a call.
    #[error("persistence gateway: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl FabricatorError {
    /// Wrap an i/o error from the link to `device_path`.
    pub(crate) fn connection(device_path: &str, source: std::io::Error) -> Self {
        Self::Connection {
            device_path: device_path.to_owned(),
            source,
        }
    }
}

/// Failures of the command/response cycle.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The device reported an error in response to `command`.
    #[error("command {command:?} rejected by device: {response:?}")]
    Rejected {
        /// Line that was sent.
        command: String,

        /// Response line that failed validation.
        response: String,
    },

    /// No acknowledgment arrived before the command's wait budget expired.
    #[error("command {command:?} timed out after {budget:?} (last response: {last_response:?})")]
    Timeout {
        /// Line that was sent.
        command: String,

        /// Budget that was exhausted.
        budget: std::time::Duration,

        /// Last line read from the device, if any.
        last_response: Option<String>,
    },

    /// The link closed while the command was outstanding.
    #[error("link closed while waiting on {command:?}")]
    Closed {
        /// Line that was sent.
        command: String,
    },
}

impl ProtocolError {
    /// The command line the failure belongs to.
    pub fn command(&self) -> &str {
        match self {
            Self::Rejected { command, .. } | Self::Timeout { command, .. } | Self::Closed { command } => command,
        }
    }
}

/// Invalid operations on a [crate::JobQueue].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The job is already queued.
    #[error("job {0} is already queued")]
    Duplicate(JobId),

    /// No job with this id is queued.
    #[error("job {0} is not queued")]
    UnknownJob(JobId),
}

/// Problems with a job's payload or bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The payload was scrubbed by the retention policy.
    #[error("job {0} has no payload")]
    MissingPayload(JobId),

    /// The stored payload could not be decompressed.
    #[error("payload is not valid gzip: {0}")]
    Corrupt(#[source] std::io::Error),

    /// The payload is not UTF-8 text.
    #[error("payload is not text: {0}")]
    NotText(#[from] std::string::FromUtf8Error),

    /// Payload may only be cleared on a terminal, non-favorite job.
    #[error("job {0} payload cannot be scrubbed")]
    Retained(JobId),

    /// Filesystem error while exporting.
    #[error("export failed: {0}")]
    Export(#[source] std::io::Error),
}
