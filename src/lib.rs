#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate drives a fleet of serial-attached 3D printers ("fabricators"):
//! it discovers devices, keeps one job queue per device, streams queued jobs
//! through each model's command/response protocol, and reports job state as
//! it moves to completion or failure.

pub mod config;
mod connection;
mod error;
pub mod events;
pub mod fabricator;
pub mod job;
mod memory;
pub mod models;
pub mod ports;
pub mod protocol;
mod queue;
pub mod registry;
mod traits;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use connection::Connection;
pub use error::{FabricatorError, JobError, ProtocolError, QueueError};
pub use events::{Event, EventBus};
pub use fabricator::{Fabricator, FabricatorId, FabricatorInfo, FabricatorStatus};
pub use job::{Issue, IssueId, Job, JobId, JobStatus, SharedJob};
pub use memory::MemoryGateway;
pub use models::{ModelDescriptor, Profile};
pub use ports::{EmulatorRegistry, FleetPorts, PortInfo};
pub use queue::JobQueue;
pub use registry::Registry;
pub use traits::{Model, PersistenceGateway, Ports, ResponseCodes, StartupSequence};

/// Position of the toolhead in device coordinates, in millimeters.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct Vector3 {
    /// X axis ("left and right").
    pub x: f64,

    /// Y axis ("front to back").
    pub y: f64,

    /// Z axis ("up and down").
    pub z: f64,
}
