//! Known printer models and the protocol tables built from them.

mod makerbot;
mod prusa;

pub use makerbot::Replicator2;
pub use prusa::PrusaMk3;

use schemars::JsonSchema;
use serde::Serialize;

use crate::{
    protocol::{merge_tables, ProtocolTable},
    Model, PortInfo, ResponseCodes, StartupSequence,
};

/// Fixed identity and limits of a printer model.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ModelDescriptor {
    /// USB vendor id.
    pub vendor_id: u16,

    /// USB product id.
    pub product_id: u16,

    /// USB description string the device reports.
    pub description: &'static str,

    /// Maker of the device.
    pub manufacturer: &'static str,

    /// Model name.
    pub model: &'static str,

    /// Highest feed rate (mm/min) the model accepts, if limited.
    pub max_feed_rate: Option<u32>,

    /// Serial baud rate, when the model needs a specific one.
    pub baud: Option<u32>,
}

/// A model bound to its merged [ProtocolTable].
///
/// Only types implementing every capability the control core relies on
/// can be turned into a profile, so a device whose model lacks one is
/// never instantiated.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    descriptor: ModelDescriptor,
    table: ProtocolTable,
}

impl Profile {
    /// Build the profile of `model`.
    pub fn new<ModelT>(model: &ModelT) -> Self
    where
        ModelT: Model + StartupSequence + ResponseCodes,
    {
        let descriptor = model.descriptor();
        Self {
            descriptor,
            table: ProtocolTable {
                commands: merge_tables(&model.family_table(), &model.model_table()),
                startup: model.startup_sequence(),
                home: model.home_sequence(),
                shutdown: model.shutdown_sequence(),
                cancel: model.cancel_command(),
                begin_timing: model.begin_timing_command(),
                max_feed_rate: descriptor.max_feed_rate,
            },
        }
    }

    /// Identity and limits.
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    /// Merged protocol table.
    pub fn table(&self) -> &ProtocolTable {
        &self.table
    }

    /// Whether the device on `port` is this model. USB ids are compared
    /// when the hardware id carries them, the description otherwise.
    pub fn matches(&self, port: &PortInfo) -> bool {
        match port.usb_ids() {
            Some((vid, pid)) => vid == self.descriptor.vendor_id && pid == self.descriptor.product_id,
            None => port.description == self.descriptor.description,
        }
    }
}

/// Profiles of every supported model.
pub fn known_profiles() -> Vec<Profile> {
    vec![Profile::new(&PrusaMk3), Profile::new(&Replicator2)]
}

/// First of `profiles` matching the device on `port`.
pub fn profile_for<'a>(profiles: &'a [Profile], port: &PortInfo) -> Option<&'a Profile> {
    profiles.iter().find(|profile| profile.matches(port))
}
