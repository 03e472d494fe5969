//! Where serial links come from: OS serial ports, emulated devices, or both.

mod emulator;
#[cfg(feature = "serial")]
mod serial;

pub use emulator::{EmulatorHandle, EmulatorRegistry};
#[cfg(feature = "serial")]
pub use serial::SerialPorts;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Connection, Ports};

/// One enumerated port, as device discovery reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PortInfo {
    /// OS path of the port (`/dev/ttyACM0`, `COM3`, ...).
    pub device_path: String,

    /// Human readable description the device reports.
    pub description: String,

    /// Hardware id, `USB VID:PID=XXXX:XXXX SER=...` for USB devices.
    pub hardware_id: String,
}

impl PortInfo {
    /// USB vendor and product id parsed from the hardware id.
    pub fn usb_ids(&self) -> Option<(u16, u16)> {
        static IDS: OnceLock<Regex> = OnceLock::new();
        let re = IDS.get_or_init(|| {
            Regex::new(r"VID:PID=([0-9A-Fa-f]{4}):([0-9A-Fa-f]{4})").expect("static regex is valid")
        });
        let caps = re.captures(&self.hardware_id)?;
        let vid = u16::from_str_radix(&caps[1], 16).ok()?;
        let pid = u16::from_str_radix(&caps[2], 16).ok()?;
        Some((vid, pid))
    }

    /// Serial number parsed from the hardware id.
    pub fn serial_number(&self) -> Option<&str> {
        self.hardware_id
            .split_whitespace()
            .find_map(|field| field.strip_prefix("SER="))
            .filter(|serial| !serial.is_empty())
    }
}

/// Render a USB hardware id the way discovery reports it.
pub fn usb_hardware_id(vid: u16, pid: u16, serial: Option<&str>) -> String {
    match serial {
        Some(serial) => format!("USB VID:PID={:04X}:{:04X} SER={}", vid, pid, serial),
        None => format!("USB VID:PID={:04X}:{:04X}", vid, pid),
    }
}

/// The ports the fleet drives: emulated devices and, with the `serial`
/// feature, the OS serial ports.
#[derive(Debug, Clone, Default)]
pub struct FleetPorts {
    #[cfg(feature = "serial")]
    serial: Option<SerialPorts>,
    emulators: EmulatorRegistry,
}

impl FleetPorts {
    /// Serial ports (when built with them) plus the devices of `emulators`.
    pub fn new(emulators: EmulatorRegistry) -> Self {
        Self {
            #[cfg(feature = "serial")]
            serial: Some(SerialPorts),
            emulators,
        }
    }

    /// Only the devices of `emulators`.
    pub fn emulated_only(emulators: EmulatorRegistry) -> Self {
        Self {
            #[cfg(feature = "serial")]
            serial: None,
            emulators,
        }
    }

    /// Registry of emulated devices.
    pub fn emulators(&self) -> &EmulatorRegistry {
        &self.emulators
    }
}

#[async_trait]
impl Ports for FleetPorts {
    async fn available_ports(&self) -> std::io::Result<Vec<PortInfo>> {
        #[allow(unused_mut)]
        let mut ports = vec![];
        #[cfg(feature = "serial")]
        if let Some(serial) = &self.serial {
            ports.extend(serial.available_ports().await?);
        }
        ports.extend(self.emulators.available_ports().await?);
        Ok(ports)
    }

    async fn open(&self, device_path: &str, baud: u32) -> std::io::Result<Connection> {
        if self.emulators.contains(device_path) {
            return self.emulators.open(device_path, baud).await;
        }
        #[cfg(feature = "serial")]
        if let Some(serial) = &self.serial {
            return serial.open(device_path, baud).await;
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such port: {}", device_path),
        ))
    }
}
