//! Emulated devices: test doubles (or a browser bridge) that register a
//! port and then answer the protocol over an in-memory stream.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{
    io::DuplexStream,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::{Connection, PortInfo, Ports};

const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
struct EmulatedDevice {
    id: u64,
    info: PortInfo,
    streams: UnboundedSender<DuplexStream>,
}

/// Process-wide registry of emulated devices, keyed by port path.
///
/// Entries are created by [EmulatorRegistry::handshake] and removed by
/// [EmulatorRegistry::disconnect] or by dropping the returned handle.
#[derive(Debug, Clone, Default)]
pub struct EmulatorRegistry {
    devices: Arc<DashMap<String, EmulatedDevice>>,
    next_id: Arc<AtomicU64>,
}

/// The emulator's side of a registered device.
#[derive(Debug)]
pub struct EmulatorHandle {
    id: u64,
    port: String,
    devices: Arc<DashMap<String, EmulatedDevice>>,
    streams: UnboundedReceiver<DuplexStream>,
}

impl EmulatorRegistry {
    /// Register an emulated device on `port`. Fails if the port is taken.
    pub fn handshake(&self, port: &str, name: &str, hardware_id: &str) -> std::io::Result<EmulatorHandle> {
        let (tx, rx) = unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match self.devices.entry(port.to_owned()) {
            Entry::Occupied(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("emulated port {} already registered", port),
                ));
            }
            Entry::Vacant(entry) => {
                entry.insert(EmulatedDevice {
                    id,
                    info: PortInfo {
                        device_path: port.to_owned(),
                        description: name.to_owned(),
                        hardware_id: hardware_id.to_owned(),
                    },
                    streams: tx,
                });
            }
        }

        tracing::info!(port = port, name = name, "emulated device connected");
        Ok(EmulatorHandle {
            id,
            port: port.to_owned(),
            devices: self.devices.clone(),
            streams: rx,
        })
    }

    /// Remove the emulated device on `port`. Returns whether it existed.
    pub fn disconnect(&self, port: &str) -> bool {
        let removed = self.devices.remove(port).is_some();
        if removed {
            tracing::info!(port = port, "emulated device disconnected");
        }
        removed
    }

    /// Whether an emulated device is registered on `port`.
    pub fn contains(&self, port: &str) -> bool {
        self.devices.contains_key(port)
    }

    /// Port, name and hardware id of the first registered device, in port
    /// order.
    pub fn first_port(&self) -> Option<PortInfo> {
        self.ports().into_iter().next()
    }

    /// Every registered device, sorted by port.
    pub fn ports(&self) -> Vec<PortInfo> {
        let mut ports: Vec<PortInfo> = self.devices.iter().map(|entry| entry.info.clone()).collect();
        ports.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        ports
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl Ports for EmulatorRegistry {
    async fn available_ports(&self) -> std::io::Result<Vec<PortInfo>> {
        Ok(self.ports())
    }

    async fn open(&self, device_path: &str, _baud: u32) -> std::io::Result<Connection> {
        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);

        let delivered = match self.devices.get(device_path) {
            Some(device) => device.streams.send(theirs).is_ok(),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no emulated device on {}", device_path),
                ))
            }
        };
        if !delivered {
            // The emulator went away without saying goodbye.
            self.disconnect(device_path);
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("emulated device on {} is gone", device_path),
            ));
        }

        tracing::debug!(device = device_path, "opened emulated link");
        Ok(Connection::from_stream(device_path, ours))
    }
}

impl EmulatorHandle {
    /// Port this device is registered on.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Wait for the next link opened to this device. `None` once the device
    /// has been disconnected.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.streams.recv().await
    }
}

impl Drop for EmulatorHandle {
    fn drop(&mut self) {
        if self.devices.remove_if(&self.port, |_, device| device.id == self.id).is_some() {
            tracing::info!(port = self.port, "emulated device dropped");
        }
    }
}
