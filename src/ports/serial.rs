use async_trait::async_trait;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

use crate::{ports::usb_hardware_id, Connection, PortInfo, Ports};

/// Ports of the host's serial devices.
#[derive(Debug, Copy, Clone, Default)]
pub struct SerialPorts;

#[async_trait]
impl Ports for SerialPorts {
    async fn available_ports(&self) -> std::io::Result<Vec<PortInfo>> {
        tracing::debug!("scanning serial ports");
        let ports = tokio_serial::available_ports()?;

        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    description: usb.product.clone().unwrap_or_else(|| port.port_name.clone()),
                    hardware_id: usb_hardware_id(usb.vid, usb.pid, usb.serial_number.as_deref()),
                    device_path: port.port_name,
                },
                _ => {
                    tracing::trace!(port_name = port.port_name, "non-usb port");
                    PortInfo {
                        description: port.port_name.clone(),
                        hardware_id: "n/a".to_owned(),
                        device_path: port.port_name,
                    }
                }
            })
            .collect())
    }

    async fn open(&self, device_path: &str, baud: u32) -> std::io::Result<Connection> {
        let stream = tokio_serial::new(device_path, baud).open_native_async()?;
        tracing::debug!(device = device_path, baud = baud, "opened serial link");
        Ok(Connection::from_stream(device_path, stream))
    }
}
