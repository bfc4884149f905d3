//! Serial port enumeration

use serialport::{available_ports, SerialPortType};

use crate::error::Error;

/// A detected serial port and its human-readable description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// System name of the port, e.g. `/dev/ttyUSB0` or `COM3`
    pub name: String,
    /// Adapter description, when the backend reports one
    pub description: Option<String>,
}

/// List the currently attached serial ports.
///
/// Only USB serial adapters (and ports the backend cannot classify) are
/// reported, since that is what dev boards enumerate as. No port is opened;
/// this is safe to call repeatedly, e.g. from a refresh action. An empty
/// result is not an error.
pub fn detect_serial_ports() -> Result<Vec<PortInfo>, Error> {
    let ports = available_ports()?
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .map(|port_info| {
            let description = match &port_info.port_type {
                SerialPortType::UsbPort(usb_info) => usb_info
                    .product
                    .clone()
                    .or_else(|| usb_info.manufacturer.clone()),
                _ => None,
            };

            PortInfo {
                name: port_info.port_name,
                description,
            }
        })
        .collect();

    Ok(ports)
}
