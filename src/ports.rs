//! Serial port discovery.

use log::debug;
use serialport::SerialPortType;

use crate::errors::Result;

/// Description fragments that identify the ESP32 dev boards in use
/// (native USB, CP210x "Silicon Labs" bridges, generic USB serial).
pub const DEFAULT_PORT_KEYWORDS: [&str; 3] = ["ESP32", "Silicon", "USB"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Device path or name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// Human-readable description.
    pub description: String,
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    fn from_info(info: serialport::SerialPortInfo) -> Self {
        let description = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let parts: Vec<String> = [usb.manufacturer, usb.product]
                    .into_iter()
                    .flatten()
                    .collect();
                if parts.is_empty() {
                    "USB Serial".to_string()
                } else {
                    parts.join(" ")
                }
            }
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::Unknown => String::new(),
        };
        Self {
            name: info.port_name,
            description,
        }
    }
}

/// Enumerate serial ports in OS order.
pub fn list_ports() -> Result<Vec<PortDescriptor>> {
    let ports: Vec<PortDescriptor> = serialport::available_ports()?
        .into_iter()
        .map(PortDescriptor::from_info)
        .collect();
    debug!("found {} serial ports", ports.len());
    Ok(ports)
}

/// First port whose description mentions any keyword (case-insensitive).
pub fn find_preferred_port<'a, S: AsRef<str>>(
    ports: &'a [PortDescriptor],
    keywords: &[S],
) -> Option<&'a PortDescriptor> {
    let keywords: Vec<String> = keywords
        .iter()
        .map(|k| k.as_ref().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    ports.iter().find(|p| {
        let description = p.description.to_lowercase();
        keywords.iter().any(|k| description.contains(k.as_str()))
    })
}
