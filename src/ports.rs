//! Cross-platform serial port enumeration backing `GET /config/com-ports`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub port: String,
    pub description: String,
}

/// List available serial ports, sorted by name. Unlike a debugging tool
/// this service only ever talks to real RS-485 adapters, so no virtual or
/// simulated ports are synthesised here.
pub fn enumerate() -> Vec<PortInfo> {
    let mut ports = serialport::available_ports().unwrap_or_default();
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    ports
        .into_iter()
        .map(|p| PortInfo {
            port: p.port_name,
            description: describe(&p.port_type),
        })
        .collect()
}

fn describe(port_type: &serialport::SerialPortType) -> String {
    match port_type {
        serialport::SerialPortType::UsbPort(info) => {
            let product = info.product.clone().unwrap_or_default();
            if product.is_empty() {
                format!("USB {:04x}:{:04x}", info.vid, info.pid)
            } else {
                product
            }
        }
        serialport::SerialPortType::PciPort => "PCI".to_string(),
        serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        serialport::SerialPortType::Unknown => "Unknown".to_string(),
    }
}
