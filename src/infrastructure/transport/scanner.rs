//! Discovery Module
//!
//! Lists serial ports and scans for BLE trackers by advertised name.

#[cfg(feature = "ble")]
use crate::domain::error::{InterpreterError, InterpreterResult};
use serde::Serialize;

/// A serial port that may carry a dongle or SPP tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub path: String,
    pub description: String,
}

/// A BLE peripheral whose name matches the tracker family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredTracker {
    pub address: String,
    pub name: String,
}

#[cfg(feature = "serial")]
pub fn list_serial_ports() -> anyhow::Result<Vec<PortInfo>> {
    use tokio_serial::SerialPortType;

    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                SerialPortType::UsbPort(usb) => format!(
                    "USB {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::Unknown => "Unknown".to_string(),
            };
            PortInfo {
                path: port.port_name,
                description,
            }
        })
        .collect())
}

/// First BLE adapter of the host.
#[cfg(feature = "ble")]
pub async fn default_adapter() -> InterpreterResult<btleplug::platform::Adapter> {
    use btleplug::api::Manager as _;
    use btleplug::platform::Manager;

    let unavailable = |reason: String| InterpreterError::ChannelUnavailable {
        channel: "ble".into(),
        reason,
    };
    let manager = Manager::new().await.map_err(|e| unavailable(e.to_string()))?;
    manager
        .adapters()
        .await
        .map_err(|e| unavailable(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| unavailable("no Bluetooth adapter found".to_string()))
}

/// Scan for `duration` and return peripherals whose name starts with `prefix`.
#[cfg(feature = "ble")]
pub async fn scan_ble_trackers(
    adapter: &btleplug::platform::Adapter,
    prefix: &str,
    duration: std::time::Duration,
) -> InterpreterResult<Vec<DiscoveredTracker>> {
    use crate::infrastructure::protocol::gatt;
    use btleplug::api::{Central, Peripheral as _, ScanFilter};
    use tracing::info;

    let scan_failed = |e: btleplug::Error| InterpreterError::ChannelUnavailable {
        channel: "ble".into(),
        reason: e.to_string(),
    };

    info!("Scanning for BLE trackers ({:?})", duration);
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(scan_failed)?;
    tokio::time::sleep(duration).await;
    let peripherals = adapter.peripherals().await.map_err(scan_failed)?;
    if let Err(e) = adapter.stop_scan().await {
        tracing::debug!("Stopping scan failed: {}", e);
    }

    let mut found = Vec::new();
    for peripheral in peripherals {
        let Ok(Some(props)) = peripheral.properties().await else {
            continue;
        };
        let Some(name) = props.local_name else {
            continue;
        };
        if gatt::is_tracker_name(&name, prefix) {
            found.push(DiscoveredTracker {
                address: props.address.to_string(),
                name,
            });
        }
    }
    found.sort_by(|a, b| a.address.cmp(&b.address));
    info!("Found {} BLE trackers", found.len());
    Ok(found)
}
