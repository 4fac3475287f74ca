//! Typed replies of the QMP queries used by the agent.

use serde::{Deserialize, Serialize};

/// One PCI bus as reported by `query-pci`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PciInfo {
    pub bus: u32,
    #[serde(default)]
    pub devices: Vec<PciDeviceInfo>,
}

/// A device plugged into a PCI bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PciDeviceInfo {
    pub bus: u32,
    pub slot: u32,
    pub function: u32,
    /// Id given to the device by `device_add`, empty for built-in devices.
    #[serde(default)]
    pub qdev_id: String,
    #[serde(default)]
    pub pci_bridge: Option<PciBridgeInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PciBridgeInfo {
    pub bus: PciBusInfo,
    #[serde(default)]
    pub devices: Vec<PciDeviceInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PciBusInfo {
    pub number: u32,
    pub secondary: u32,
    pub subordinate: u32,
}

/// A character device as reported by `query-chardev`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChardevInfo {
    pub label: String,
    pub filename: String,
    #[serde(default, rename = "frontend-open")]
    pub frontend_open: bool,
}

/// Whether a device with the given qdev id is present on any of the buses,
/// including the ones hanging off bridges.
pub fn has_device(buses: &[PciInfo], id: &str) -> bool {
    fn walk(devices: &[PciDeviceInfo], id: &str) -> bool {
        devices.iter().any(|dev| {
            dev.qdev_id == id
                || dev
                    .pci_bridge
                    .as_ref()
                    .map(|bridge| walk(&bridge.devices, id))
                    .unwrap_or(false)
        })
    }
    buses.iter().any(|bus| walk(&bus.devices, id))
}

/// Backend description of a chardev connecting, as a client, to the unix
/// socket at `path`.
pub fn unix_socket_backend(path: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "socket",
        "data": {
            "addr": {
                "type": "unix",
                "data": { "path": path },
            },
            "server": false,
        },
    })
}
