//! Static PCI topology of the virtual machine, used to place hot-plugged
//! devices. A device's physical id selects a slot counting through the
//! configured bridges in order.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use super::{DeviceError, InvalidParameters};

fn default_count() -> u32 {
    32
}

/// A PCI bridge devices can be plugged into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PciBridge {
    /// qdev id of the bridge.
    pub name: Option<String>,
    /// Number of usable slots.
    #[serde(default = "default_count")]
    pub count: u32,
}

/// Parameters of the device managers plugging PCI devices into a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PciDeviceConfig {
    pub buses: Vec<PciBridge>,
    /// Host of the VM monitor, or the absolute path of its unix socket when
    /// no port is set.
    pub qmp_addr: String,
    pub qmp_port: Option<u16>,
    /// Directory holding the sockets shared with the VM.
    pub sock_path: PathBuf,
}

impl Default for PciDeviceConfig {
    fn default() -> Self {
        Self {
            buses: Vec::new(),
            qmp_addr: "127.0.0.1".to_string(),
            qmp_port: None,
            sock_path: PathBuf::from("/var/tmp/"),
        }
    }
}

impl PciDeviceConfig {
    /// Address of the VM monitor. A host needs a port, only an absolute
    /// path names a unix socket.
    pub fn qmp_address(&self) -> Result<qmp::Address, DeviceError> {
        if self.qmp_port.is_none() && !Path::new(&self.qmp_addr).is_absolute()
        {
            return InvalidParameters {
                reason: format!("qmp_port is required for {}", self.qmp_addr),
            }
            .fail();
        }
        Ok(qmp::Address::new(&self.qmp_addr, self.qmp_port))
    }
}

/// Location of a device on the PCI topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciSlot {
    /// Position of the bridge in the configuration.
    pub index: usize,
    pub bus: String,
    pub addr: u32,
}

impl PciSlot {
    /// Address as passed to `device_add`.
    pub fn addr_hex(&self) -> String {
        format!("{:#x}", self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct PciBuses {
    bridges: Vec<(String, u32)>,
}

impl PciBuses {
    pub fn new(bridges: &[PciBridge]) -> Result<Self, DeviceError> {
        let mut names = HashSet::new();
        let mut buses = Vec::with_capacity(bridges.len());
        for bridge in bridges {
            let Some(name) = bridge.name.clone() else {
                return InvalidParameters {
                    reason: "PCI bus is missing a name",
                }
                .fail();
            };
            if !names.insert(name.clone()) {
                return InvalidParameters {
                    reason: format!("Duplicate PCI bus name: {}", name),
                }
                .fail();
            }
            buses.push((name, bridge.count));
        }
        Ok(Self {
            bridges: buses,
        })
    }

    /// Slot of the device with the given physical id.
    pub fn slot(&self, physical_id: u32) -> Result<PciSlot, DeviceError> {
        let mut id = physical_id;
        for (index, (bus, count)) in self.bridges.iter().enumerate() {
            if id < *count {
                return Ok(PciSlot {
                    index,
                    bus: bus.clone(),
                    addr: id,
                });
            }
            id -= count;
        }
        InvalidParameters {
            reason: format!("Unexpected physical_id: {}", physical_id),
        }
        .fail()
    }
}
