//! Access to the virtual machine monitor, used by the device managers
//! exposing volumes as PCI devices.

use std::time::Duration;

use async_trait::async_trait;
use qmp::{
    types::{ChardevInfo, PciInfo},
    Address,
};
use serde_json::Value;

/// Default timeout of a monitor command.
pub const QMP_TIMEOUT: Duration = Duration::from_secs(8);

/// Hot-plug operations of a VM monitor.
#[async_trait]
pub trait VmMonitor: Send + Sync {
    async fn query_pci(&self) -> Result<Vec<PciInfo>, qmp::Error>;

    async fn query_chardev(&self) -> Result<Vec<ChardevInfo>, qmp::Error>;

    async fn device_add(&self, arguments: Value) -> Result<(), qmp::Error>;

    /// Remove a device, waiting until the guest released it if `wait`.
    async fn device_del(&self, id: &str, wait: bool) -> Result<(), qmp::Error>;

    async fn chardev_add(
        &self,
        id: &str,
        backend: Value,
    ) -> Result<(), qmp::Error>;

    async fn chardev_remove(&self, id: &str) -> Result<(), qmp::Error>;

    /// Whether a device with the given qdev id is plugged anywhere in the
    /// PCI hierarchy.
    async fn has_device(&self, id: &str) -> Result<bool, qmp::Error> {
        let buses = self.query_pci().await?;
        Ok(qmp::types::has_device(&buses, id))
    }
}

/// Monitor reached over QMP. Every operation uses a connection of its own.
#[derive(Debug, Clone)]
pub struct QmpMonitor {
    address: Address,
    timeout: Duration,
}

impl QmpMonitor {
    pub fn new(address: Address, timeout: Duration) -> Self {
        Self {
            address,
            timeout,
        }
    }

    async fn connect(&self) -> Result<qmp::Client, qmp::Error> {
        trace!("Connecting to VM monitor at {}", self.address);
        qmp::Client::connect(&self.address, self.timeout).await
    }
}

#[async_trait]
impl VmMonitor for QmpMonitor {
    async fn query_pci(&self) -> Result<Vec<PciInfo>, qmp::Error> {
        self.connect().await?.query_pci().await
    }

    async fn query_chardev(&self) -> Result<Vec<ChardevInfo>, qmp::Error> {
        self.connect().await?.query_chardev().await
    }

    async fn device_add(&self, arguments: Value) -> Result<(), qmp::Error> {
        self.connect().await?.device_add(arguments).await
    }

    async fn device_del(&self, id: &str, wait: bool) -> Result<(), qmp::Error> {
        self.connect().await?.device_del(id, wait).await
    }

    async fn chardev_add(
        &self,
        id: &str,
        backend: Value,
    ) -> Result<(), qmp::Error> {
        self.connect().await?.chardev_add(id, backend).await
    }

    async fn chardev_remove(&self, id: &str) -> Result<(), qmp::Error> {
        self.connect().await?.chardev_remove(id).await
    }
}
