use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use rpc::sma::{
    create_device_request::Params,
    CreateDeviceRequest,
    GetQosCapabilitiesResponse,
    QosLimit,
    SetQosRequest,
};
use serde_json::json;
use snafu::{OptionExt, ResultExt};

use super::{
    handle_id,
    optional_volume_id,
    pci::{PciBuses, PciDeviceConfig, PciSlot},
    volume_bdev,
    DeviceError,
    DeviceManager,
    DeviceNotFound,
    DeviceProtocol,
    Inconsistent,
    InvalidParameters,
    NotAttached,
    Qmp,
    Qos,
    Rpc,
};
use crate::{
    crypto::CryptoRegistry,
    qos::{bdev_qos_capabilities, set_volume_bdev_qos},
    spdk::{Spdk, VhostController},
    vm::VmMonitor,
};

/// Exposes a volume as a vhost-user-blk controller plugged into the VM as a
/// virtio-blk PCI device. Each device carries exactly one volume.
pub struct VhostBlkDeviceManager {
    spdk: Spdk,
    crypto: Arc<CryptoRegistry>,
    monitor: Arc<dyn VmMonitor>,
    buses: PciBuses,
    sock_path: PathBuf,
}

impl VhostBlkDeviceManager {
    pub const NAME: &'static str = "vhost_blk";
    const PREFIX: &'static str = "virtio_blk";

    pub fn new(
        spdk: Spdk,
        crypto: Arc<CryptoRegistry>,
        monitor: Arc<dyn VmMonitor>,
        config: &PciDeviceConfig,
    ) -> Result<Self, DeviceError> {
        Ok(Self {
            spdk,
            crypto,
            monitor,
            buses: PciBuses::new(&config.buses)?,
            sock_path: config.sock_path.clone(),
        })
    }

    async fn controller(
        &self,
        ctrlr: &str,
    ) -> Result<Option<VhostController>, DeviceError> {
        self.spdk.vhost_get_controller(ctrlr).await.context(Rpc {
            action: "get vhost controllers",
        })
    }

    /// Plug the controller into the VM, unless it is already.
    async fn plug(
        &self,
        ctrlr: &str,
        slot: &PciSlot,
    ) -> Result<(), DeviceError> {
        let plugged = self.monitor.has_device(ctrlr).await.context(Qmp {
            action: "query PCI devices",
        })?;
        if plugged {
            return Ok(());
        }

        let chardevs = self.monitor.query_chardev().await.context(Qmp {
            action: "query chardevs",
        })?;
        let chardev_added = if chardevs.iter().any(|c| c.label == ctrlr) {
            false
        } else {
            let socket = self.sock_path.join(ctrlr);
            let backend =
                qmp::types::unix_socket_backend(&socket.to_string_lossy());
            self.monitor
                .chardev_add(ctrlr, backend)
                .await
                .context(Qmp {
                    action: "add chardev",
                })?;
            true
        };

        info!("Adding {} on bus {} at {}", ctrlr, slot.bus, slot.addr_hex());
        let result = self
            .monitor
            .device_add(json!({
                "driver": "vhost-user-blk-pci",
                "chardev": ctrlr,
                "bus": slot.bus,
                "addr": slot.addr_hex(),
                "id": ctrlr,
            }))
            .await
            .context(Qmp {
                action: "add vhost-user-blk device",
            });
        if result.is_err() && chardev_added {
            if let Err(error) = self.monitor.chardev_remove(ctrlr).await {
                warn!("Failed to remove chardev {}: {}", ctrlr, error);
            }
        }
        result
    }
}

#[async_trait]
impl DeviceManager for VhostBlkDeviceManager {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn protocol(&self) -> DeviceProtocol {
        DeviceProtocol::VirtioBlk
    }

    fn prefix(&self) -> &str {
        Self::PREFIX
    }

    fn allow_delete_volumes(&self) -> bool {
        true
    }

    async fn create_device(
        &self,
        request: &CreateDeviceRequest,
    ) -> Result<String, DeviceError> {
        let Some(Params::VirtioBlk(params)) = &request.params else {
            return InvalidParameters {
                reason: "missing virtio_blk parameters",
            }
            .fail();
        };
        if params.virtual_id != 0 {
            return InvalidParameters {
                reason: "Unsupported virtual_id value",
            }
            .fail();
        }
        let volume = request.volume.as_ref().context(InvalidParameters {
            reason: "Missing required field: volume",
        })?;
        let volume_id = optional_volume_id(&volume.volume_id)?.context(
            InvalidParameters {
                reason: "Missing required field: volume_id",
            },
        )?;
        let slot = self.buses.slot(params.physical_id)?;
        let ctrlr = format!("sma-{}", params.physical_id);
        let bdev = volume_bdev(&self.spdk, &self.crypto, &volume_id).await?;

        let created = match self.controller(&ctrlr).await? {
            Some(controller) => {
                if controller.block_bdev() != Some(bdev.name.as_str()) {
                    return Inconsistent {
                        reason: format!(
                            "Controller {} exists with a different volume",
                            ctrlr
                        ),
                    }
                    .fail();
                }
                false
            }
            None => {
                info!(
                    "Creating vhost-blk controller {} on {}",
                    ctrlr, bdev.name
                );
                self.spdk
                    .vhost_create_blk_controller(&ctrlr, &bdev.name)
                    .await
                    .context(Rpc {
                        action: "create vhost-blk controller",
                    })?;
                true
            }
        };

        if let Err(error) = self.plug(&ctrlr, &slot).await {
            if created {
                let rollback = self.spdk.vhost_delete_controller(&ctrlr).await;
                if let Err(e) = rollback {
                    warn!("Failed to roll back {}: {}", ctrlr, e);
                }
            }
            return Err(error);
        }
        Ok(format!("{}:{}", Self::PREFIX, ctrlr))
    }

    async fn delete_device(&self, handle: &str) -> Result<(), DeviceError> {
        let ctrlr = handle_id(self, handle)?;
        let controller = self.controller(ctrlr).await?;
        let plugged = self.monitor.has_device(ctrlr).await.context(Qmp {
            action: "query PCI devices",
        })?;
        if controller.is_none() && !plugged {
            return DeviceNotFound {}.fail();
        }

        if plugged {
            info!("Removing {}", ctrlr);
            self.monitor.device_del(ctrlr, true).await.context(Qmp {
                action: "remove vhost-user-blk device",
            })?;
        }
        if let Err(error) = self.monitor.chardev_remove(ctrlr).await {
            warn!("Failed to remove chardev {}: {}", ctrlr, error);
        }
        if controller.is_some() {
            self.spdk
                .vhost_delete_controller(ctrlr)
                .await
                .context(Rpc {
                    action: "delete vhost controller",
                })?;
        }
        Ok(())
    }

    async fn set_qos(
        &self,
        request: &SetQosRequest,
    ) -> Result<(), DeviceError> {
        let ctrlr = handle_id(self, &request.device_handle)?;
        let controller =
            self.controller(ctrlr).await?.context(DeviceNotFound {})?;
        let bdev = controller.block_bdev().context(Inconsistent {
            reason: format!("Controller {} has no bdev", ctrlr),
        })?;
        if let Some(volume_id) = optional_volume_id(&request.volume_id)? {
            let volume =
                volume_bdev(&self.spdk, &self.crypto, &volume_id).await?;
            if volume.name != bdev {
                return NotAttached {}.fail();
            }
        }
        let maximum = request.maximum.clone().unwrap_or_else(QosLimit::default);
        set_volume_bdev_qos(&self.spdk, bdev, &maximum)
            .await
            .context(Qos {})
    }

    async fn get_qos_capabilities(
        &self,
    ) -> Result<GetQosCapabilitiesResponse, DeviceError> {
        Ok(GetQosCapabilitiesResponse {
            max_device_caps: Some(bdev_qos_capabilities()),
            max_volume_caps: Some(bdev_qos_capabilities()),
        })
    }
}
