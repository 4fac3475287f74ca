use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use rpc::sma::{
    create_device_request::Params,
    CreateDeviceRequest,
    GetQosCapabilitiesResponse,
    SetQosRequest,
};
use serde_json::json;
use snafu::ResultExt;

use super::{
    handle_id,
    optional_volume_id,
    pci::{PciBuses, PciDeviceConfig, PciSlot},
    subsystem,
    DeviceError,
    DeviceManager,
    DeviceProtocol,
    InvalidParameters,
    Qmp,
    Rpc,
    SocketPath,
};
use crate::{
    common::VolumeId,
    crypto::CryptoRegistry,
    qos::bdev_qos_capabilities,
    spdk::{ListenAddress, Spdk, Subsystem},
    vm::VmMonitor,
};

const TRANSPORT: &str = "vfiouser";
const NQN_PREFIX: &str = "nqn.2016-06.io.spdk:";

/// Exposes volumes as namespaces of an emulated NVMe controller plugged into
/// the VM over vfio-user.
pub struct VfioUserDeviceManager {
    spdk: Spdk,
    crypto: Arc<CryptoRegistry>,
    monitor: Arc<dyn VmMonitor>,
    buses: PciBuses,
    sock_path: PathBuf,
}

impl VfioUserDeviceManager {
    pub const NAME: &'static str = "vfiouser";
    const PREFIX: &'static str = "vfiouser";

    pub async fn new(
        spdk: Spdk,
        crypto: Arc<CryptoRegistry>,
        monitor: Arc<dyn VmMonitor>,
        config: &PciDeviceConfig,
    ) -> Result<Self, DeviceError> {
        let buses = PciBuses::new(&config.buses)?;
        spdk.ensure_transport(TRANSPORT).await.context(Rpc {
            action: "create vfiouser transport",
        })?;
        Ok(Self {
            spdk,
            crypto,
            monitor,
            buses,
            sock_path: config.sock_path.clone(),
        })
    }

    /// Socket directory of a device.
    fn device_path(&self, device_id: &str) -> PathBuf {
        self.sock_path.join(device_id)
    }

    async fn configure(
        &self,
        subsystem: &Subsystem,
        device_id: &str,
        path: &Path,
        slot: &PciSlot,
        volume_id: Option<&VolumeId>,
    ) -> Result<(), DeviceError> {
        let address = ListenAddress {
            trtype: TRANSPORT.to_string(),
            adrfam: None,
            traddr: path.to_string_lossy().into_owned(),
            trsvcid: None,
        };
        subsystem::reconcile_listener(&self.spdk, subsystem, &address, false)
            .await?;

        if let Some(volume_id) = volume_id {
            subsystem::attach(
                &self.spdk,
                &self.crypto,
                subsystem,
                volume_id,
                true,
            )
            .await?;
        }

        let plugged = self.monitor.has_device(device_id).await.context(Qmp {
            action: "query PCI devices",
        })?;
        if plugged {
            return Ok(());
        }
        info!(
            "Adding {} on bus {} at {}",
            device_id,
            slot.bus,
            slot.addr_hex()
        );
        self.monitor
            .device_add(json!({
                "driver": "vfio-user-pci",
                "x-enable-migration": "on",
                "socket": path.join("cntrl").to_string_lossy(),
                "bus": slot.bus,
                "addr": slot.addr_hex(),
                "id": device_id,
            }))
            .await
            .context(Qmp {
                action: "add vfio-user device",
            })
    }
}

async fn remove_socket_dir(path: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), error);
        }
    }
}

#[async_trait]
impl DeviceManager for VfioUserDeviceManager {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn protocol(&self) -> DeviceProtocol {
        DeviceProtocol::Nvme
    }

    fn prefix(&self) -> &str {
        Self::PREFIX
    }

    async fn create_device(
        &self,
        request: &CreateDeviceRequest,
    ) -> Result<String, DeviceError> {
        let Some(Params::Nvme(params)) = &request.params else {
            return InvalidParameters {
                reason: "missing nvme parameters",
            }
            .fail();
        };
        if params.virtual_id != 0 {
            return InvalidParameters {
                reason: "Unsupported virtual_id value",
            }
            .fail();
        }
        let slot = self.buses.slot(params.physical_id)?;
        let volume_id = match &request.volume {
            Some(volume) => optional_volume_id(&volume.volume_id)?,
            None => None,
        };

        let device_id = format!("vfiouser-{}", params.physical_id);
        let nqn = format!("{}{}", NQN_PREFIX, device_id);
        let path = self.device_path(&device_id);

        let (subsystem, created) =
            match subsystem::find(&self.spdk, &nqn).await? {
                Some(subsystem) => (subsystem, false),
                None => {
                    tokio::fs::create_dir_all(&path).await.context(
                        SocketPath {
                            path: &path,
                        },
                    )?;
                    match subsystem::create(&self.spdk, &nqn, true).await {
                        Ok(subsystem) => (subsystem, true),
                        Err(error) => {
                            remove_socket_dir(&path).await;
                            return Err(error);
                        }
                    }
                }
            };

        let result = self
            .configure(&subsystem, &device_id, &path, &slot, volume_id.as_ref())
            .await;
        if let Err(error) = result {
            if created {
                if let Err(e) = subsystem::delete(&self.spdk, &nqn).await {
                    warn!("Failed to roll back {}: {}", nqn, e);
                }
                remove_socket_dir(&path).await;
            }
            return Err(error);
        }
        Ok(format!("{}:{}", Self::PREFIX, nqn))
    }

    async fn delete_device(&self, handle: &str) -> Result<(), DeviceError> {
        let nqn = handle_id(self, handle)?;
        subsystem::get(&self.spdk, nqn).await?;
        let device_id = nqn.strip_prefix(NQN_PREFIX).unwrap_or(nqn);

        let plugged = self.monitor.has_device(device_id).await.context(Qmp {
            action: "query PCI devices",
        })?;
        if plugged {
            info!("Removing {}", device_id);
            self.monitor.device_del(device_id, true).await.context(Qmp {
                action: "remove vfio-user device",
            })?;
        }
        subsystem::delete(&self.spdk, nqn).await?;
        remove_socket_dir(&self.device_path(device_id)).await;
        Ok(())
    }

    async fn attach_volume(
        &self,
        handle: &str,
        volume_id: &VolumeId,
    ) -> Result<(), DeviceError> {
        let nqn = handle_id(self, handle)?;
        let subsystem = subsystem::get(&self.spdk, nqn).await?;
        subsystem::attach(&self.spdk, &self.crypto, &subsystem, volume_id, true)
            .await
    }

    async fn detach_volume(
        &self,
        handle: &str,
        volume_id: &VolumeId,
    ) -> Result<(), DeviceError> {
        let nqn = handle_id(self, handle)?;
        let subsystem = subsystem::get(&self.spdk, nqn).await?;
        subsystem::detach(&self.spdk, &self.crypto, &subsystem, volume_id).await
    }

    async fn set_qos(
        &self,
        request: &SetQosRequest,
    ) -> Result<(), DeviceError> {
        let nqn = handle_id(self, &request.device_handle)?;
        subsystem::set_qos(&self.spdk, &self.crypto, nqn, request).await
    }

    async fn get_qos_capabilities(
        &self,
    ) -> Result<GetQosCapabilitiesResponse, DeviceError> {
        Ok(GetQosCapabilitiesResponse {
            max_device_caps: None,
            max_volume_caps: Some(bdev_qos_capabilities()),
        })
    }
}
