//! Device managers expose connected volumes to their consumers. Each manager
//! handles one protocol and owns the device handles carrying its prefix.

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use rpc::sma::{
    create_device_request,
    CreateDeviceRequest,
    DeviceType,
    GetQosCapabilitiesResponse,
    SetQosRequest,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tonic::{Code, Status};

use crate::{
    common::VolumeId,
    config::DeviceConfig,
    crypto::{CryptoError, CryptoRegistry},
    qos::QosError,
    spdk::{Bdev, Spdk},
    vm::{QmpMonitor, VmMonitor, QMP_TIMEOUT},
};

mod nvmf_tcp;
pub mod pci;
mod subsystem;
mod vfiouser;
mod vhost_blk;

pub use nvmf_tcp::NvmfTcpDeviceManager;
pub use vfiouser::VfioUserDeviceManager;
pub use vhost_blk::VhostBlkDeviceManager;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum DeviceError {
    #[snafu(display("Unsupported device type"))]
    UnsupportedDeviceType {},
    #[snafu(display("Invalid device manager: {}", name))]
    UnknownManager {
        name: String,
    },
    #[snafu(display("Device manager {} configured more than once", name))]
    DuplicateManager {
        name: String,
    },
    #[snafu(display("Invalid device handle"))]
    InvalidHandle {},
    #[snafu(display("Invalid device parameters: {}", reason))]
    InvalidParameters {
        reason: String,
    },
    #[snafu(display("Invalid volume ID"))]
    InvalidVolumeId {},
    #[snafu(display("No device associated with device handle could be found"))]
    DeviceNotFound {},
    #[snafu(display("Invalid volume ID: {}", volume_id))]
    VolumeNotFound {
        volume_id: VolumeId,
    },
    #[snafu(display("Specified volume is not attached to the device"))]
    NotAttached {},
    #[snafu(display("Method is unsupported"))]
    Unimplemented {},
    #[snafu(display("{} transport is unavailable", transport))]
    TransportUnavailable {
        transport: String,
    },
    #[snafu(display("{}", reason))]
    Inconsistent {
        reason: String,
    },
    #[snafu(display("Failed to {}: {}", action, source))]
    Rpc {
        source: jsonrpc::error::Error,
        action: String,
    },
    #[snafu(display("Failed to {}: {}", action, source))]
    Qmp {
        source: qmp::Error,
        action: String,
    },
    #[snafu(display("Failed to prepare {}: {}", path.display(), source))]
    SocketPath {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("{}", source))]
    Crypto {
        source: CryptoError,
    },
    #[snafu(display("{}", source))]
    Qos {
        source: QosError,
    },
}

impl DeviceError {
    pub fn code(&self) -> Code {
        match self {
            Self::UnsupportedDeviceType {}
            | Self::UnknownManager {
                ..
            }
            | Self::DuplicateManager {
                ..
            }
            | Self::InvalidHandle {}
            | Self::InvalidParameters {
                ..
            }
            | Self::InvalidVolumeId {}
            | Self::NotAttached {} => Code::InvalidArgument,
            Self::DeviceNotFound {}
            | Self::VolumeNotFound {
                ..
            } => Code::NotFound,
            Self::Unimplemented {} => Code::Unimplemented,
            Self::Crypto {
                source,
            } => source.code(),
            Self::Qos {
                source,
            } => source.code(),
            _ => Code::Internal,
        }
    }
}

impl From<DeviceError> for Status {
    fn from(e: DeviceError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}

/// Protocol through which a device exposes its volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceProtocol {
    NvmfTcp,
    Nvme,
    VirtioBlk,
}

impl DeviceProtocol {
    /// Protocol of the devices created with the given parameters.
    pub fn of_params(params: &create_device_request::Params) -> Self {
        match params {
            create_device_request::Params::Nvme(_) => Self::Nvme,
            create_device_request::Params::VirtioBlk(_) => Self::VirtioBlk,
            create_device_request::Params::NvmfTcp(_) => Self::NvmfTcp,
        }
    }
}

impl TryFrom<DeviceType> for DeviceProtocol {
    type Error = DeviceError;

    fn try_from(device_type: DeviceType) -> Result<Self, Self::Error> {
        match device_type {
            DeviceType::Nvme => Ok(Self::Nvme),
            DeviceType::VirtioBlk => Ok(Self::VirtioBlk),
            DeviceType::NvmfTcp => Ok(Self::NvmfTcp),
            DeviceType::Invalid => UnsupportedDeviceType {}.fail(),
        }
    }
}

impl fmt::Display for DeviceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NvmfTcp => "nvmf_tcp",
            Self::Nvme => "nvme",
            Self::VirtioBlk => "virtio_blk",
        };
        write!(f, "{}", name)
    }
}

/// Protocol specific handling of devices.
///
/// Operations a manager does not support fail with `Unimplemented`.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Name under which the manager is configured.
    fn name(&self) -> &str;

    fn protocol(&self) -> DeviceProtocol;

    /// Prefix of the handles of the devices created by this manager.
    fn prefix(&self) -> &str;

    /// Whether a device may be deleted while volumes are attached to it.
    fn allow_delete_volumes(&self) -> bool {
        false
    }

    fn owns_device(&self, handle: &str) -> bool {
        handle
            .split_once(':')
            .map(|(prefix, _)| prefix == self.prefix())
            .unwrap_or(false)
    }

    /// Create the device, or reconfigure it if it exists already, and
    /// return its handle.
    async fn create_device(
        &self,
        _request: &CreateDeviceRequest,
    ) -> Result<String, DeviceError> {
        Unimplemented {}.fail()
    }

    async fn delete_device(&self, _handle: &str) -> Result<(), DeviceError> {
        Unimplemented {}.fail()
    }

    async fn attach_volume(
        &self,
        _handle: &str,
        _volume_id: &VolumeId,
    ) -> Result<(), DeviceError> {
        Unimplemented {}.fail()
    }

    async fn detach_volume(
        &self,
        _handle: &str,
        _volume_id: &VolumeId,
    ) -> Result<(), DeviceError> {
        Unimplemented {}.fail()
    }

    async fn set_qos(
        &self,
        _request: &SetQosRequest,
    ) -> Result<(), DeviceError> {
        Unimplemented {}.fail()
    }

    async fn get_qos_capabilities(
        &self,
    ) -> Result<GetQosCapabilitiesResponse, DeviceError> {
        Unimplemented {}.fail()
    }
}

/// The part of a handle following the manager's prefix.
pub(crate) fn handle_id<'a>(
    manager: &dyn DeviceManager,
    handle: &'a str,
) -> Result<&'a str, DeviceError> {
    match handle.split_once(':') {
        Some((prefix, id)) if prefix == manager.prefix() && !id.is_empty() => {
            Ok(id)
        }
        _ => InvalidHandle {}.fail(),
    }
}

/// Decode the volume id of a request, an empty id is `None`.
pub(crate) fn optional_volume_id(
    bytes: &[u8],
) -> Result<Option<VolumeId>, DeviceError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    VolumeId::from_bytes(bytes)
        .context(InvalidVolumeId {})
        .map(Some)
}

/// The bdev to expose for a volume, its crypto bdev if it is encrypted.
pub(crate) async fn volume_bdev(
    spdk: &Spdk,
    crypto: &CryptoRegistry,
    volume_id: &VolumeId,
) -> Result<Bdev, DeviceError> {
    let name = crypto.volume_bdev(volume_id).await.context(Crypto {})?;
    spdk.find_bdev(&name, None)
        .await
        .context(Rpc {
            action: "look up bdev",
        })?
        .context(VolumeNotFound {
            volume_id: *volume_id,
        })
}

/// The configured device managers.
#[derive(Default)]
pub struct DeviceManagers {
    managers: Vec<Arc<dyn DeviceManager>>,
}

impl fmt::Debug for DeviceManagers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.managers.iter().map(|m| m.name()))
            .finish()
    }
}

impl DeviceManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        manager: Arc<dyn DeviceManager>,
    ) -> Result<(), DeviceError> {
        if self.managers.iter().any(|m| m.name() == manager.name()) {
            return DuplicateManager {
                name: manager.name(),
            }
            .fail();
        }
        info!(
            "Registered device manager {} for protocol {}",
            manager.name(),
            manager.protocol()
        );
        self.managers.push(manager);
        Ok(())
    }

    /// Manager owning the device identified by `handle`.
    pub fn by_handle(&self, handle: &str) -> Option<Arc<dyn DeviceManager>> {
        self.managers.iter().find(|m| m.owns_device(handle)).cloned()
    }

    pub fn by_protocol(
        &self,
        protocol: DeviceProtocol,
    ) -> Option<Arc<dyn DeviceManager>> {
        self.managers
            .iter()
            .find(|m| m.protocol() == protocol)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

/// Build the device managers listed in the configuration.
pub async fn init_managers(
    configs: &[DeviceConfig],
    spdk: &Spdk,
    crypto: &Arc<CryptoRegistry>,
) -> Result<DeviceManagers, DeviceError> {
    let mut managers = DeviceManagers::new();
    for config in configs {
        let params = config.params.clone().unwrap_or_default();
        let manager: Arc<dyn DeviceManager> = match config.name.as_str() {
            NvmfTcpDeviceManager::NAME => Arc::new(
                NvmfTcpDeviceManager::new(spdk.clone(), crypto.clone()).await,
            ),
            VfioUserDeviceManager::NAME => {
                let monitor = qmp_monitor(&params)?;
                Arc::new(
                    VfioUserDeviceManager::new(
                        spdk.clone(),
                        crypto.clone(),
                        monitor,
                        &params,
                    )
                    .await?,
                )
            }
            VhostBlkDeviceManager::NAME => {
                let monitor = qmp_monitor(&params)?;
                Arc::new(VhostBlkDeviceManager::new(
                    spdk.clone(),
                    crypto.clone(),
                    monitor,
                    &params,
                )?)
            }
            name => {
                return UnknownManager {
                    name,
                }
                .fail()
            }
        };
        managers.register(manager)?;
    }
    Ok(managers)
}

fn qmp_monitor(
    params: &pci::PciDeviceConfig,
) -> Result<Arc<dyn VmMonitor>, DeviceError> {
    let address = params.qmp_address()?;
    Ok(Arc::new(QmpMonitor::new(address, QMP_TIMEOUT)))
}
