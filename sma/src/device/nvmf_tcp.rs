use std::sync::Arc;

use async_trait::async_trait;
use rpc::sma::{
    create_device_request::Params,
    CreateDeviceRequest,
    GetQosCapabilitiesResponse,
    NvmfTcpParameters,
    SetQosRequest,
};
use snafu::ResultExt;

use super::{
    handle_id,
    optional_volume_id,
    subsystem,
    DeviceError,
    DeviceManager,
    DeviceProtocol,
    InvalidParameters,
    Rpc,
    TransportUnavailable,
};
use crate::{
    common::VolumeId,
    crypto::CryptoRegistry,
    qos::bdev_qos_capabilities,
    spdk::{ListenAddress, Spdk, Subsystem},
};

const TRANSPORT: &str = "tcp";

/// Exposes volumes as namespaces of NVMe-oF subsystems reachable over TCP.
pub struct NvmfTcpDeviceManager {
    spdk: Spdk,
    crypto: Arc<CryptoRegistry>,
    has_transport: bool,
}

impl NvmfTcpDeviceManager {
    pub const NAME: &'static str = "nvmf_tcp";
    const PREFIX: &'static str = "nvmf-tcp";

    /// Create the manager, creating the TCP transport if it is missing. A
    /// manager without a transport fails every operation.
    pub async fn new(spdk: Spdk, crypto: Arc<CryptoRegistry>) -> Self {
        let has_transport = match spdk.ensure_transport(TRANSPORT).await {
            Ok(()) => true,
            Err(error) => {
                error!("Failed to create NVMe/TCP transport: {}", error);
                false
            }
        };
        Self {
            spdk,
            crypto,
            has_transport,
        }
    }

    fn check_transport(&self) -> Result<(), DeviceError> {
        if self.has_transport {
            return Ok(());
        }
        TransportUnavailable {
            transport: "NVMe/TCP",
        }
        .fail()
    }

    async fn configure(
        &self,
        subsystem: &Subsystem,
        params: &NvmfTcpParameters,
        volume_id: Option<&VolumeId>,
    ) -> Result<(), DeviceError> {
        let nqn = &subsystem.nqn;
        if subsystem.allow_any_host != params.allow_any_host {
            self.spdk
                .nvmf_subsystem_allow_any_host(nqn, params.allow_any_host)
                .await
                .context(Rpc {
                    action: "set allow_any_host",
                })?;
        }

        for host in &params.hosts {
            if !subsystem.hosts.iter().any(|h| &h.nqn == host) {
                self.spdk
                    .nvmf_subsystem_add_host(nqn, host)
                    .await
                    .context(Rpc {
                        action: "add host",
                    })?;
            }
        }
        for host in &subsystem.hosts {
            if !params.hosts.contains(&host.nqn) {
                self.spdk
                    .nvmf_subsystem_remove_host(nqn, &host.nqn)
                    .await
                    .context(Rpc {
                        action: "remove host",
                    })?;
            }
        }

        let address = ListenAddress {
            trtype: TRANSPORT.to_string(),
            adrfam: Some(params.adrfam.clone()),
            traddr: params.traddr.clone(),
            trsvcid: Some(params.trsvcid.clone()),
        };
        subsystem::reconcile_listener(&self.spdk, subsystem, &address, true)
            .await?;

        if let Some(volume_id) = volume_id {
            subsystem::attach(
                &self.spdk,
                &self.crypto,
                subsystem,
                volume_id,
                false,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceManager for NvmfTcpDeviceManager {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn protocol(&self) -> DeviceProtocol {
        DeviceProtocol::NvmfTcp
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
        self.check_transport()?;
        let Some(Params::NvmfTcp(params)) = &request.params else {
            return InvalidParameters {
                reason: "missing nvmf_tcp parameters",
            }
            .fail();
        };
        let volume_id = match &request.volume {
            Some(volume) => optional_volume_id(&volume.volume_id)?,
            None => None,
        };

        let (subsystem, created) =
            match subsystem::find(&self.spdk, &params.subnqn).await? {
                Some(subsystem) => (subsystem, false),
                None => (
                    subsystem::create(&self.spdk, &params.subnqn, true).await?,
                    true,
                ),
            };

        let result = self
            .configure(&subsystem, params, volume_id.as_ref())
            .await;
        if let Err(error) = result {
            if created {
                let rollback =
                    subsystem::delete(&self.spdk, &params.subnqn).await;
                if let Err(e) = rollback {
                    warn!("Failed to roll back {}: {}", params.subnqn, e);
                }
            }
            return Err(error);
        }
        Ok(format!("{}:{}", Self::PREFIX, params.subnqn))
    }

    async fn delete_device(&self, handle: &str) -> Result<(), DeviceError> {
        self.check_transport()?;
        let nqn = handle_id(self, handle)?;
        subsystem::get(&self.spdk, nqn).await?;
        subsystem::delete(&self.spdk, nqn).await
    }

    async fn attach_volume(
        &self,
        handle: &str,
        volume_id: &VolumeId,
    ) -> Result<(), DeviceError> {
        self.check_transport()?;
        let nqn = handle_id(self, handle)?;
        let subsystem = subsystem::get(&self.spdk, nqn).await?;
        subsystem::attach(
            &self.spdk,
            &self.crypto,
            &subsystem,
            volume_id,
            false,
        )
        .await
    }

    async fn detach_volume(
        &self,
        handle: &str,
        volume_id: &VolumeId,
    ) -> Result<(), DeviceError> {
        self.check_transport()?;
        let nqn = handle_id(self, handle)?;
        let Some(subsystem) = subsystem::find(&self.spdk, nqn).await? else {
            info!("Tried to detach {} from unknown device {}", volume_id, nqn);
            return Ok(());
        };
        subsystem::detach(&self.spdk, &self.crypto, &subsystem, volume_id).await
    }

    async fn set_qos(
        &self,
        request: &SetQosRequest,
    ) -> Result<(), DeviceError> {
        self.check_transport()?;
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
