//! Dispatch of the agent's operations between the volume manager and the
//! device managers. Volumes connected on behalf of a request that fails are
//! disconnected again before the error is returned.

use std::sync::Arc;

use rpc::sma::{
    AttachVolumeRequest,
    CreateDeviceRequest,
    CreateDeviceResponse,
    DeleteDeviceRequest,
    DetachVolumeRequest,
    DeviceType,
    GetQosCapabilitiesRequest,
    GetQosCapabilitiesResponse,
    SetQosRequest,
};
use tonic::Status;

use crate::{
    common::VolumeId,
    device::{DeviceManager, DeviceManagers, DeviceProtocol},
    volume::VolumeManager,
};

fn unsupported_device_type() -> Status {
    Status::invalid_argument("Unsupported device type")
}

fn invalid_handle() -> Status {
    Status::not_found("Invalid device handle")
}

#[derive(Debug)]
pub struct Agent {
    volumes: Arc<VolumeManager>,
    devices: DeviceManagers,
}

impl Agent {
    pub fn new(volumes: Arc<VolumeManager>, devices: DeviceManagers) -> Self {
        Self {
            volumes,
            devices,
        }
    }

    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volumes
    }

    fn manager_by_handle(
        &self,
        handle: &str,
    ) -> Result<Arc<dyn DeviceManager>, Status> {
        self.devices.by_handle(handle).ok_or_else(invalid_handle)
    }

    /// Disconnect a volume connected for a request that failed.
    async fn rollback(&self, volume_id: &VolumeId, existing: bool) {
        if !existing {
            debug!("Disconnecting volume {} after failure", volume_id);
            self.volumes.disconnect_volume(volume_id).await;
        }
    }

    pub async fn create_device(
        &self,
        request: CreateDeviceRequest,
    ) -> Result<CreateDeviceResponse, Status> {
        let params = request
            .params
            .as_ref()
            .ok_or_else(unsupported_device_type)?;
        let manager = self
            .devices
            .by_protocol(DeviceProtocol::of_params(params))
            .ok_or_else(unsupported_device_type)?;

        let connected = match &request.volume {
            Some(volume) => {
                Some(self.volumes.connect_volume(volume, None).await?)
            }
            None => None,
        };

        let result = async {
            let handle = manager.create_device(&request).await?;
            if let Some((volume_id, _)) = &connected {
                self.volumes.set_device(volume_id, &handle).await?;
            }
            Ok::<_, Status>(handle)
        }
        .await;

        match result {
            Ok(handle) => {
                info!("Created device {}", handle);
                Ok(CreateDeviceResponse {
                    handle,
                })
            }
            Err(status) => {
                if let Some((volume_id, existing)) = &connected {
                    self.rollback(volume_id, *existing).await;
                }
                Err(status)
            }
        }
    }

    pub async fn delete_device(
        &self,
        request: DeleteDeviceRequest,
    ) -> Result<(), Status> {
        let manager = self.manager_by_handle(&request.handle)?;
        if !manager.allow_delete_volumes()
            && self.volumes.has_volumes(&request.handle).await
        {
            return Err(Status::failed_precondition(
                "Device has attached volumes",
            ));
        }
        manager.delete_device(&request.handle).await?;
        self.volumes.disconnect_device_volumes(&request.handle).await;
        info!("Deleted device {}", request.handle);
        Ok(())
    }

    pub async fn attach_volume(
        &self,
        request: AttachVolumeRequest,
    ) -> Result<(), Status> {
        let volume = request.volume.as_ref().ok_or_else(|| {
            Status::invalid_argument("Missing required field: volume")
        })?;
        let manager = self.manager_by_handle(&request.device_handle)?;
        let (volume_id, existing) = self
            .volumes
            .connect_volume(volume, Some(&request.device_handle))
            .await?;

        let result = manager
            .attach_volume(&request.device_handle, &volume_id)
            .await;
        if let Err(error) = result {
            self.rollback(&volume_id, existing).await;
            return Err(error.into());
        }
        info!("Attached volume {} to {}", volume_id, request.device_handle);
        Ok(())
    }

    pub async fn detach_volume(
        &self,
        request: DetachVolumeRequest,
    ) -> Result<(), Status> {
        let volume_id = VolumeId::from_bytes(&request.volume_id)
            .ok_or_else(|| Status::invalid_argument("Invalid volume ID"))?;
        if let Some(manager) = self.devices.by_handle(&request.device_handle) {
            manager
                .detach_volume(&request.device_handle, &volume_id)
                .await?;
        }
        self.volumes.disconnect_volume(&volume_id).await;
        info!("Detached volume {} from {}", volume_id, request.device_handle);
        Ok(())
    }

    pub async fn set_qos(&self, request: SetQosRequest) -> Result<(), Status> {
        let manager = self.manager_by_handle(&request.device_handle)?;
        manager.set_qos(&request).await?;
        Ok(())
    }

    pub async fn get_qos_capabilities(
        &self,
        request: GetQosCapabilitiesRequest,
    ) -> Result<GetQosCapabilitiesResponse, Status> {
        let device_type = DeviceType::try_from(request.device_type)
            .map_err(|_| unsupported_device_type())?;
        let protocol = DeviceProtocol::try_from(device_type)?;
        let manager = self
            .devices
            .by_protocol(protocol)
            .ok_or_else(unsupported_device_type)?;
        Ok(manager.get_qos_capabilities().await?)
    }
}
