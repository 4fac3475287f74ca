//! gRPC bindings of the storage management agent.

pub mod sma {
    // dont export the raw pb generated code
    mod pb {
        include!(concat!(env!("OUT_DIR"), "/sma.rs"));
    }

    pub use pb::{
        create_device_request,
        get_qos_capabilities_response,
        nvmf_volume_parameters,
        storage_management_agent_client,
        storage_management_agent_server::{
            StorageManagementAgent,
            StorageManagementAgentServer,
        },
        volume_crypto_parameters,
        volume_parameters,
        AttachVolumeRequest,
        AttachVolumeResponse,
        CreateDeviceRequest,
        CreateDeviceResponse,
        DeleteDeviceRequest,
        DeleteDeviceResponse,
        DetachVolumeRequest,
        DetachVolumeResponse,
        DeviceType,
        GetQosCapabilitiesRequest,
        GetQosCapabilitiesResponse,
        NvmeParameters,
        NvmfAddress,
        NvmfDiscoveryParameters,
        NvmfTcpParameters,
        NvmfVolumeParameters,
        QosLimit,
        SetQosRequest,
        SetQosResponse,
        VirtioBlkParameters,
        VolumeCryptoParameters,
        VolumeParameters,
    };

    pub use get_qos_capabilities_response::QosCapabilities;
    pub use volume_crypto_parameters::{Cipher, TweakMode};
}
