//! Storage management agent: exposes volumes of the storage engine to virtual
//! machines and remote hosts as NVMe/TCP, NVMe/vfio-user or virtio-blk
//! devices, driven through a gRPC interface.

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate serde;
extern crate function_name;
extern crate serde_json;
extern crate snafu;

pub mod agent;
pub mod common;
pub mod config;
pub mod crypto;
pub mod device;
pub mod grpc;
pub mod logger;
pub mod qos;
pub mod spdk;
pub mod vm;
pub mod volume;
