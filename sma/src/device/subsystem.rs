//! NVMe-oF subsystem handling shared by the managers exposing volumes as
//! namespaces of a subsystem.

use rpc::sma::{QosLimit, SetQosRequest};
use snafu::{OptionExt, ResultExt};

use super::{
    optional_volume_id,
    volume_bdev,
    DeviceError,
    DeviceNotFound,
    InvalidVolumeId,
    NotAttached,
    Qos,
    Rpc,
};
use crate::{
    common::VolumeId,
    crypto::CryptoRegistry,
    qos::set_volume_bdev_qos,
    spdk::{ListenAddress, NamespaceParams, Spdk, Subsystem},
};

pub(crate) async fn find(
    spdk: &Spdk,
    nqn: &str,
) -> Result<Option<Subsystem>, DeviceError> {
    spdk.nvmf_get_subsystem(nqn).await.context(Rpc {
        action: "get subsystems",
    })
}

pub(crate) async fn get(
    spdk: &Spdk,
    nqn: &str,
) -> Result<Subsystem, DeviceError> {
    find(spdk, nqn).await?.context(DeviceNotFound {})
}

/// Create an empty subsystem.
pub(crate) async fn create(
    spdk: &Spdk,
    nqn: &str,
    allow_any_host: bool,
) -> Result<Subsystem, DeviceError> {
    info!("Creating subsystem {}", nqn);
    spdk.nvmf_create_subsystem(nqn, allow_any_host)
        .await
        .context(Rpc {
            action: "create subsystem",
        })?;
    Ok(Subsystem {
        nqn: nqn.to_string(),
        allow_any_host,
        hosts: Vec::new(),
        listen_addresses: Vec::new(),
        namespaces: Vec::new(),
    })
}

pub(crate) async fn delete(spdk: &Spdk, nqn: &str) -> Result<(), DeviceError> {
    info!("Deleting subsystem {}", nqn);
    spdk.nvmf_delete_subsystem(nqn).await.context(Rpc {
        action: "delete subsystem",
    })
}

/// Make sure the subsystem listens on `address`. Listeners of the same
/// transport type on other addresses are removed when `exclusive`.
pub(crate) async fn reconcile_listener(
    spdk: &Spdk,
    subsystem: &Subsystem,
    address: &ListenAddress,
    exclusive: bool,
) -> Result<(), DeviceError> {
    if exclusive {
        let stale = subsystem.listen_addresses.iter().filter(|l| {
            l.trtype.eq_ignore_ascii_case(&address.trtype)
                && !l.matches(address)
        });
        for stale in stale {
            debug!("Removing listener {:?} from {}", stale, subsystem.nqn);
            spdk.nvmf_subsystem_remove_listener(&subsystem.nqn, stale)
                .await
                .context(Rpc {
                    action: "remove listener",
                })?;
        }
    }
    if !subsystem.listen_addresses.iter().any(|l| l.matches(address)) {
        debug!("Adding listener {:?} to {}", address, subsystem.nqn);
        spdk.nvmf_subsystem_add_listener(&subsystem.nqn, address)
            .await
            .context(Rpc {
                action: "add listener",
            })?;
    }
    Ok(())
}

/// Add the volume as a namespace unless it is one already. Namespaces of
/// devices emulating a local controller carry the volume's identifiers.
pub(crate) async fn attach(
    spdk: &Spdk,
    crypto: &CryptoRegistry,
    subsystem: &Subsystem,
    volume_id: &VolumeId,
    with_ids: bool,
) -> Result<(), DeviceError> {
    let bdev = volume_bdev(spdk, crypto, volume_id).await?;
    if subsystem.namespace(&bdev.name).is_some() {
        return Ok(());
    }
    let namespace = NamespaceParams {
        bdev_name: bdev.name,
        uuid: with_ids.then(|| volume_id.to_string()),
        nguid: with_ids.then(|| volume_id.nguid()),
    };
    let nsid = spdk
        .nvmf_subsystem_add_ns(&subsystem.nqn, namespace)
        .await
        .context(Rpc {
            action: "attach volume",
        })?;
    info!(
        "Attached volume {} to {} as namespace {}",
        volume_id, subsystem.nqn, nsid
    );
    Ok(())
}

/// Remove the volume's namespace. Volumes that are gone or were never
/// attached are ignored.
pub(crate) async fn detach(
    spdk: &Spdk,
    crypto: &CryptoRegistry,
    subsystem: &Subsystem,
    volume_id: &VolumeId,
) -> Result<(), DeviceError> {
    let bdev = match volume_bdev(spdk, crypto, volume_id).await {
        Ok(bdev) => bdev,
        Err(DeviceError::VolumeNotFound {
            ..
        }) => {
            info!("Tried to detach unknown volume {}", volume_id);
            return Ok(());
        }
        Err(error) => return Err(error),
    };
    let Some(namespace) = subsystem.namespace(&bdev.name) else {
        return Ok(());
    };
    spdk.nvmf_subsystem_remove_ns(&subsystem.nqn, namespace.nsid)
        .await
        .context(Rpc {
            action: "detach volume",
        })?;
    info!("Detached volume {} from {}", volume_id, subsystem.nqn);
    Ok(())
}

/// Limit a volume exposed through the subsystem.
pub(crate) async fn set_qos(
    spdk: &Spdk,
    crypto: &CryptoRegistry,
    nqn: &str,
    request: &SetQosRequest,
) -> Result<(), DeviceError> {
    let volume_id =
        optional_volume_id(&request.volume_id)?.context(InvalidVolumeId {})?;
    let subsystem = get(spdk, nqn).await?;
    let bdev = volume_bdev(spdk, crypto, &volume_id).await?;
    if subsystem.namespace(&bdev.name).is_none() {
        return NotAttached {}.fail();
    }
    let maximum = request.maximum.clone().unwrap_or_else(QosLimit::default);
    set_volume_bdev_qos(spdk, &volume_id.to_string(), &maximum)
        .await
        .context(Qos {})
}
