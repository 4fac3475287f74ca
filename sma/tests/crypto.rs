use assert_matches::assert_matches;
use rpc::sma::{
    create_device_request::Params,
    AttachVolumeRequest,
    Cipher,
    CreateDeviceRequest,
    DeleteDeviceRequest,
    NvmfTcpParameters,
    TweakMode,
    VirtioBlkParameters,
    VolumeCryptoParameters,
    VolumeParameters,
};
use sma::{crypto::CryptoError, volume::VolumeError};
use tonic::Code;

pub mod common;
use common::*;

const DRIVER: &str = "crypto_aesni_mb";
const KEY: &str = "0123456789abcdef0123456789abcdef";
const KEY2: &str = "fedcba9876543210fedcba9876543210";
const SUBNQN: &str = "nqn.2016-06.io.spdk:crypto";

fn crypto(cipher: Cipher, key: &str, key2: &str) -> VolumeCryptoParameters {
    VolumeCryptoParameters {
        key: key.as_bytes().to_vec(),
        key2: key2.as_bytes().to_vec(),
        cipher: cipher as i32,
        tweak_mode: TweakMode::Incr512FullLba as i32,
    }
}

fn encrypted(volume: &str) -> VolumeParameters {
    VolumeParameters {
        crypto: Some(crypto(Cipher::AesXts, KEY, KEY2)),
        ..local_volume(volume)
    }
}

fn assert_mismatch(err: VolumeError) {
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_matches!(
        err,
        VolumeError::Crypto {
            source: CryptoError::InvalidConfiguration { .. }
        }
    );
}

#[tokio::test]
async fn setup_on_connect() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_bdev(local_bdev(VOLUME1));

    let (id, existing) = test
        .volumes
        .connect_volume(&encrypted(VOLUME1), None)
        .await
        .unwrap();
    assert_eq!(id, volume_id(VOLUME1));
    assert!(!existing);

    let bdev = test.spdk.crypto_bdev(VOLUME1).unwrap();
    let live = &bdev.driver_specific["crypto"];
    assert_eq!(live["crypto_pmd"], DRIVER);
    assert_eq!(live["cipher"], "AES_XTS");
    assert_eq!(live["key"], KEY);
    assert_eq!(live["key2"], KEY2);
    assert_eq!(live["tweak_mode"], "INCR_512_FULL_LBA");
}

#[tokio::test]
async fn simple_lba_is_not_sent() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_bdev(local_bdev(VOLUME1));
    let mut params = encrypted(VOLUME1);
    if let Some(crypto) = params.crypto.as_mut() {
        crypto.tweak_mode = TweakMode::SimpleLba as i32;
        crypto.key2.clear();
    }

    test.volumes.connect_volume(&params, None).await.unwrap();
    let bdev = test.spdk.crypto_bdev(VOLUME1).unwrap();
    assert!(bdev.driver_specific["crypto"]["tweak_mode"].is_null());
    assert!(bdev.driver_specific["crypto"]["key2"].is_null());
}

#[tokio::test]
async fn crypto_disabled() {
    let test = TestAgent::new().await;
    test.spdk.add_bdev(local_bdev(VOLUME1));

    let err = test
        .volumes
        .connect_volume(&encrypted(VOLUME1), None)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        VolumeError::Crypto {
            source: CryptoError::Disabled {}
        }
    );
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(test.volumes.volume(&volume_id(VOLUME1)).await.is_none());
}

#[tokio::test]
async fn corrupted_key() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_bdev(local_bdev(VOLUME1));
    let mut params = encrypted(VOLUME1);
    if let Some(crypto) = params.crypto.as_mut() {
        crypto.key = vec![0xff, 0xfe];
    }

    let err = test.volumes.connect_volume(&params, None).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(test.spdk.calls("bdev_crypto_create"), 0);
}

#[tokio::test]
async fn verify_on_reconnect() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_bdev(local_bdev(VOLUME1));
    test.spdk.add_bdev(local_bdev(VOLUME2));
    let volumes = &test.volumes;

    volumes
        .connect_volume(&encrypted(VOLUME1), None)
        .await
        .unwrap();
    let (_, existing) = volumes
        .connect_volume(&encrypted(VOLUME1), None)
        .await
        .unwrap();
    assert!(existing);

    // keys are compared regardless of case
    let params = VolumeParameters {
        crypto: Some(crypto(
            Cipher::AesXts,
            &KEY.to_uppercase(),
            &KEY2.to_uppercase(),
        )),
        ..local_volume(VOLUME1)
    };
    volumes.connect_volume(&params, None).await.unwrap();

    let mismatches = [
        crypto(Cipher::AesCbc, KEY, KEY2),
        crypto(Cipher::AesXts, KEY2, KEY2),
        crypto(Cipher::AesXts, KEY, KEY),
        crypto(Cipher::AesXts, KEY, ""),
    ];
    for mismatch in mismatches {
        let params = VolumeParameters {
            crypto: Some(mismatch),
            ..local_volume(VOLUME1)
        };
        assert_mismatch(
            volumes.connect_volume(&params, None).await.unwrap_err(),
        );
    }

    // encrypted volume requested without encryption
    assert_mismatch(
        volumes
            .connect_volume(&local_volume(VOLUME1), None)
            .await
            .unwrap_err(),
    );

    // and the other way around
    volumes
        .connect_volume(&local_volume(VOLUME2), None)
        .await
        .unwrap();
    assert_mismatch(
        volumes
            .connect_volume(&encrypted(VOLUME2), None)
            .await
            .unwrap_err(),
    );

    // failed checks leave the volumes alone
    assert!(volumes.volume(&volume_id(VOLUME1)).await.is_some());
    assert!(volumes.volume(&volume_id(VOLUME2)).await.is_some());
    assert_eq!(test.spdk.calls("bdev_crypto_create"), 1);
    assert!(test.spdk.crypto_bdev(VOLUME2).is_none());
}

#[tokio::test]
async fn cleanup_on_disconnect() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_bdev(local_bdev(VOLUME1));
    test.spdk.add_bdev(local_bdev(VOLUME2));

    test.volumes
        .connect_volume(&encrypted(VOLUME1), None)
        .await
        .unwrap();
    test.volumes.disconnect_volume(&volume_id(VOLUME1)).await;
    assert!(test.spdk.crypto_bdev(VOLUME1).is_none());
    assert_eq!(test.spdk.calls("bdev_crypto_delete"), 1);

    // a failed cleanup doesn't keep the volume around
    test.volumes
        .connect_volume(&encrypted(VOLUME2), None)
        .await
        .unwrap();
    test.spdk.fail("bdev_crypto_delete");
    test.volumes.disconnect_volume(&volume_id(VOLUME2)).await;
    assert!(test.volumes.volume(&volume_id(VOLUME2)).await.is_none());
    assert!(test.spdk.crypto_bdev(VOLUME2).is_some());
}

#[tokio::test]
async fn failed_setup_stops_discovery() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_target(
        "10.0.0.1",
        "8009",
        vec![nvme_bdev(VOLUME1, TARGET_NQN)],
    );
    let params = VolumeParameters {
        crypto: Some(crypto(Cipher::AesXts, KEY, KEY2)),
        ..discovered_volume(VOLUME1, "10.0.0.1", "8009", "")
    };

    test.spdk.fail("bdev_crypto_create");
    let err = test.volumes.connect_volume(&params, None).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(test.spdk.calls("bdev_nvme_stop_discovery"), 1);
    assert!(test.spdk.discovery_services().is_empty());
    assert!(test.volumes.volume(&volume_id(VOLUME1)).await.is_none());
}

fn nvmf_tcp(volume: VolumeParameters) -> CreateDeviceRequest {
    CreateDeviceRequest {
        volume: Some(volume),
        params: Some(Params::NvmfTcp(NvmfTcpParameters {
            subnqn: SUBNQN.to_string(),
            adrfam: "ipv4".to_string(),
            traddr: "127.0.0.1".to_string(),
            trsvcid: "4420".to_string(),
            allow_any_host: true,
            hosts: Vec::new(),
        })),
    }
}

#[tokio::test]
async fn subsystem_exposes_crypto_bdev() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_bdev(local_bdev(VOLUME1));
    test.spdk.add_bdev(local_bdev(VOLUME2));

    let handle = test
        .agent
        .create_device(nvmf_tcp(encrypted(VOLUME1)))
        .await
        .unwrap()
        .handle;
    test.agent
        .attach_volume(AttachVolumeRequest {
            volume: Some(encrypted(VOLUME2)),
            device_handle: handle.clone(),
        })
        .await
        .unwrap();

    let crypto1 = test.spdk.crypto_bdev(VOLUME1).unwrap();
    let crypto2 = test.spdk.crypto_bdev(VOLUME2).unwrap();
    let subsystem = test.spdk.subsystem(SUBNQN).unwrap();
    let names = subsystem
        .namespaces
        .iter()
        .map(|ns| ns.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec![crypto1.name.as_str(), crypto2.name.as_str()]);

    test.agent
        .delete_device(DeleteDeviceRequest {
            handle,
        })
        .await
        .unwrap();
    assert!(test.spdk.crypto_bdev(VOLUME1).is_none());
    assert!(test.spdk.crypto_bdev(VOLUME2).is_none());
}

#[tokio::test]
async fn vhost_blk_exposes_crypto_bdev() {
    let test = TestAgent::with_crypto(DRIVER).await;
    test.spdk.add_bdev(local_bdev(VOLUME1));

    let handle = test
        .agent
        .create_device(CreateDeviceRequest {
            volume: Some(encrypted(VOLUME1)),
            params: Some(Params::VirtioBlk(VirtioBlkParameters {
                physical_id: 2,
                virtual_id: 0,
            })),
        })
        .await
        .unwrap()
        .handle;

    let crypto = test.spdk.crypto_bdev(VOLUME1).unwrap();
    let controllers = test.spdk.with(|s| s.controllers.clone());
    assert_eq!(controllers.len(), 1);
    assert_eq!(controllers[0].block_bdev(), Some(crypto.name.as_str()));

    test.agent
        .delete_device(DeleteDeviceRequest {
            handle,
        })
        .await
        .unwrap();
    assert!(test.spdk.crypto_bdev(VOLUME1).is_none());
}
