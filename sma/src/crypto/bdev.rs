use async_trait::async_trait;
use serde_json::Value;
use snafu::ResultExt;

use super::{CryptoEngine, CryptoError, CryptoParams, Rpc};
use crate::{
    common::VolumeId,
    spdk::{Bdev, CryptoCreate, Spdk},
};

/// Encrypts volumes with a crypto bdev of the storage engine stacked on top
/// of the volume's bdev.
#[derive(Debug)]
pub struct BdevCryptoEngine {
    spdk: Spdk,
    driver: String,
}

impl BdevCryptoEngine {
    pub const NAME: &'static str = "bdev_crypto";

    pub fn new(spdk: Spdk, driver: &str) -> Self {
        Self {
            spdk,
            driver: driver.to_string(),
        }
    }

    /// Find the crypto bdev whose base bdev is the volume.
    async fn find_crypto_bdev(
        &self,
        volume_id: &VolumeId,
    ) -> Result<Option<Bdev>, CryptoError> {
        let bdevs = self.spdk.bdev_get_bdevs().await.context(Rpc {
            action: "list bdevs",
        })?;
        let volume = volume_id.to_string();
        let is_volume = |name: &str| {
            bdevs.iter().any(|b| {
                b.name == name && (b.uuid == volume || b.name == volume)
            })
        };
        Ok(bdevs
            .iter()
            .filter(|b| b.product_name == "crypto")
            .find(|b| base_bdev_name(b).map(is_volume).unwrap_or(false))
            .cloned())
    }
}

fn crypto_params(bdev: &Bdev) -> Option<&Value> {
    bdev.driver_specific.get("crypto")
}

fn base_bdev_name(bdev: &Bdev) -> Option<&str> {
    crypto_params(bdev)?.get("base_bdev_name")?.as_str()
}

fn field_eq(params: &Value, field: &str, expected: Option<&str>) -> bool {
    let actual = params.get(field).and_then(Value::as_str);
    match (actual, expected) {
        (Some(actual), Some(expected)) => actual.eq_ignore_ascii_case(expected),
        (None, None) => true,
        _ => false,
    }
}

#[async_trait]
impl CryptoEngine for BdevCryptoEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn setup(
        &self,
        volume_id: &VolumeId,
        params: &CryptoParams,
    ) -> Result<(), CryptoError> {
        let create = CryptoCreate {
            base_bdev_name: volume_id.to_string(),
            name: uuid::Uuid::new_v4().to_string(),
            crypto_pmd: self.driver.clone(),
            key: params.key.clone(),
            cipher: params.cipher_name().to_string(),
            key2: params.key2.clone(),
            tweak_mode: params.tweak_mode_name().map(String::from),
        };
        info!(
            "Creating crypto bdev {} on volume {}",
            create.name, volume_id
        );
        self.spdk.bdev_crypto_create(create).await.context(Rpc {
            action: "setup crypto",
        })?;
        Ok(())
    }

    async fn cleanup(&self, volume_id: &VolumeId) -> Result<(), CryptoError> {
        let Some(bdev) = self.find_crypto_bdev(volume_id).await? else {
            return Ok(());
        };
        info!("Deleting crypto bdev {} of volume {}", bdev.name, volume_id);
        self.spdk
            .bdev_crypto_delete(&bdev.name)
            .await
            .context(Rpc {
                action: "delete crypto bdev",
            })
    }

    async fn verify(
        &self,
        volume_id: &VolumeId,
        params: Option<&CryptoParams>,
    ) -> Result<(), CryptoError> {
        let bdev = self.find_crypto_bdev(volume_id).await?;
        let (bdev, params) = match (bdev, params) {
            (None, None) => return Ok(()),
            (Some(bdev), Some(params)) => (bdev, params),
            _ => {
                return Err(CryptoError::InvalidConfiguration {
                    reason: "encryption mismatch".to_string(),
                })
            }
        };
        let live = crypto_params(&bdev).cloned().unwrap_or_default();
        let mismatch = if !field_eq(&live, "cipher", Some(params.cipher_name()))
        {
            Some("cipher")
        } else if !field_eq(&live, "key", Some(&params.key)) {
            Some("key")
        } else if !field_eq(&live, "key2", params.key2.as_deref()) {
            Some("key2")
        } else {
            None
        };
        match mismatch {
            Some(field) => Err(CryptoError::InvalidConfiguration {
                reason: format!("{} mismatch", field),
            }),
            None => Ok(()),
        }
    }

    async fn get_crypto_bdev(
        &self,
        volume_id: &VolumeId,
    ) -> Result<Option<String>, CryptoError> {
        Ok(self.find_crypto_bdev(volume_id).await?.map(|b| b.name))
    }
}
