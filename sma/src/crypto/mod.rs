//! Volume encryption. Encryption is provided by a crypto engine stacking a
//! wrapper bdev on top of the volume's bdev; the active engine is selected by
//! name when the agent starts.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use rpc::sma::{Cipher, TweakMode, VolumeCryptoParameters};
use snafu::Snafu;
use tonic::{Code, Status};

use crate::{common::VolumeId, spdk::Spdk};

mod bdev;

pub use bdev::BdevCryptoEngine;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CryptoError {
    #[snafu(display("Crypto is disabled"))]
    Disabled {},
    #[snafu(display("Invalid volume crypto configuration: {}", reason))]
    InvalidConfiguration {
        reason: String,
    },
    #[snafu(display("Corrupted crypto key"))]
    CorruptedKey {},
    #[snafu(display("Invalid crypto engine: {}", name))]
    UnknownEngine {
        name: String,
    },
    #[snafu(display("Crypto driver must be configured for {}", engine))]
    MissingDriver {
        engine: String,
    },
    #[snafu(display("Failed to {}: {}", action, source))]
    Rpc {
        source: jsonrpc::error::Error,
        action: String,
    },
}

impl CryptoError {
    pub fn code(&self) -> Code {
        match self {
            Self::Rpc {
                ..
            } => Code::Internal,
            _ => Code::InvalidArgument,
        }
    }
}

impl From<CryptoError> for Status {
    fn from(e: CryptoError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}

/// Decoded encryption parameters of a volume.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoParams {
    pub cipher: Cipher,
    pub key: String,
    pub key2: Option<String>,
    pub tweak_mode: TweakMode,
}

// keys stay out of the logs
impl fmt::Debug for CryptoParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoParams")
            .field("cipher", &self.cipher)
            .field("key2", &self.key2.is_some())
            .field("tweak_mode", &self.tweak_mode)
            .finish_non_exhaustive()
    }
}

impl CryptoParams {
    /// Cipher name as understood by the storage engine.
    pub fn cipher_name(&self) -> &'static str {
        self.cipher.as_str_name()
    }

    /// Tweak mode as understood by the storage engine, e.g.
    /// `INCR_512_FULL_LBA`. The engine's default `SIMPLE_LBA` is not sent.
    pub fn tweak_mode_name(&self) -> Option<&'static str> {
        match self.tweak_mode {
            TweakMode::SimpleLba => None,
            mode => {
                let name = mode.as_str_name();
                Some(name.strip_prefix("TWEAK_MODE_").unwrap_or(name))
            }
        }
    }
}

fn ascii_key(key: &[u8]) -> Result<String, CryptoError> {
    if !key.is_ascii() {
        return Err(CryptoError::CorruptedKey {});
    }
    String::from_utf8(key.to_vec()).map_err(|_| CryptoError::CorruptedKey {})
}

impl TryFrom<&VolumeCryptoParameters> for CryptoParams {
    type Error = CryptoError;

    fn try_from(params: &VolumeCryptoParameters) -> Result<Self, Self::Error> {
        let cipher = Cipher::try_from(params.cipher).map_err(|_| {
            CryptoError::InvalidConfiguration {
                reason: format!("bad cipher {}", params.cipher),
            }
        })?;
        let tweak_mode = TweakMode::try_from(params.tweak_mode).map_err(|_| {
            CryptoError::InvalidConfiguration {
                reason: format!("bad tweak mode {}", params.tweak_mode),
            }
        })?;
        let key2 = if params.key2.is_empty() {
            None
        } else {
            Some(ascii_key(&params.key2)?)
        };
        Ok(Self {
            cipher,
            key: ascii_key(&params.key)?,
            key2,
            tweak_mode,
        })
    }
}

/// Strategy providing encryption for volumes.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Enable encryption on top of the volume's bdev.
    async fn setup(
        &self,
        volume_id: &VolumeId,
        params: &CryptoParams,
    ) -> Result<(), CryptoError>;

    /// Remove encryption from the volume, if there is any.
    async fn cleanup(&self, volume_id: &VolumeId) -> Result<(), CryptoError>;

    /// Check that the live configuration of the volume matches `params`,
    /// `None` meaning the volume is expected to be unencrypted.
    async fn verify(
        &self,
        volume_id: &VolumeId,
        params: Option<&CryptoParams>,
    ) -> Result<(), CryptoError>;

    /// Name of the bdev encrypting the volume, if any.
    async fn get_crypto_bdev(
        &self,
        volume_id: &VolumeId,
    ) -> Result<Option<String>, CryptoError>;
}

/// Engine used when encryption is not configured.
#[derive(Debug, Default)]
pub struct NopCryptoEngine {}

#[async_trait]
impl CryptoEngine for NopCryptoEngine {
    fn name(&self) -> &str {
        "nop"
    }

    async fn setup(
        &self,
        _volume_id: &VolumeId,
        _params: &CryptoParams,
    ) -> Result<(), CryptoError> {
        Err(CryptoError::Disabled {})
    }

    async fn cleanup(&self, _volume_id: &VolumeId) -> Result<(), CryptoError> {
        Ok(())
    }

    async fn verify(
        &self,
        _volume_id: &VolumeId,
        _params: Option<&CryptoParams>,
    ) -> Result<(), CryptoError> {
        Ok(())
    }

    async fn get_crypto_bdev(
        &self,
        _volume_id: &VolumeId,
    ) -> Result<Option<String>, CryptoError> {
        Ok(None)
    }
}

/// Registered crypto engines and the one currently active. Shared by the
/// volume manager and all device managers.
pub struct CryptoRegistry {
    engines: RwLock<HashMap<String, Arc<dyn CryptoEngine>>>,
    active: RwLock<Arc<dyn CryptoEngine>>,
}

impl fmt::Debug for dyn CryptoEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("name", &self.name())
            .finish()
    }
}

impl fmt::Debug for CryptoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoRegistry")
            .field("active", &self.active.read().name())
            .finish()
    }
}

impl Default for CryptoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoRegistry {
    /// Registry with only the no-op engine, which is also active.
    pub fn new() -> Self {
        let nop: Arc<dyn CryptoEngine> = Arc::new(NopCryptoEngine::default());
        let mut engines = HashMap::new();
        engines.insert(nop.name().to_string(), nop.clone());
        Self {
            engines: RwLock::new(engines),
            active: RwLock::new(nop),
        }
    }

    pub fn register(&self, engine: Arc<dyn CryptoEngine>) {
        debug!("Registering crypto engine {}", engine.name());
        self.engines.write().insert(engine.name().to_string(), engine);
    }

    /// Make the engine registered as `name` the active one.
    pub fn set_crypto_engine(&self, name: &str) -> Result<(), CryptoError> {
        let engine = self.engines.read().get(name).cloned().ok_or_else(|| {
            CryptoError::UnknownEngine {
                name: name.to_string(),
            }
        })?;
        info!("Using crypto engine {}", name);
        *self.active.write() = engine;
        Ok(())
    }

    pub fn engine(&self) -> Arc<dyn CryptoEngine> {
        self.active.read().clone()
    }

    /// Bdev to expose for the volume: its crypto wrapper if the volume is
    /// encrypted, the volume's own bdev otherwise.
    pub async fn volume_bdev(
        &self,
        volume_id: &VolumeId,
    ) -> Result<String, CryptoError> {
        let engine = self.engine();
        Ok(engine
            .get_crypto_bdev(volume_id)
            .await?
            .unwrap_or_else(|| volume_id.to_string()))
    }
}

/// Build the engine called `name`. `driver` is the crypto driver used by
/// engines backed by the storage engine's crypto bdev.
pub fn build_engine(
    name: &str,
    driver: Option<&str>,
    spdk: &Spdk,
) -> Result<Arc<dyn CryptoEngine>, CryptoError> {
    match name {
        "nop" => Ok(Arc::new(NopCryptoEngine::default())),
        BdevCryptoEngine::NAME => {
            let driver = driver.ok_or_else(|| CryptoError::MissingDriver {
                engine: name.to_string(),
            })?;
            Ok(Arc::new(BdevCryptoEngine::new(spdk.clone(), driver)))
        }
        _ => Err(CryptoError::UnknownEngine {
            name: name.to_string(),
        }),
    }
}
