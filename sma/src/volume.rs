//! Tracking of the volumes connected to the agent.
//!
//! A volume becomes visible to the storage engine either because it is local
//! or because a discovery service attached the remote NVMe-oF subsystem
//! exposing it. Discovery services are shared between volumes and reference
//! counted, the last volume using a service stops it. All state lives behind
//! one lock which is also taken by the periodic sweep that forgets volumes
//! whose bdev vanished from the engine.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use rpc::sma::{nvmf_volume_parameters, volume_parameters, VolumeParameters};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tonic::{Code, Status};

use crate::{
    common::VolumeId,
    crypto::{CryptoError, CryptoParams, CryptoRegistry},
    spdk::{self, Spdk, TransportId},
};

/// How long to wait for the bdev of a volume to show up, in milliseconds.
const BDEV_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum VolumeError {
    #[snafu(display("Invalid volume ID"))]
    InvalidVolumeId {},
    #[snafu(display("Invalid traddr {}", traddr))]
    InvalidTraddr {
        traddr: String,
    },
    #[snafu(display(
        "Volume {} is already attached to a different device",
        volume_id
    ))]
    AlreadyAttached {
        volume_id: VolumeId,
    },
    #[snafu(display("Volume {} couldn't be found", volume_id))]
    VolumeNotFound {
        volume_id: VolumeId,
    },
    #[snafu(display(
        "Unexpected subsystem NQN of volume {}: {}",
        volume_id,
        subnqn
    ))]
    UnexpectedSubnqn {
        volume_id: VolumeId,
        subnqn: String,
    },
    #[snafu(display("Failed to retrieve discovery service status: {}", source))]
    DiscoveryInfo {
        source: jsonrpc::error::Error,
    },
    #[snafu(display("Failed to start discovery: {}", source))]
    StartDiscovery {
        source: jsonrpc::error::Error,
    },
    #[snafu(display("Failed to stop discovery {}: {}", name, source))]
    StopDiscovery {
        source: jsonrpc::error::Error,
        name: String,
    },
    #[snafu(display("Failed to look up volume {}: {}", volume_id, source))]
    FindBdev {
        source: jsonrpc::error::Error,
        volume_id: VolumeId,
    },
    #[snafu(display("{}", source))]
    Crypto {
        source: CryptoError,
    },
    #[snafu(display("Volume cleanup is already running"))]
    AlreadyStarted {},
}

impl VolumeError {
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidVolumeId {}
            | Self::InvalidTraddr {
                ..
            }
            | Self::UnexpectedSubnqn {
                ..
            } => Code::InvalidArgument,
            Self::AlreadyAttached {
                ..
            } => Code::AlreadyExists,
            Self::VolumeNotFound {
                ..
            } => Code::NotFound,
            Self::Crypto {
                source,
            } => source.code(),
            _ => Code::Internal,
        }
    }
}

impl From<VolumeError> for Status {
    fn from(e: VolumeError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}

/// A connected volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Device the volume is attached to.
    pub device_handle: Option<String>,
    /// Discovery services holding a reference on behalf of this volume.
    pub discovery_services: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    /// Discovery services started by the agent and their reference counts.
    discovery: HashMap<String, u32>,
    volumes: HashMap<VolumeId, Volume>,
}

type Cleanup = (oneshot::Sender<()>, JoinHandle<()>);

pub struct VolumeManager {
    spdk: Spdk,
    crypto: Arc<CryptoRegistry>,
    discovery_timeout: Duration,
    cleanup_period: Duration,
    state: Mutex<State>,
    cleanup: parking_lot::Mutex<Option<Cleanup>>,
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("discovery_timeout", &self.discovery_timeout)
            .field("cleanup_period", &self.cleanup_period)
            .finish()
    }
}

/// Address family of a transport address.
pub fn adrfam(traddr: &str) -> Result<&'static str, VolumeError> {
    match traddr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok("ipv4"),
        Ok(IpAddr::V6(_)) => Ok("ipv6"),
        Err(_) => InvalidTraddr {
            traddr,
        }
        .fail(),
    }
}

impl VolumeManager {
    pub fn new(
        spdk: Spdk,
        crypto: Arc<CryptoRegistry>,
        discovery_timeout: Duration,
        cleanup_period: Duration,
    ) -> Self {
        Self {
            spdk,
            crypto,
            discovery_timeout,
            cleanup_period,
            state: Mutex::new(State::default()),
            cleanup: parking_lot::Mutex::new(None),
        }
    }

    /// Make the volume described by `params` available and start tracking
    /// it. Returns the volume id and whether the volume was already tracked,
    /// in which case nothing was changed.
    pub async fn connect_volume(
        &self,
        params: &VolumeParameters,
        device_handle: Option<&str>,
    ) -> Result<(VolumeId, bool), VolumeError> {
        let volume_id = VolumeId::from_bytes(&params.volume_id)
            .context(InvalidVolumeId {})?;
        let crypto = params
            .crypto
            .as_ref()
            .map(CryptoParams::try_from)
            .transpose()
            .context(Crypto {})?;

        let mut state = self.state.lock().await;
        if let Some(volume) = state.volumes.get(&volume_id) {
            if let Some(handle) = device_handle {
                if volume.device_handle.as_deref() != Some(handle) {
                    return AlreadyAttached {
                        volume_id,
                    }
                    .fail();
                }
            }
            self.crypto
                .engine()
                .verify(&volume_id, crypto.as_ref())
                .await
                .context(Crypto {})?;
            return Ok((volume_id, true));
        }

        let mut services = BTreeSet::new();
        let result = self
            .connect_locked(
                &mut state,
                &volume_id,
                params,
                crypto.as_ref(),
                &mut services,
            )
            .await;

        if let Err(error) = result {
            for name in &services {
                if let Err(e) = self.stop_discovery(&mut state, name).await {
                    warn!("Failed to roll back volume {}: {}", volume_id, e);
                }
            }
            return Err(error);
        }

        info!("Connected volume {}", volume_id);
        state.volumes.insert(
            volume_id,
            Volume {
                volume_id,
                device_handle: device_handle.map(String::from),
                discovery_services: services,
            },
        );
        Ok((volume_id, false))
    }

    async fn connect_locked(
        &self,
        state: &mut State,
        volume_id: &VolumeId,
        params: &VolumeParameters,
        crypto: Option<&CryptoParams>,
        services: &mut BTreeSet<String>,
    ) -> Result<(), VolumeError> {
        let nvmf = match &params.connection_params {
            Some(volume_parameters::ConnectionParams::Nvmf(nvmf)) => Some(nvmf),
            None => None,
        };

        if let Some(nvmf_volume_parameters::ConnectionParams::Discovery(
            discovery,
        )) = nvmf.and_then(|n| n.connection_params.as_ref())
        {
            let hostnqn = nvmf
                .map(|n| n.hostnqn.clone())
                .filter(|nqn| !nqn.is_empty());
            for endpoint in &discovery.discovery_endpoints {
                let trid = TransportId {
                    trtype: endpoint.trtype.clone(),
                    adrfam: adrfam(&endpoint.traddr)?.to_string(),
                    traddr: endpoint.traddr.clone(),
                    trsvcid: endpoint.trsvcid.clone(),
                    subnqn: String::new(),
                };
                self.discover(state, &trid, hostnqn.clone(), services)
                    .await?;
            }
        }

        let bdev = self
            .spdk
            .find_bdev(&volume_id.to_string(), Some(BDEV_TIMEOUT_MS))
            .await
            .context(FindBdev {
                volume_id: *volume_id,
            })?
            .context(VolumeNotFound {
                volume_id: *volume_id,
            })?;

        if let Some(nvmf) = nvmf.filter(|n| !n.subnqn.is_empty()) {
            if bdev.nvme_subnqn() != Some(nvmf.subnqn.as_str()) {
                return UnexpectedSubnqn {
                    volume_id: *volume_id,
                    subnqn: bdev.nvme_subnqn().unwrap_or_default(),
                }
                .fail();
            }
        }

        if let Some(crypto) = crypto {
            self.crypto
                .engine()
                .setup(volume_id, crypto)
                .await
                .context(Crypto {})?;
        }
        Ok(())
    }

    /// Take a reference on a discovery service reaching `trid`, starting a
    /// new one if none does.
    async fn discover(
        &self,
        state: &mut State,
        trid: &TransportId,
        hostnqn: Option<String>,
        services: &mut BTreeSet<String>,
    ) -> Result<(), VolumeError> {
        let infos = self
            .spdk
            .bdev_nvme_get_discovery_info()
            .await
            .context(DiscoveryInfo {})?;

        if let Some(info) = infos.iter().find(|info| info.reaches(trid)) {
            if services.contains(&info.name) {
                return Ok(());
            }
            if !state.discovery.contains_key(&info.name) {
                warn!(
                    "Adopting discovery service {} not started by the agent",
                    info.name
                );
            }
            *state.discovery.entry(info.name.clone()).or_default() += 1;
            services.insert(info.name.clone());
            return Ok(());
        }

        let name = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting discovery service {} for {}:{}",
            name, trid.traddr, trid.trsvcid
        );
        self.spdk
            .bdev_nvme_start_discovery(spdk::StartDiscovery {
                name: name.clone(),
                trtype: trid.trtype.clone(),
                traddr: trid.traddr.clone(),
                trsvcid: trid.trsvcid.clone(),
                adrfam: trid.adrfam.clone(),
                hostnqn,
                wait_for_attach: true,
                attach_timeout_ms: self.discovery_timeout.as_millis() as u64,
            })
            .await
            .context(StartDiscovery {})?;
        state.discovery.insert(name.clone(), 1);
        services.insert(name);
        Ok(())
    }

    /// Drop a reference to a discovery service, stopping it with the last.
    async fn stop_discovery(
        &self,
        state: &mut State,
        name: &str,
    ) -> Result<(), VolumeError> {
        let Some(refcount) = state.discovery.get_mut(name) else {
            warn!("Unknown discovery service {}", name);
            return Ok(());
        };
        if *refcount > 1 {
            *refcount -= 1;
            return Ok(());
        }
        // forgotten even if stopping fails
        state.discovery.remove(name);
        self.spdk
            .bdev_nvme_stop_discovery(name)
            .await
            .context(StopDiscovery {
                name,
            })?;
        info!("Stopped discovery service {}", name);
        Ok(())
    }

    async fn disconnect_locked(&self, state: &mut State, volume_id: &VolumeId) {
        let Some(volume) = state.volumes.get(volume_id).cloned() else {
            return;
        };
        if let Err(error) = self.crypto.engine().cleanup(volume_id).await {
            warn!("Failed to clean up crypto of {}: {}", volume_id, error);
        }
        for name in &volume.discovery_services {
            if let Err(error) = self.stop_discovery(state, name).await {
                warn!("Failed to disconnect {}: {}", volume_id, error);
            }
        }
        state.volumes.remove(volume_id);
        info!("Disconnected volume {}", volume_id);
    }

    /// Stop tracking a volume, releasing everything acquired to connect it.
    /// Untracked volumes are ignored.
    pub async fn disconnect_volume(&self, volume_id: &VolumeId) {
        let mut state = self.state.lock().await;
        self.disconnect_locked(&mut state, volume_id).await;
    }

    /// Record that a connected volume is attached to `device_handle`.
    pub async fn set_device(
        &self,
        volume_id: &VolumeId,
        device_handle: &str,
    ) -> Result<(), VolumeError> {
        let mut state = self.state.lock().await;
        let volume = state.volumes.get_mut(volume_id).context(
            VolumeNotFound {
                volume_id: *volume_id,
            },
        )?;
        match volume.device_handle.as_deref() {
            Some(handle) if handle != device_handle => AlreadyAttached {
                volume_id: *volume_id,
            }
            .fail(),
            _ => {
                volume.device_handle = Some(device_handle.to_string());
                Ok(())
            }
        }
    }

    /// Disconnect all volumes attached to a device.
    pub async fn disconnect_device_volumes(&self, device_handle: &str) {
        let mut state = self.state.lock().await;
        let attached = state
            .volumes
            .values()
            .filter(|v| v.device_handle.as_deref() == Some(device_handle))
            .map(|v| v.volume_id)
            .collect::<Vec<_>>();
        for volume_id in attached {
            self.disconnect_locked(&mut state, &volume_id).await;
        }
    }

    pub async fn has_volumes(&self, device_handle: &str) -> bool {
        let state = self.state.lock().await;
        state
            .volumes
            .values()
            .any(|v| v.device_handle.as_deref() == Some(device_handle))
    }

    pub async fn volume(&self, volume_id: &VolumeId) -> Option<Volume> {
        self.state.lock().await.volumes.get(volume_id).cloned()
    }

    pub async fn volumes(&self) -> Vec<Volume> {
        self.state.lock().await.volumes.values().cloned().collect()
    }

    /// References held on a discovery service started by the agent.
    pub async fn discovery_refcount(&self, name: &str) -> Option<u32> {
        self.state.lock().await.discovery.get(name).copied()
    }

    /// Disconnect the volumes whose bdev is gone from the storage engine.
    /// Returns how many were disconnected.
    pub async fn sweep(&self) -> usize {
        let mut state = self.state.lock().await;
        let bdevs = match self.spdk.bdev_get_bdevs().await {
            Ok(bdevs) => bdevs,
            Err(error) => {
                error!("Failed to retrieve bdevs: {}", error);
                return 0;
            }
        };
        let live = bdevs
            .iter()
            .map(|b| b.uuid.to_lowercase())
            .collect::<HashSet<_>>();
        let stale = state
            .volumes
            .keys()
            .filter(|id| !live.contains(&id.to_string()))
            .copied()
            .collect::<Vec<_>>();
        for volume_id in &stale {
            warn!("Found disconnected volume: {}", volume_id);
            self.disconnect_locked(&mut state, volume_id).await;
        }
        stale.len()
    }

    /// Start sweeping periodically in the background, until `stop`.
    pub fn start(self: &Arc<Self>) -> Result<(), VolumeError> {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return AlreadyStarted {}.fail();
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let manager = Arc::downgrade(self);
        let period = self.cleanup_period;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.sweep().await;
                    }
                }
            }
            debug!("Volume cleanup stopped");
        });
        *cleanup = Some((stop_tx, handle));
        Ok(())
    }

    /// Stop the background sweep and wait for it to finish.
    pub async fn stop(&self) {
        let cleanup = self.cleanup.lock().take();
        let Some((stop, handle)) = cleanup else {
            return;
        };
        // the task may already be gone if the manager was being dropped
        let _ = stop.send(());
        if let Err(error) = handle.await {
            error!("Volume cleanup task failed: {}", error);
        }
    }
}
