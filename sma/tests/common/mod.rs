//! In-memory stand-ins for the storage engine and the VM monitor.
//!
//! Panics and asserts are fine here, a misbehaving fake is a test bug.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use jsonrpc::error::{Error, RpcCode};
use parking_lot::Mutex;
use qmp::types::{ChardevInfo, PciDeviceInfo, PciInfo};
use rpc::sma::{
    nvmf_volume_parameters,
    volume_parameters,
    NvmfAddress,
    NvmfDiscoveryParameters,
    NvmfVolumeParameters,
    VolumeParameters,
};
use serde_json::{json, Value};

use sma::{
    agent::Agent,
    common::VolumeId,
    crypto::{BdevCryptoEngine, CryptoRegistry},
    device::{
        pci::{PciBridge, PciDeviceConfig},
        DeviceManagers,
        NvmfTcpDeviceManager,
        VfioUserDeviceManager,
        VhostBlkDeviceManager,
    },
    spdk::{
        Bdev,
        DiscoveryInfo,
        Host,
        ListenAddress,
        Namespace,
        RpcClient,
        RpcResult,
        Spdk,
        Subsystem,
        Transport,
        TransportId,
        VhostController,
    },
    volume::VolumeManager,
    vm::VmMonitor,
};

pub const VOLUME1: &str = "11111111-1111-1111-1111-111111111111";
pub const VOLUME2: &str = "22222222-2222-2222-2222-222222222222";
pub const TARGET_NQN: &str = "nqn.2016-06.io.spdk:target0";

pub fn volume_id(id: &str) -> VolumeId {
    id.parse().unwrap()
}

fn rpc_error(code: RpcCode, method: &str, msg: impl Into<String>) -> Error {
    Error::RpcError {
        code,
        msg: msg.into(),
        method: method.to_string(),
    }
}

fn param<'a>(params: &'a Option<Value>, field: &str) -> &'a Value {
    params
        .as_ref()
        .and_then(|p| p.get(field))
        .unwrap_or(&Value::Null)
}

fn str_param(params: &Option<Value>, field: &str) -> String {
    param(params, field).as_str().unwrap_or_default().to_string()
}

/// A bdev as exported by a remote subsystem.
pub fn nvme_bdev(volume: &str, subnqn: &str) -> Bdev {
    Bdev {
        name: format!("nvme-{}", &volume[.. 8]),
        uuid: volume.to_string(),
        product_name: "NVMe disk".to_string(),
        aliases: vec![volume.to_string()],
        driver_specific: json!({
            "nvme": [{ "trid": { "trtype": "TCP", "subnqn": subnqn } }],
        }),
    }
}

/// A bdev local to the storage engine, named after the volume.
pub fn local_bdev(volume: &str) -> Bdev {
    Bdev {
        name: volume.to_string(),
        uuid: volume.to_string(),
        product_name: "Malloc disk".to_string(),
        aliases: Vec::new(),
        driver_specific: Value::Null,
    }
}

/// Parameters of a volume local to the storage engine.
pub fn local_volume(volume: &str) -> VolumeParameters {
    VolumeParameters {
        volume_id: volume.as_bytes().to_vec(),
        connection_params: None,
        crypto: None,
    }
}

/// Parameters of a volume reached through the discovery endpoint at
/// `traddr:trsvcid`.
pub fn discovered_volume(
    volume: &str,
    traddr: &str,
    trsvcid: &str,
    subnqn: &str,
) -> VolumeParameters {
    let discovery = NvmfDiscoveryParameters {
        discovery_endpoints: vec![NvmfAddress {
            trtype: "tcp".to_string(),
            traddr: traddr.to_string(),
            trsvcid: trsvcid.to_string(),
        }],
    };
    VolumeParameters {
        volume_id: volume_id(volume).uuid().as_bytes().to_vec(),
        connection_params: Some(volume_parameters::ConnectionParams::Nvmf(
            NvmfVolumeParameters {
                subnqn: subnqn.to_string(),
                hostnqn: String::new(),
                connection_params: Some(
                    nvmf_volume_parameters::ConnectionParams::Discovery(
                        discovery,
                    ),
                ),
            },
        )),
        crypto: None,
    }
}

#[derive(Debug)]
struct Discovery {
    info: DiscoveryInfo,
    /// Names of the bdevs attached by the service.
    bdevs: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SpdkState {
    pub bdevs: Vec<Bdev>,
    pub transports: Vec<String>,
    pub subsystems: Vec<Subsystem>,
    discovery: Vec<Discovery>,
    /// Bdevs attached once a discovery service reaches `traddr:trsvcid`.
    targets: HashMap<String, Vec<Bdev>>,
    pub controllers: Vec<VhostController>,
    /// Parameters of every `bdev_set_qos_limit` call.
    pub qos: Vec<Value>,
    /// Methods failing with an internal error.
    pub failing: HashSet<String>,
    /// Every method called, in order.
    pub calls: Vec<String>,
    next_nsid: u32,
}

#[derive(Debug, Default)]
pub struct FakeSpdk {
    state: Mutex<SpdkState>,
}

impl FakeSpdk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spdk(self: &Arc<Self>) -> Spdk {
        Spdk::new(self.clone())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SpdkState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn add_bdev(&self, bdev: Bdev) {
        self.state.lock().bdevs.push(bdev);
    }

    pub fn remove_bdev(&self, name: &str) {
        self.state.lock().bdevs.retain(|b| b.name != name);
    }

    /// Make `bdevs` show up when a discovery service connects to
    /// `traddr:trsvcid`.
    pub fn add_target(&self, traddr: &str, trsvcid: &str, bdevs: Vec<Bdev>) {
        self.state
            .lock()
            .targets
            .insert(format!("{}:{}", traddr, trsvcid), bdevs);
    }

    pub fn fail(&self, method: &str) {
        self.state.lock().failing.insert(method.to_string());
    }

    pub fn heal(&self, method: &str) {
        self.state.lock().failing.remove(method);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|m| *m == method)
            .count()
    }

    pub fn discovery_services(&self) -> Vec<String> {
        self.state
            .lock()
            .discovery
            .iter()
            .map(|d| d.info.name.clone())
            .collect()
    }

    pub fn subsystem(&self, nqn: &str) -> Option<Subsystem> {
        let state = self.state.lock();
        state.subsystems.iter().find(|s| s.nqn == nqn).cloned()
    }

    pub fn has_bdev(&self, name: &str) -> bool {
        self.state.lock().bdevs.iter().any(|b| b.name == name)
    }

    /// The crypto bdev stacked on top of `volume`'s bdev.
    pub fn crypto_bdev(&self, volume: &str) -> Option<Bdev> {
        let state = self.state.lock();
        state
            .bdevs
            .iter()
            .find(|b| {
                b.product_name == "crypto"
                    && b.driver_specific["crypto"]["base_bdev_name"] == volume
            })
            .cloned()
    }

    pub fn last_qos(&self) -> Option<Value> {
        self.state.lock().qos.last().cloned()
    }
}

impl SpdkState {
    fn subsystem_mut(
        &mut self,
        method: &str,
        params: &Option<Value>,
    ) -> RpcResult<&mut Subsystem> {
        let nqn = str_param(params, "nqn");
        self.subsystems
            .iter_mut()
            .find(|s| s.nqn == nqn)
            .ok_or_else(|| {
                rpc_error(RpcCode::NotFound, method, "Unable to find subsystem")
            })
    }

    fn find_bdev(&self, name: &str) -> Option<&Bdev> {
        self.bdevs.iter().find(|b| {
            b.name == name
                || b.uuid == name
                || b.aliases.iter().any(|a| a == name)
        })
    }

    fn handle(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> RpcResult<Value> {
        match method {
            "bdev_get_bdevs" => match param(&params, "name").as_str() {
                Some(name) => match self.find_bdev(name) {
                    Some(bdev) => Ok(json!([bdev])),
                    None => Err(rpc_error(
                        RpcCode::NotFound,
                        method,
                        "No such device",
                    )),
                },
                None => Ok(json!(self.bdevs)),
            },
            "bdev_crypto_create" => {
                let name = str_param(&params, "name");
                let base = str_param(&params, "base_bdev_name");
                if self.find_bdev(&base).is_none() {
                    return Err(rpc_error(
                        RpcCode::NotFound,
                        method,
                        "No such device",
                    ));
                }
                self.bdevs.push(Bdev {
                    name: name.clone(),
                    uuid: uuid::Uuid::new_v4().to_string(),
                    product_name: "crypto".to_string(),
                    aliases: Vec::new(),
                    driver_specific: json!({
                        "crypto": {
                            "base_bdev_name": base,
                            "name": name,
                            "crypto_pmd": param(&params, "crypto_pmd"),
                            "key": param(&params, "key"),
                            "key2": param(&params, "key2"),
                            "cipher": param(&params, "cipher"),
                            "tweak_mode": param(&params, "tweak_mode"),
                        },
                    }),
                });
                Ok(json!(name))
            }
            "bdev_crypto_delete" => {
                let name = str_param(&params, "name");
                self.bdevs.retain(|b| b.name != name);
                Ok(json!(true))
            }
            "bdev_set_qos_limit" => {
                let name = str_param(&params, "name");
                if self.find_bdev(&name).is_none() {
                    return Err(rpc_error(
                        RpcCode::NotFound,
                        method,
                        "No such device",
                    ));
                }
                self.qos.push(params.unwrap_or_default());
                Ok(json!(true))
            }
            "nvmf_get_transports" => {
                let transports = self
                    .transports
                    .iter()
                    .map(|t| Transport {
                        trtype: t.to_uppercase(),
                    })
                    .collect::<Vec<_>>();
                Ok(json!(transports))
            }
            "nvmf_create_transport" => {
                self.transports.push(str_param(&params, "trtype"));
                Ok(json!(true))
            }
            "nvmf_get_subsystems" => Ok(json!(self.subsystems)),
            "nvmf_create_subsystem" => {
                let nqn = str_param(&params, "nqn");
                if self.subsystems.iter().any(|s| s.nqn == nqn) {
                    return Err(rpc_error(
                        RpcCode::InvalidParams,
                        method,
                        "Subsystem already exists",
                    ));
                }
                self.subsystems.push(Subsystem {
                    nqn,
                    allow_any_host: param(&params, "allow_any_host")
                        .as_bool()
                        .unwrap_or_default(),
                    hosts: Vec::new(),
                    listen_addresses: Vec::new(),
                    namespaces: Vec::new(),
                });
                Ok(json!(true))
            }
            "nvmf_delete_subsystem" => {
                self.subsystem_mut(method, &params)?;
                let nqn = str_param(&params, "nqn");
                self.subsystems.retain(|s| s.nqn != nqn);
                Ok(json!(true))
            }
            "nvmf_subsystem_allow_any_host" => {
                let allow = param(&params, "allow_any_host").as_bool();
                let subsystem = self.subsystem_mut(method, &params)?;
                subsystem.allow_any_host = allow.unwrap_or_default();
                Ok(json!(true))
            }
            "nvmf_subsystem_add_host" => {
                let host = str_param(&params, "host");
                let subsystem = self.subsystem_mut(method, &params)?;
                subsystem.hosts.push(Host {
                    nqn: host,
                });
                Ok(json!(true))
            }
            "nvmf_subsystem_remove_host" => {
                let host = str_param(&params, "host");
                let subsystem = self.subsystem_mut(method, &params)?;
                subsystem.hosts.retain(|h| h.nqn != host);
                Ok(json!(true))
            }
            "nvmf_subsystem_add_listener" => {
                let address: ListenAddress = serde_json::from_value(
                    param(&params, "listen_address").clone(),
                )?;
                let subsystem = self.subsystem_mut(method, &params)?;
                subsystem.listen_addresses.push(address);
                Ok(json!(true))
            }
            "nvmf_subsystem_remove_listener" => {
                let address: ListenAddress = serde_json::from_value(
                    param(&params, "listen_address").clone(),
                )?;
                let subsystem = self.subsystem_mut(method, &params)?;
                subsystem.listen_addresses.retain(|l| !l.matches(&address));
                Ok(json!(true))
            }
            "nvmf_subsystem_add_ns" => {
                let namespace = param(&params, "namespace").clone();
                let bdev_name = namespace
                    .get("bdev_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let Some(bdev) = self.find_bdev(&bdev_name) else {
                    return Err(rpc_error(
                        RpcCode::InvalidParams,
                        method,
                        "Unable to find bdev",
                    ));
                };
                let name = bdev.name.clone();
                self.next_nsid += 1;
                let nsid = self.next_nsid;
                let subsystem = self.subsystem_mut(method, &params)?;
                subsystem.namespaces.push(Namespace {
                    nsid,
                    name,
                });
                Ok(json!(nsid))
            }
            "nvmf_subsystem_remove_ns" => {
                let nsid = param(&params, "nsid").as_u64().unwrap_or_default();
                let subsystem = self.subsystem_mut(method, &params)?;
                subsystem.namespaces.retain(|ns| u64::from(ns.nsid) != nsid);
                Ok(json!(true))
            }
            "bdev_nvme_start_discovery" => {
                let name = str_param(&params, "name");
                let traddr = str_param(&params, "traddr");
                let trsvcid = str_param(&params, "trsvcid");
                if self.discovery.iter().any(|d| d.info.name == name) {
                    return Err(rpc_error(
                        RpcCode::AlreadyExists,
                        method,
                        "Discovery service already exists",
                    ));
                }
                let bdevs = self
                    .targets
                    .get(&format!("{}:{}", traddr, trsvcid))
                    .cloned()
                    .unwrap_or_default();
                let names = bdevs.iter().map(|b| b.name.clone()).collect();
                self.bdevs.extend(bdevs);
                self.discovery.push(Discovery {
                    info: DiscoveryInfo {
                        name,
                        trid: TransportId {
                            trtype: str_param(&params, "trtype")
                                .to_uppercase(),
                            adrfam: str_param(&params, "adrfam")
                                .to_uppercase(),
                            traddr,
                            trsvcid,
                            subnqn: "nqn.2014-08.org.nvmexpress.discovery"
                                .to_string(),
                        },
                        referrals: Vec::new(),
                    },
                    bdevs: names,
                });
                Ok(json!(true))
            }
            "bdev_nvme_stop_discovery" => {
                let name = str_param(&params, "name");
                let Some(index) =
                    self.discovery.iter().position(|d| d.info.name == name)
                else {
                    return Err(rpc_error(
                        RpcCode::NotFound,
                        method,
                        "Discovery service not found",
                    ));
                };
                let discovery = self.discovery.remove(index);
                self.bdevs.retain(|b| !discovery.bdevs.contains(&b.name));
                Ok(json!(true))
            }
            "bdev_nvme_get_discovery_info" => {
                let infos = self
                    .discovery
                    .iter()
                    .map(|d| d.info.clone())
                    .collect::<Vec<_>>();
                Ok(json!(infos))
            }
            "vhost_get_controllers" => Ok(json!(self.controllers)),
            "vhost_create_blk_controller" => {
                let ctrlr = str_param(&params, "ctrlr");
                let bdev = str_param(&params, "dev_name");
                if self.find_bdev(&bdev).is_none() {
                    return Err(rpc_error(
                        RpcCode::NotFound,
                        method,
                        "No such device",
                    ));
                }
                self.controllers.push(VhostController {
                    ctrlr,
                    backend_specific: json!({ "block": { "bdev": bdev } }),
                });
                Ok(json!(true))
            }
            "vhost_delete_controller" => {
                let ctrlr = str_param(&params, "ctrlr");
                self.controllers.retain(|c| c.ctrlr != ctrlr);
                Ok(json!(true))
            }
            _ => Err(rpc_error(
                RpcCode::MethodNotFound,
                method,
                "Method not found",
            )),
        }
    }
}

#[async_trait]
impl RpcClient for FakeSpdk {
    async fn call_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> RpcResult<Value> {
        let mut state = self.state.lock();
        state.calls.push(method.to_string());
        if state.failing.contains(method) {
            return Err(rpc_error(
                RpcCode::InternalError,
                method,
                "Injected failure",
            ));
        }
        state.handle(method, params)
    }
}

#[derive(Debug, Default)]
pub struct MonitorState {
    /// Arguments of the plugged devices, by qdev id.
    pub devices: HashMap<String, Value>,
    pub chardevs: HashMap<String, Value>,
    pub fail_device_add: bool,
}

#[derive(Debug, Default)]
pub struct FakeMonitor {
    state: Mutex<MonitorState>,
}

impl FakeMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn device(&self, id: &str) -> Option<Value> {
        self.state.lock().devices.get(id).cloned()
    }

    pub fn has_chardev(&self, id: &str) -> bool {
        self.state.lock().chardevs.contains_key(id)
    }
}

fn qmp_error(command: &str, desc: &str) -> qmp::Error {
    qmp::Error::Request {
        command: command.to_string(),
        class: "GenericError".to_string(),
        desc: desc.to_string(),
    }
}

#[async_trait]
impl VmMonitor for FakeMonitor {
    async fn query_pci(&self) -> Result<Vec<PciInfo>, qmp::Error> {
        let state = self.state.lock();
        let devices = state
            .devices
            .keys()
            .enumerate()
            .map(|(slot, id)| PciDeviceInfo {
                bus: 0,
                slot: slot as u32,
                function: 0,
                qdev_id: id.clone(),
                pci_bridge: None,
            })
            .collect();
        Ok(vec![PciInfo {
            bus: 0,
            devices,
        }])
    }

    async fn query_chardev(&self) -> Result<Vec<ChardevInfo>, qmp::Error> {
        let state = self.state.lock();
        Ok(state
            .chardevs
            .keys()
            .map(|label| ChardevInfo {
                label: label.clone(),
                filename: String::new(),
                frontend_open: false,
            })
            .collect())
    }

    async fn device_add(&self, arguments: Value) -> Result<(), qmp::Error> {
        let mut state = self.state.lock();
        if state.fail_device_add {
            return Err(qmp_error("device_add", "Injected failure"));
        }
        let id = arguments["id"].as_str().unwrap_or_default().to_string();
        if state.devices.contains_key(&id) {
            return Err(qmp_error("device_add", "Duplicate device ID"));
        }
        state.devices.insert(id, arguments);
        Ok(())
    }

    async fn device_del(
        &self,
        id: &str,
        _wait: bool,
    ) -> Result<(), qmp::Error> {
        match self.state.lock().devices.remove(id) {
            Some(_) => Ok(()),
            None => Err(qmp_error("device_del", "Device not found")),
        }
    }

    async fn chardev_add(
        &self,
        id: &str,
        backend: Value,
    ) -> Result<(), qmp::Error> {
        self.state.lock().chardevs.insert(id.to_string(), backend);
        Ok(())
    }

    async fn chardev_remove(&self, id: &str) -> Result<(), qmp::Error> {
        match self.state.lock().chardevs.remove(id) {
            Some(_) => Ok(()),
            None => Err(qmp_error("chardev-remove", "Chardev not found")),
        }
    }
}

/// Two bridges of 32 slots.
pub fn pci_config(sock_path: &Path) -> PciDeviceConfig {
    PciDeviceConfig {
        buses: vec![
            PciBridge {
                name: Some("pci.0".to_string()),
                count: 32,
            },
            PciBridge {
                name: Some("pci.1".to_string()),
                count: 32,
            },
        ],
        sock_path: sock_path.to_path_buf(),
        ..Default::default()
    }
}

/// Scratch directory removed when dropped.
pub struct TempDir(std::path::PathBuf);

impl TempDir {
    pub fn new(name: &str) -> Self {
        let path = std::env::temp_dir()
            .join(format!("sma-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// An agent wired to the fakes, with all device managers enabled.
pub struct TestAgent {
    pub spdk: Arc<FakeSpdk>,
    pub monitor: Arc<FakeMonitor>,
    pub volumes: Arc<VolumeManager>,
    pub agent: Arc<Agent>,
    pub dir: TempDir,
}

impl TestAgent {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Agent encrypting volumes with crypto bdevs using `driver`.
    pub async fn with_crypto(driver: &str) -> Self {
        Self::build(Some(driver)).await
    }

    async fn build(crypto_driver: Option<&str>) -> Self {
        let fake = FakeSpdk::new();
        let monitor = FakeMonitor::new();
        let dir = TempDir::new("agent");
        let spdk = fake.spdk();
        let crypto = Arc::new(CryptoRegistry::new());
        if let Some(driver) = crypto_driver {
            crypto.register(Arc::new(BdevCryptoEngine::new(
                spdk.clone(),
                driver,
            )));
            crypto.set_crypto_engine(BdevCryptoEngine::NAME).unwrap();
        }
        let config = pci_config(dir.path());

        let mut devices = DeviceManagers::new();
        devices
            .register(Arc::new(
                NvmfTcpDeviceManager::new(spdk.clone(), crypto.clone()).await,
            ))
            .unwrap();
        devices
            .register(Arc::new(
                VfioUserDeviceManager::new(
                    spdk.clone(),
                    crypto.clone(),
                    monitor.clone(),
                    &config,
                )
                .await
                .unwrap(),
            ))
            .unwrap();
        devices
            .register(Arc::new(
                VhostBlkDeviceManager::new(
                    spdk.clone(),
                    crypto.clone(),
                    monitor.clone(),
                    &config,
                )
                .unwrap(),
            ))
            .unwrap();

        let volumes = Arc::new(VolumeManager::new(
            spdk,
            crypto,
            Duration::from_secs(10),
            Duration::from_secs(60),
        ));
        let agent = Arc::new(Agent::new(volumes.clone(), devices));
        Self {
            spdk: fake,
            monitor,
            volumes,
            agent,
            dir,
        }
    }
}
