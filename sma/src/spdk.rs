//! Typed access to the json-rpc methods of the storage engine used by the
//! agent.
//!
//! Optional parameters are skipped when unset, the engine rejects explicit
//! nulls for most of them.

use std::sync::Arc;

use async_trait::async_trait;
use jsonrpc::error::{Error, RpcCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Result of a call to the storage engine.
pub type RpcResult<T> = Result<T, Error>;

/// Seam between the agent and the json-rpc transport.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> RpcResult<Value>;
}

#[async_trait]
impl RpcClient for jsonrpc::Client {
    async fn call_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> RpcResult<Value> {
        jsonrpc::Client::call_raw(self, method, params).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bdev {
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub driver_specific: Value,
}

impl Bdev {
    /// NQN of the subsystem an NVMe-oF attached bdev was discovered through.
    pub fn nvme_subnqn(&self) -> Option<&str> {
        self.driver_specific
            .get("nvme")?
            .get(0)?
            .get("trid")?
            .get("subnqn")?
            .as_str()
    }
}

/// NVMe-oF transport id, as reported by the discovery service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportId {
    pub trtype: String,
    #[serde(default)]
    pub adrfam: String,
    pub traddr: String,
    #[serde(default)]
    pub trsvcid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnqn: String,
}

impl TransportId {
    /// Whether both ids point at the same endpoint. The engine reports the
    /// transport type and address family in upper case.
    pub fn matches(&self, other: &TransportId) -> bool {
        self.trtype.eq_ignore_ascii_case(&other.trtype)
            && self.traddr.eq_ignore_ascii_case(&other.traddr)
            && self.trsvcid.eq_ignore_ascii_case(&other.trsvcid)
            && self.adrfam.eq_ignore_ascii_case(&other.adrfam)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub trid: TransportId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub name: String,
    pub trid: TransportId,
    #[serde(default)]
    pub referrals: Vec<Referral>,
}

impl DiscoveryInfo {
    /// Whether this service targets `trid`, directly or through a referral.
    pub fn reaches(&self, trid: &TransportId) -> bool {
        self.trid.matches(trid)
            || self.referrals.iter().any(|r| r.trid.matches(trid))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    pub trtype: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenAddress {
    pub trtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adrfam: Option<String>,
    pub traddr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trsvcid: Option<String>,
}

impl ListenAddress {
    pub fn matches(&self, other: &ListenAddress) -> bool {
        let opt_eq = |a: &Option<String>, b: &Option<String>| match (a, b) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => a.is_none() && b.is_none(),
        };
        self.trtype.eq_ignore_ascii_case(&other.trtype)
            && self.traddr.eq_ignore_ascii_case(&other.traddr)
            && opt_eq(&self.trsvcid, &other.trsvcid)
            && opt_eq(&self.adrfam, &other.adrfam)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub nqn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub nsid: u32,
    /// Name of the bdev backing the namespace.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subsystem {
    pub nqn: String,
    #[serde(default)]
    pub allow_any_host: bool,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub listen_addresses: Vec<ListenAddress>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

impl Subsystem {
    pub fn namespace(&self, bdev_name: &str) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.name == bdev_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhostController {
    pub ctrlr: String,
    #[serde(default)]
    pub backend_specific: Value,
}

impl VhostController {
    /// Bdev backing a vhost-blk controller.
    pub fn block_bdev(&self) -> Option<&str> {
        self.backend_specific.get("block")?.get("bdev")?.as_str()
    }
}

#[derive(Debug, Serialize)]
struct BdevGetBdevs<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

/// Parameters of `bdev_crypto_create`.
#[derive(Debug, Clone, Serialize)]
pub struct CryptoCreate {
    pub base_bdev_name: String,
    pub name: String,
    pub crypto_pmd: String,
    pub key: String,
    pub cipher: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tweak_mode: Option<String>,
}

/// Parameters of `bdev_set_qos_limit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QosLimits {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rw_ios_per_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rw_mbytes_per_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_mbytes_per_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_mbytes_per_sec: Option<u64>,
}

/// Parameters of `bdev_nvme_start_discovery`.
#[derive(Debug, Clone, Serialize)]
pub struct StartDiscovery {
    pub name: String,
    pub trtype: String,
    pub traddr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trsvcid: String,
    pub adrfam: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostnqn: Option<String>,
    pub wait_for_attach: bool,
    pub attach_timeout_ms: u64,
}

/// Parameters of `nvmf_subsystem_add_ns`.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceParams {
    pub bdev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nguid: Option<String>,
}

/// Storage engine as seen by the agent. Cheap to clone, all clones share
/// the same client.
#[derive(Clone)]
pub struct Spdk {
    client: Arc<dyn RpcClient>,
}

impl std::fmt::Debug for Spdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spdk").finish()
    }
}

impl Spdk {
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self {
            client,
        }
    }

    async fn call<A, R>(&self, method: &str, args: A) -> RpcResult<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(args)?;
        let params = match params {
            Value::Null => None,
            params => Some(params),
        };
        let value = self.client.call_raw(method, params).await?;
        serde_json::from_value(value).map_err(Error::ParseError)
    }

    /// All bdevs of the engine.
    pub async fn bdev_get_bdevs(&self) -> RpcResult<Vec<Bdev>> {
        self.call(
            "bdev_get_bdevs",
            BdevGetBdevs {
                name: None,
                timeout: None,
            },
        )
        .await
    }

    /// Look a bdev up by name or alias, waiting up to `timeout_ms` for it to
    /// appear. A bdev that never appears is `None`.
    pub async fn find_bdev(
        &self,
        name: &str,
        timeout_ms: Option<u64>,
    ) -> RpcResult<Option<Bdev>> {
        let result: RpcResult<Vec<Bdev>> = self
            .call(
                "bdev_get_bdevs",
                BdevGetBdevs {
                    name: Some(name),
                    timeout: timeout_ms,
                },
            )
            .await;
        match result {
            Ok(bdevs) => Ok(bdevs.into_iter().next()),
            Err(error) if error.rpc_code() == Some(RpcCode::NotFound) => {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn bdev_crypto_create(
        &self,
        params: CryptoCreate,
    ) -> RpcResult<String> {
        self.call("bdev_crypto_create", params).await
    }

    pub async fn bdev_crypto_delete(&self, name: &str) -> RpcResult<()> {
        let _: Value = self
            .call("bdev_crypto_delete", serde_json::json!({ "name": name }))
            .await?;
        Ok(())
    }

    pub async fn bdev_set_qos_limit(&self, limits: QosLimits) -> RpcResult<()> {
        let _: Value = self.call("bdev_set_qos_limit", limits).await?;
        Ok(())
    }

    pub async fn nvmf_get_transports(&self) -> RpcResult<Vec<Transport>> {
        self.call("nvmf_get_transports", Value::Null).await
    }

    pub async fn nvmf_create_transport(&self, trtype: &str) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_create_transport",
                serde_json::json!({ "trtype": trtype }),
            )
            .await?;
        Ok(())
    }

    /// Make sure a transport of the given type exists.
    pub async fn ensure_transport(&self, trtype: &str) -> RpcResult<()> {
        let transports = self.nvmf_get_transports().await?;
        if transports
            .iter()
            .any(|t| t.trtype.eq_ignore_ascii_case(trtype))
        {
            return Ok(());
        }
        self.nvmf_create_transport(trtype).await
    }

    pub async fn nvmf_get_subsystems(&self) -> RpcResult<Vec<Subsystem>> {
        self.call("nvmf_get_subsystems", Value::Null).await
    }

    pub async fn nvmf_get_subsystem(
        &self,
        nqn: &str,
    ) -> RpcResult<Option<Subsystem>> {
        let subsystems = self.nvmf_get_subsystems().await?;
        Ok(subsystems.into_iter().find(|s| s.nqn == nqn))
    }

    pub async fn nvmf_create_subsystem(
        &self,
        nqn: &str,
        allow_any_host: bool,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_create_subsystem",
                serde_json::json!({
                    "nqn": nqn,
                    "allow_any_host": allow_any_host,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn nvmf_delete_subsystem(&self, nqn: &str) -> RpcResult<()> {
        let _: Value = self
            .call("nvmf_delete_subsystem", serde_json::json!({ "nqn": nqn }))
            .await?;
        Ok(())
    }

    pub async fn nvmf_subsystem_allow_any_host(
        &self,
        nqn: &str,
        allow_any_host: bool,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_subsystem_allow_any_host",
                serde_json::json!({
                    "nqn": nqn,
                    "allow_any_host": allow_any_host,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn nvmf_subsystem_add_host(
        &self,
        nqn: &str,
        host: &str,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_subsystem_add_host",
                serde_json::json!({ "nqn": nqn, "host": host }),
            )
            .await?;
        Ok(())
    }

    pub async fn nvmf_subsystem_remove_host(
        &self,
        nqn: &str,
        host: &str,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_subsystem_remove_host",
                serde_json::json!({ "nqn": nqn, "host": host }),
            )
            .await?;
        Ok(())
    }

    pub async fn nvmf_subsystem_add_listener(
        &self,
        nqn: &str,
        address: &ListenAddress,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_subsystem_add_listener",
                serde_json::json!({ "nqn": nqn, "listen_address": address }),
            )
            .await?;
        Ok(())
    }

    pub async fn nvmf_subsystem_remove_listener(
        &self,
        nqn: &str,
        address: &ListenAddress,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_subsystem_remove_listener",
                serde_json::json!({ "nqn": nqn, "listen_address": address }),
            )
            .await?;
        Ok(())
    }

    /// Add a namespace and return its id.
    pub async fn nvmf_subsystem_add_ns(
        &self,
        nqn: &str,
        namespace: NamespaceParams,
    ) -> RpcResult<u32> {
        self.call(
            "nvmf_subsystem_add_ns",
            serde_json::json!({ "nqn": nqn, "namespace": namespace }),
        )
        .await
    }

    pub async fn nvmf_subsystem_remove_ns(
        &self,
        nqn: &str,
        nsid: u32,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "nvmf_subsystem_remove_ns",
                serde_json::json!({ "nqn": nqn, "nsid": nsid }),
            )
            .await?;
        Ok(())
    }

    pub async fn bdev_nvme_start_discovery(
        &self,
        params: StartDiscovery,
    ) -> RpcResult<()> {
        let _: Value = self.call("bdev_nvme_start_discovery", params).await?;
        Ok(())
    }

    pub async fn bdev_nvme_stop_discovery(&self, name: &str) -> RpcResult<()> {
        let _: Value = self
            .call(
                "bdev_nvme_stop_discovery",
                serde_json::json!({ "name": name }),
            )
            .await?;
        Ok(())
    }

    pub async fn bdev_nvme_get_discovery_info(
        &self,
    ) -> RpcResult<Vec<DiscoveryInfo>> {
        self.call("bdev_nvme_get_discovery_info", Value::Null).await
    }

    pub async fn vhost_get_controllers(
        &self,
    ) -> RpcResult<Vec<VhostController>> {
        self.call("vhost_get_controllers", Value::Null).await
    }

    pub async fn vhost_get_controller(
        &self,
        ctrlr: &str,
    ) -> RpcResult<Option<VhostController>> {
        let controllers = self.vhost_get_controllers().await?;
        Ok(controllers.into_iter().find(|c| c.ctrlr == ctrlr))
    }

    pub async fn vhost_create_blk_controller(
        &self,
        ctrlr: &str,
        bdev: &str,
    ) -> RpcResult<()> {
        let _: Value = self
            .call(
                "vhost_create_blk_controller",
                serde_json::json!({ "ctrlr": ctrlr, "dev_name": bdev }),
            )
            .await?;
        Ok(())
    }

    pub async fn vhost_delete_controller(&self, ctrlr: &str) -> RpcResult<()> {
        let _: Value = self
            .call(
                "vhost_delete_controller",
                serde_json::json!({ "ctrlr": ctrlr }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_params_are_skipped() {
        let limits = QosLimits {
            name: "vol".into(),
            rw_ios_per_sec: Some(2000),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(limits).unwrap(),
            json!({ "name": "vol", "rw_ios_per_sec": 2000 })
        );

        let discovery = StartDiscovery {
            name: "d0".into(),
            trtype: "tcp".into(),
            traddr: "10.0.0.1".into(),
            trsvcid: "8009".into(),
            adrfam: "ipv4".into(),
            hostnqn: None,
            wait_for_attach: true,
            attach_timeout_ms: 10000,
        };
        let value = serde_json::to_value(discovery).unwrap();
        assert!(value.get("hostnqn").is_none());
        assert_eq!(value["attach_timeout_ms"], 10000);
    }

    #[test]
    fn trid_matching_ignores_case() {
        let reported: TransportId = serde_json::from_value(json!({
            "trtype": "TCP",
            "adrfam": "IPv4",
            "traddr": "10.0.0.1",
            "trsvcid": "8009",
            "subnqn": "nqn.2014-08.org.nvmexpress.discovery",
        }))
        .unwrap();
        let requested = TransportId {
            trtype: "tcp".into(),
            adrfam: "ipv4".into(),
            traddr: "10.0.0.1".into(),
            trsvcid: "8009".into(),
            subnqn: String::new(),
        };
        assert!(reported.matches(&requested));

        let info = DiscoveryInfo {
            name: "d0".into(),
            trid: TransportId {
                trsvcid: "4420".into(),
                ..requested.clone()
            },
            referrals: vec![Referral {
                trid: reported,
            }],
        };
        assert!(info.reaches(&requested));
    }

    #[test]
    fn bdev_subnqn() {
        let bdev: Bdev = serde_json::from_value(json!({
            "name": "nvme0n1",
            "uuid": "11111111-1111-1111-1111-111111111111",
            "product_name": "NVMe disk",
            "driver_specific": {
                "nvme": [{ "trid": { "subnqn": "nqn.2016-06.io.spdk:cnode0" } }]
            },
        }))
        .unwrap();
        assert_eq!(bdev.nvme_subnqn(), Some("nqn.2016-06.io.spdk:cnode0"));
    }
}
