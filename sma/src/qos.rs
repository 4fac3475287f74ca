//! Rate limiting of volumes, applied through the storage engine's bdev QoS.

use rpc::sma::{QosCapabilities, QosLimit};
use snafu::{ResultExt, Snafu};
use tonic::{Code, Status};

use crate::spdk::{QosLimits, Spdk};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum QosError {
    #[snafu(display("Unsupported QoS limit: maximum.{}", field))]
    UnsupportedLimit {
        field: String,
    },
    #[snafu(display("Failed to set QoS on {}: {}", bdev, source))]
    SetLimit {
        source: jsonrpc::error::Error,
        bdev: String,
    },
}

impl QosError {
    pub fn code(&self) -> Code {
        match self {
            Self::UnsupportedLimit {
                ..
            } => Code::InvalidArgument,
            Self::SetLimit {
                ..
            } => Code::Internal,
        }
    }
}

impl From<QosError> for Status {
    fn from(e: QosError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}

/// Translate the requested maximum into bdev limits. IOPS are requested in
/// thousands of operations per second, bandwidth in MiB/s. Limits the bdev
/// layer can not enforce are refused unless they are unset or zero.
pub fn bdev_limits(
    bdev: &str,
    maximum: &QosLimit,
) -> Result<QosLimits, QosError> {
    let unsupported =
        [("rd_iops", maximum.rd_iops), ("wr_iops", maximum.wr_iops)];
    if let Some((field, _)) = unsupported
        .iter()
        .find(|(_, value)| value.unwrap_or(0) != 0)
    {
        return UnsupportedLimit {
            field: *field,
        }
        .fail();
    }

    Ok(QosLimits {
        name: bdev.to_string(),
        rw_ios_per_sec: maximum.rw_iops.map(|v| v.saturating_mul(1000)),
        rw_mbytes_per_sec: maximum.rw_bandwidth,
        r_mbytes_per_sec: maximum.rd_bandwidth,
        w_mbytes_per_sec: maximum.wr_bandwidth,
    })
}

/// Apply `maximum` to the bdev named `bdev`.
pub async fn set_volume_bdev_qos(
    spdk: &Spdk,
    bdev: &str,
    maximum: &QosLimit,
) -> Result<(), QosError> {
    let limits = bdev_limits(bdev, maximum)?;
    debug!("Setting QoS limits {:?}", limits);
    spdk.bdev_set_qos_limit(limits).await.context(SetLimit {
        bdev,
    })
}

/// Limits that can be applied to a volume.
pub fn bdev_qos_capabilities() -> QosCapabilities {
    QosCapabilities {
        rd_iops: false,
        wr_iops: false,
        rw_iops: true,
        rd_bandwidth: true,
        wr_bandwidth: true,
        rw_bandwidth: true,
    }
}
