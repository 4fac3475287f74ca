//! Command line and configuration file of the agent. The file is read once at
//! startup; values given on the command line take precedence.

use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{device::pci::PciDeviceConfig, logger::LogFormat};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConfigError {
    #[snafu(display(
        "Failed to read config file {}: {}",
        path.display(),
        source
    ))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Invalid config file {}: {}", path.display(), source))]
    ParseFile {
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[snafu(display("Invalid {}: {}", field, reason))]
    InvalidValue {
        field: String,
        reason: String,
    },
    #[snafu(display("Failed to resolve {}: {}", address, source))]
    Resolve {
        source: std::io::Error,
        address: String,
    },
}

fn parse_period(src: &str) -> Result<Duration, String> {
    humantime::parse_duration(src)
        .map_err(|e| format!("Invalid argument {src}: {e}"))
}

#[derive(Debug, Clone, Parser)]
#[clap(
    name = "sma",
    about = "Storage management agent",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct SmaCliArgs {
    #[clap(short = 'c', long = "config")]
    /// Path to the YAML configuration file.
    pub config: Option<PathBuf>,
    #[clap(long)]
    /// Address the gRPC server listens on.
    pub address: Option<String>,
    #[clap(long)]
    /// Port the gRPC server listens on.
    pub port: Option<u16>,
    #[clap(short = 's', long = "socket")]
    /// Storage engine json-rpc address, a unix socket path or host:port.
    pub socket: Option<String>,
    #[clap(long = "log-format", default_value = "default")]
    /// Log format, default or json.
    pub log_format: LogFormat,
    #[clap(long = "log-level", default_value = "info")]
    /// Log level used unless RUST_LOG is set.
    pub log_level: String,
    #[clap(long = "discovery-timeout", value_parser = parse_period)]
    /// How long to wait for a discovery service to attach its subsystems,
    /// e.g. 10s.
    pub discovery_timeout: Option<Duration>,
    #[clap(long = "cleanup-period", value_parser = parse_period)]
    /// Period of the sweep forgetting volumes gone from the storage engine,
    /// e.g. 1m.
    pub cleanup_period: Option<Duration>,
}

/// Selected crypto engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoConfig {
    pub name: String,
    #[serde(default)]
    pub params: CryptoParamsConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoParamsConfig {
    /// Crypto driver of the storage engine.
    pub driver: Option<String>,
}

/// A device manager to enable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub params: Option<PciDeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub address: String,
    pub port: u16,
    /// Storage engine json-rpc address.
    pub socket: String,
    /// Seconds to wait for a discovery service to attach.
    pub discovery_timeout: f64,
    /// Seconds between two volume sweeps.
    pub volume_cleanup_period: f64,
    pub crypto: Option<CryptoConfig>,
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 8080,
            socket: "/var/tmp/spdk.sock".to_string(),
            discovery_timeout: 10.0,
            volume_cleanup_period: 60.0,
            crypto: None,
            devices: Vec::new(),
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .context(InvalidValue {
            field,
            reason: format!("{} is not a positive number of seconds", value),
        })
}

impl Config {
    /// Parse a YAML configuration.
    pub fn from_yaml(path: &Path, yaml: &str) -> Result<Self, ConfigError> {
        // an empty document is a valid, default configuration
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context(ParseFile {
            path,
        })
    }

    /// Build the configuration from the command line, reading the file it
    /// points to.
    pub fn load(args: &SmaCliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => {
                let yaml = fs::read_to_string(path).context(ReadFile {
                    path,
                })?;
                Self::from_yaml(path, &yaml)?
            }
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_args(&mut self, args: &SmaCliArgs) {
        if let Some(address) = &args.address {
            self.address = address.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(socket) = &args.socket {
            self.socket = socket.clone();
        }
        if let Some(timeout) = args.discovery_timeout {
            self.discovery_timeout = timeout.as_secs_f64();
        }
        if let Some(period) = args.cleanup_period {
            self.volume_cleanup_period = period.as_secs_f64();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.discovery_timeout()?;
        self.cleanup_period()?;
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Result<Duration, ConfigError> {
        seconds("discovery_timeout", self.discovery_timeout)
    }

    pub fn cleanup_period(&self) -> Result<Duration, ConfigError> {
        seconds("volume_cleanup_period", self.volume_cleanup_period)
    }

    /// Socket address the gRPC server binds to.
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        let address = format!("{}:{}", self.address, self.port);
        address
            .to_socket_addrs()
            .context(Resolve {
                address: &address,
            })?
            .next()
            .context(InvalidValue {
                field: "address",
                reason: format!("{} does not resolve", address),
            })
    }
}
