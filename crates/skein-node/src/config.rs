//! Node configuration
//!
//! Loaded from a TOML file and then overridden by command-line flags.
//! Durations are written in human form, e.g. `"5s"` or `"250ms"`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use skein_core::{Credential, NodeName, SkeinError, SkeinResult};
use skein_transport::MAX_FRAME_SIZE;

/// Default transport port
pub const DEFAULT_PORT: u16 = 8000;

/// Default gateway port
pub const DEFAULT_GATEWAY_PORT: u16 = 8080;

/// Room left in a frame for the envelope and framing around a written body
const FRAME_HEADROOM: usize = 64 * 1024;

/// Largest gateway body that still replicates in a single frame
pub const MAX_BODY_BYTES: usize = MAX_FRAME_SIZE - FRAME_HEADROOM;

/// Default gateway JSON body limit
pub const DEFAULT_MAX_BODY_BYTES: usize = MAX_BODY_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name this node declares to its peers; used for loop prevention
    pub name: NodeName,
    /// Transport listen host
    pub host: String,
    /// Transport listen port
    pub port: u16,
    pub gateway: GatewayConfig,
    /// Root of the per-node channel directories
    pub data_dir: PathBuf,
    /// Where logins are checked
    pub credentials: CredentialSource,
    /// Credentials this node presents when it dials a peer
    pub peer_login: Credential,
    /// How long a new peer link may take to authenticate
    #[serde(with = "duration")]
    pub auth_timeout: Duration,
    /// Per-peer limit on a fan-out `getChannelData` call
    #[serde(with = "duration")]
    pub rpc_timeout: Duration,
    pub aggregate: AggregateConfig,
    /// Per-channel buffer of the exchange
    pub exchange_capacity: usize,
    /// Log a warning when an envelope has visited more nodes than this
    pub originator_warn_threshold: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: NodeName::from("node"),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            gateway: GatewayConfig::default(),
            data_dir: PathBuf::from("data"),
            credentials: CredentialSource::default(),
            peer_login: Credential::new("", ""),
            auth_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(5),
            aggregate: AggregateConfig::default(),
            exchange_capacity: skein_transport::DEFAULT_EXCHANGE_CAPACITY,
            originator_warn_threshold: 64,
        }
    }
}

impl NodeConfig {
    /// Read a TOML config file
    pub fn load(path: impl AsRef<Path>) -> SkeinResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SkeinError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> SkeinResult<Self> {
        toml::from_str(raw).map_err(|e| SkeinError::Config(e.to_string()))
    }

    pub fn transport_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn gateway_addr(&self) -> SkeinResult<SocketAddr> {
        format!("{}:{}", self.gateway.host, self.gateway.port)
            .parse()
            .map_err(|e| SkeinError::Config(format!("gateway address: {e}")))
    }

    pub fn validate(&self) -> SkeinResult<()> {
        if self.name.is_empty() {
            return Err(SkeinError::Config("name cannot be empty".into()));
        }
        if self.port != 0 && self.port == self.gateway.port && self.host == self.gateway.host {
            return Err(SkeinError::Config(
                "transport and gateway cannot share a port".into(),
            ));
        }
        if self.gateway.max_body_bytes == 0 {
            return Err(SkeinError::Config("gateway.max_body_bytes cannot be 0".into()));
        }
        if self.gateway.max_body_bytes > MAX_BODY_BYTES {
            return Err(SkeinError::Config(format!(
                "gateway.max_body_bytes cannot exceed {MAX_BODY_BYTES}, the largest write peers can receive"
            )));
        }
        if self.exchange_capacity == 0 {
            return Err(SkeinError::Config("exchange_capacity cannot be 0".into()));
        }
        if self.auth_timeout.is_zero() || self.rpc_timeout.is_zero() {
            return Err(SkeinError::Config("timeouts cannot be 0".into()));
        }
        self.gateway_addr()?;
        Ok(())
    }
}

/// HTTP gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Report write and connect failures to the caller instead of always
    /// answering success
    pub surface_errors: bool,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_GATEWAY_PORT,
            surface_errors: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Fan-out read settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Report failed peers as `{peer, error}` instead of `{}`
    pub explicit_failures: bool,
}

/// Where the login procedure looks up users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// JSON array file, re-read on every login
    File(PathBuf),
    Inline(Vec<Credential>),
}

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::File(PathBuf::from("data/credentials.json"))
    }
}

mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
