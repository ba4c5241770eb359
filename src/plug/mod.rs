pub mod client;
pub mod codec;
pub mod link;

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port every plug listens on for the framed JSON protocol.
pub const DEFAULT_PORT: u16 = 9999;

/// Where a plug lives on the network. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Metric label: the bare host on the standard port, `host:port` otherwise.
    pub fn label(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Coarse classification of [`PlugError`], used by callers that only care
/// about where in the stack a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Transport,
    Decode,
}

#[derive(Debug, Error)]
pub enum PlugError {
    #[error("failed to dial {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("timed out dialing {endpoint} after {timeout_secs}s")]
    ConnectTimeout { endpoint: Endpoint, timeout_secs: u64 },

    #[error("failed to enable keepalive on {endpoint}: {source}")]
    Keepalive {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("not connected to {endpoint}")]
    NotConnected { endpoint: Endpoint },

    #[error("failed to {stage} on {endpoint}: {source}")]
    Transport {
        endpoint: Endpoint,
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{endpoint} sent a zero-length response")]
    EmptyResponse { endpoint: Endpoint },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response too short: {len} bytes")]
    Truncated { len: usize },

    #[error("device reported err_code {code}: {message}")]
    Device { code: i64, message: String },
}

impl PlugError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } | Self::ConnectTimeout { .. } | Self::Keepalive { .. } => {
                ErrorKind::Connection
            }
            Self::NotConnected { .. } | Self::Transport { .. } | Self::EmptyResponse { .. } => {
                ErrorKind::Transport
            }
            Self::Decode(_) | Self::Truncated { .. } | Self::Device { .. } => ErrorKind::Decode,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlugError>;

/// Decoded `{"system":{"get_sysinfo":{...}}}` reply. This is also the shape
/// pushed to live viewers, keyed by device id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub system: System,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub get_sysinfo: SysInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysInfo {
    pub sw_ver: String,
    pub hw_ver: String,
    pub model: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "oemId")]
    pub oem_id: String,
    #[serde(rename = "hwId")]
    pub hw_id: String,
    pub alias: String,
    pub mac: String,
    pub rssi: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_state: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_time: Option<u64>,
    pub children: Vec<Child>,
    pub child_num: usize,
    pub err_code: i64,
    /// Anything else the firmware reports, passed through to viewers as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SystemInfo {
    pub fn device_id(&self) -> &str {
        &self.system.get_sysinfo.device_id
    }

    pub fn alias(&self) -> &str {
        &self.system.get_sysinfo.alias
    }

    pub fn children(&self) -> &[Child] {
        &self.system.get_sysinfo.children
    }

    pub fn child(&self, id: &str) -> Option<&Child> {
        self.children().iter().find(|c| c.id == id)
    }
}

/// One independently switchable outlet of a power strip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Child {
    pub id: String,
    pub state: u8,
    pub alias: String,
    pub on_time: u64,
    pub next_action: NextAction,
}

impl Child {
    pub fn is_on(&self) -> bool {
        self.state != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NextAction {
    #[serde(rename = "type")]
    pub kind: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PowerInfo {
    pub emeter: Emeter,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Emeter {
    pub get_realtime: PowerReading,
}

/// Realtime emeter reading. Newer firmware reports integer milli-units,
/// older firmware reports floats in volts/amps/watts/kWh; accessors
/// normalise both to milli-units and watt-hours.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PowerReading {
    voltage_mv: Option<f64>,
    current_ma: Option<f64>,
    power_mw: Option<f64>,
    total_wh: Option<f64>,
    voltage: Option<f64>,
    current: Option<f64>,
    power: Option<f64>,
    total: Option<f64>,
    pub err_code: i64,
    pub err_msg: Option<String>,
}

impl PowerReading {
    pub fn voltage_mv(&self) -> f64 {
        self.voltage_mv
            .or(self.voltage.map(|v| v * 1000.0))
            .unwrap_or_default()
    }

    pub fn current_ma(&self) -> f64 {
        self.current_ma
            .or(self.current.map(|a| a * 1000.0))
            .unwrap_or_default()
    }

    pub fn power_mw(&self) -> f64 {
        self.power_mw
            .or(self.power.map(|w| w * 1000.0))
            .unwrap_or_default()
    }

    pub fn total_wh(&self) -> f64 {
        self.total_wh
            .or(self.total.map(|kwh| kwh * 1000.0))
            .unwrap_or_default()
    }
}
