use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bonjour service type advertised by WiThrottle servers such as DCC-EX
pub const SERVICE_TYPE: &str = "_withrottle._tcp";

/// Discovery domain; only the local link is browsed
pub const SERVICE_DOMAIN: &str = "local.";

/// Default DCC-EX WiThrottle port
pub const DEFAULT_PORT: u16 = 2560;

/// Tunables for discovery, probing and the station session.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use dccex_throttle::ClientConfig;
///
/// let config = ClientConfig::from_json_str(r#"{ "probe_timeout_ms": 500 }"#).unwrap();
/// assert_eq!(config.probe_timeout().as_millis(), 500);
/// assert_eq!(config.default_port, 2560);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub service_type: String,
    pub service_domain: String,
    pub default_port: u16,

    /// Interval between health-check rounds
    pub health_check_interval_ms: u64,

    /// Bound on each health probe connect
    pub probe_timeout_ms: u64,

    /// Bound on each address resolution connect
    pub resolve_timeout_ms: u64,

    /// Bound on the session connect
    pub connect_timeout_ms: u64,

    /// Console entries kept before the oldest are dropped
    pub console_capacity: usize,

    /// Buffer size of broadcast event channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            service_domain: SERVICE_DOMAIN.to_string(),
            default_port: DEFAULT_PORT,
            health_check_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            resolve_timeout_ms: 3_000,
            connect_timeout_ms: 10_000,
            console_capacity: 500,
            channel_capacity: 100,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Never zero; tokio intervals reject a zero period
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
