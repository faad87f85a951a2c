use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TCP port CozyLife devices listen on.
pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Everything needed to talk to one device.
///
/// Identity hints (`did`, `pid`, `dmn`, `dpid`) come from configuration or a previous scan.
/// They seed the link's identity and are only replaced by the link itself once the
/// device answered an INFO request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "ip")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-attempt timeout for connecting, writing and reading one frame.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default, rename = "did")]
    pub device_id: Option<String>,
    #[serde(default, rename = "pid")]
    pub product_id: Option<String>,
    #[serde(default, rename = "dmn")]
    pub model_name: Option<String>,
    #[serde(default)]
    pub dpid: Vec<u32>,
    /// Drop the connection when no correlated response arrived within the attempt budget.
    #[serde(default = "default_true")]
    pub resync_on_timeout: bool,
}

impl DeviceConfig {
    pub fn new(address: &str) -> Self {
        DeviceConfig {
            address: address.to_string(),
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            device_id: None,
            product_id: None,
            model_name: None,
            dpid: Vec::new(),
            resync_on_timeout: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn with_product_id(mut self, product_id: &str) -> Self {
        self.product_id = Some(product_id.to_string());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Switch platform configuration.
///
/// Each `switches` entry is a single-rocker switch, each `switches2` entry a two-rocker
/// switch whose rockers share register 1 of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default)]
    pub switches: Vec<DeviceConfig>,
    #[serde(default)]
    pub switches2: Vec<DeviceConfig>,
    /// Never poll devices; entity state follows the last command sent.
    #[serde(default)]
    pub optimistic: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_entry() {
        let config: DeviceConfig = serde_json::from_str(r#"{"ip":"192.168.1.20"}"#).unwrap();
        assert_eq!(config, DeviceConfig::new("192.168.1.20"));
        assert_eq!(config.timeout(), Duration::from_secs(3));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_scan_style_entry() {
        let config: SwitchConfig = serde_json::from_str(
            r#"{"switches2":[{"ip":"192.168.1.21","did":"629168597cb94c4c1d8f","pid":"e2s64v","dmn":"Wall Switch","dpid":[1]}]}"#,
        )
        .unwrap();
        assert!(config.switches.is_empty());
        assert!(!config.optimistic);
        let device = &config.switches2[0];
        assert_eq!(device.device_id.as_deref(), Some("629168597cb94c4c1d8f"));
        assert_eq!(device.product_id.as_deref(), Some("e2s64v"));
        assert_eq!(device.model_name.as_deref(), Some("Wall Switch"));
        assert_eq!(device.dpid, vec![1]);
        assert_eq!(device.port, DEFAULT_PORT);
    }
}
