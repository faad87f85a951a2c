use std::cmp::max;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use futures::stream::{self, StreamExt};
use log::{debug, info};
use serde::Serialize;

use crate::config::DeviceConfig;
use crate::device_link::DeviceLink;
use crate::util::catalog::Catalog;

/// Addresses probed at the same time.
pub const SCAN_CONCURRENCY: usize = 32;

/// Largest range a single scan accepts (a /16).
pub const MAX_SCAN_ADDRESSES: usize = 65_536;

/// Device class according to the catalog's device type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Switch,
    Light,
    Other,
}

impl DeviceKind {
    pub fn from_type_code(code: Option<&str>) -> Self {
        match code {
            Some("00") => DeviceKind::Switch,
            Some("01") => DeviceKind::Light,
            _ => DeviceKind::Other,
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            DeviceKind::Switch => "switch",
            DeviceKind::Light => "light",
            DeviceKind::Other => "unknown",
        };
        write!(f, "{}", kind)
    }
}

/// A device that answered on the control port. Serializes to a configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedDevice {
    pub ip: Ipv4Addr,
    pub did: Option<String>,
    pub pid: Option<String>,
    pub dmn: Option<String>,
    pub dpid: Vec<u32>,
    #[serde(skip)]
    pub device_type_code: Option<String>,
}

impl ScannedDevice {
    pub fn kind(&self) -> DeviceKind {
        DeviceKind::from_type_code(self.device_type_code.as_deref())
    }
}

/// Finds devices by trying the control port on every address of a range.
pub struct Scanner {
    port: u16,
    timeout: Duration,
    catalog: Arc<Catalog>,
}

impl Scanner {
    pub fn new(port: u16, timeout: Duration, catalog: Arc<Catalog>) -> Self {
        Scanner {
            port,
            timeout,
            catalog,
        }
    }

    /// Every address from `start` to `end`, both included.
    pub fn address_range(start: Ipv4Addr, end: Ipv4Addr) -> anyhow::Result<Vec<Ipv4Addr>> {
        let (first, last) = (u32::from(start), u32::from(end));
        if first > last {
            bail!("Scan range starts after it ends: {} > {}", start, end);
        }
        if (last - first) as usize >= MAX_SCAN_ADDRESSES {
            bail!("Scan range {} - {} is too large", start, end);
        }
        Ok((first..=last).map(Ipv4Addr::from).collect())
    }

    /// Connects to one address and reads the identity of whatever answers.
    pub async fn probe(&self, ip: Ipv4Addr) -> Option<ScannedDevice> {
        let config = DeviceConfig::new(&ip.to_string())
            .with_port(self.port)
            .with_timeout(self.timeout);
        let link = DeviceLink::with_catalog(config, self.catalog.clone());
        if !link.connect().await {
            debug!("Nothing listening at {}", ip);
            return None;
        }
        link.fetch_identity().await;
        let identity = link.identity();
        link.disconnect().await;

        info!("Found device at {}: {:?}", ip, identity.device_id);
        Some(ScannedDevice {
            ip,
            did: identity.device_id,
            pid: identity.product_id,
            dmn: identity.metadata.device_model_name,
            dpid: identity.metadata.dpid,
            device_type_code: identity.metadata.device_type_code,
        })
    }

    /// Probes the range, a few addresses at a time. Results are sorted by address.
    pub async fn scan(&self, start: Ipv4Addr, end: Ipv4Addr) -> anyhow::Result<Vec<ScannedDevice>> {
        let addresses = Self::address_range(start, end)?;
        info!(
            "IP scan from {}, end with {} ({} addresses)",
            start,
            end,
            addresses.len()
        );
        let mut devices: Vec<ScannedDevice> = stream::iter(addresses)
            .map(|ip| self.probe(ip))
            .buffer_unordered(SCAN_CONCURRENCY)
            .filter_map(|device| async move { device })
            .collect()
            .await;
        devices.sort_by_key(|device| device.ip);
        Ok(devices)
    }

    pub fn pretty_print_devices(devices: &[ScannedDevice]) {
        let text = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

        // Determine the maximum width for each column
        let max_ip_width = devices
            .iter()
            .map(|d| d.ip.to_string().len())
            .max()
            .unwrap_or(0)
            .max("IP Address".len());
        let max_device_id_width = devices
            .iter()
            .map(|d| text(&d.did).len())
            .max()
            .unwrap_or(0)
            .max("Device ID".len());
        let max_pid_width = devices
            .iter()
            .map(|d| text(&d.pid).len())
            .max()
            .unwrap_or(0)
            .max("Product".len());
        let max_model_width = devices
            .iter()
            .map(|d| max(text(&d.dmn).len(), 20))
            .max()
            .unwrap_or(0);

        println!(
            "{:<ip_width$} {:<device_id_width$} {:<pid_width$} {:<model_width$} {}",
            "IP Address",
            "Device ID",
            "Product",
            "Model",
            "Kind",
            ip_width = max_ip_width + 2,
            device_id_width = max_device_id_width + 2,
            pid_width = max_pid_width + 2,
            model_width = max_model_width + 2,
        );
        println!(
            "{:<ip_width$} {:<device_id_width$} {:<pid_width$} {:<model_width$} {}",
            "-".repeat(max_ip_width),
            "-".repeat(max_device_id_width),
            "-".repeat(max_pid_width),
            "-".repeat(max_model_width),
            "-".repeat(7),
            ip_width = max_ip_width + 2,
            device_id_width = max_device_id_width + 2,
            pid_width = max_pid_width + 2,
            model_width = max_model_width + 2,
        );
        for device in devices {
            println!(
                "{:<ip_width$} {:<device_id_width$} {:<pid_width$} {:<model_width$} {}",
                device.ip,
                text(&device.did),
                text(&device.pid),
                text(&device.dmn),
                device.kind(),
                ip_width = max_ip_width + 2,
                device_id_width = max_device_id_width + 2,
                pid_width = max_pid_width + 2,
                model_width = max_model_width + 2,
            );
        }
    }
}
