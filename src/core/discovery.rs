use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info};

use super::client::DeviceClient;
use super::error::{Error, Result};
use super::models::Device;
use super::registry::DeviceRegistry;

/// UDP port devices listen on for probes.
pub const DISCOVERY_PORT: u16 = 8765;
/// HTTP port assumed for manually added devices.
pub const DEFAULT_DEVICE_PORT: u16 = 8080;
/// Probe payload broadcast every cycle.
pub const PROBE_MESSAGE: &str = "FRIISH_DISCOVER";
/// Every valid reply starts with this marker.
pub const REPLY_PREFIX: &str = "NXDUMP_RESPONSE";

/// Outcome of starting a discovery adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Active,
    /// Discovery is unavailable (e.g. the port could not be bound).
    /// Manual add keeps working.
    ManualOnly,
    AlreadyRunning,
}

pub trait DiscoveryAdapter: Send + Sync {
    /// Start discovering devices into `registry`.
    /// Spawns internal tasks; must be called from within a Tokio runtime.
    fn start(&self, registry: DeviceRegistry) -> DiscoveryStatus;

    /// Stop discovery. Pending waits are interrupted and sockets released.
    fn stop(&self);
}

/// A parsed beacon reply. The host comes from the datagram's source address,
/// never from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconReply {
    pub port: u16,
    pub name: String,
    pub version: String,
}

impl BeaconReply {
    pub fn into_device(self, source: IpAddr) -> Device {
        Device::new(SocketAddr::new(source, self.port), self.name, self.version)
    }
}

/// Parse `NXDUMP_RESPONSE|port|name|version[|...]`. Returns None for anything
/// malformed; extra trailing fields are ignored.
pub fn parse_reply(datagram: &[u8]) -> Option<BeaconReply> {
    let message = std::str::from_utf8(datagram).ok()?;
    if !message.starts_with(REPLY_PREFIX) {
        return None;
    }

    let parts: Vec<&str> = message.trim_end_matches(['\r', '\n', '\0']).split('|').collect();
    if parts.len() < 4 || parts[0] != REPLY_PREFIX {
        return None;
    }

    let port: u16 = parts[1].trim().parse().ok()?;
    if port == 0 {
        return None;
    }

    Some(BeaconReply {
        port,
        name: parts[2].to_string(),
        version: parts[3].to_string(),
    })
}

/// Validate manual-add input without touching the network.
pub fn parse_device_address(host: &str, port: u32) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("'{}' is not a valid IP address", host)))?;

    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::InvalidAddress(format!("port {} is outside 1-65535", port)))?;

    Ok(SocketAddr::new(ip, port))
}

/// Add a device by address, verifying it answers `/api/info` first.
///
/// Input is validated locally before any request is made. An existing entry at
/// the same address is replaced.
pub async fn add_device_manually(
    registry: &DeviceRegistry,
    client: &dyn DeviceClient,
    host: &str,
    port: u32,
) -> Result<Device> {
    let addr = parse_device_address(host, port)?;
    debug!(addr = %addr, "Verifying manually added device");

    let probe = Device::new(addr, "Unknown Device", "Unknown");
    let info = client.get_info(&probe).await.map_err(|e| {
        Error::Connection(format!("Failed to connect to device at {}: {}", addr, e))
    })?;

    let device = Device::new(
        addr,
        info.get("name").map(String::as_str).unwrap_or("Unknown Device"),
        info.get("version").map(String::as_str).unwrap_or("Unknown"),
    );

    registry.upsert(device.clone()).await;
    info!(addr = %addr, name = %device.name, "Device added manually");
    Ok(device)
}
