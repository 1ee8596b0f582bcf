use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::client::DeviceClient;
use crate::core::discovery::{DEFAULT_DEVICE_PORT, DiscoveryAdapter};
use crate::core::error::Result;

mod beacon;
mod http;
mod simulated;

pub use beacon::{BeaconAdapter, BeaconConfig};
pub use http::{DEFAULT_REQUEST_TIMEOUT, HttpDeviceClient};
pub use simulated::{ScriptedStatus, SimulatedDevice, SimulatedDiscovery, Simulator};

/// Pick the discovery adapter for this run. In simulation mode a device is
/// announced right away and stdin accepts `add <ip[:port]> [name]` and
/// `rm <ip[:port]>` commands.
pub fn get_discovery(config: &AppConfig) -> Box<dyn DiscoveryAdapter> {
    if config.simulation {
        let (adapter, simulator) = SimulatedDiscovery::new();
        let default_addr = SocketAddr::from(([127, 0, 0, 1], DEFAULT_DEVICE_PORT));
        simulator.announce(default_addr, "Simulated NXDump", "0.0.0-sim");

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines() {
                let Ok(cmd) = line else { break };
                let parts: Vec<&str> = cmd.split_whitespace().collect();
                let addr = parts.get(1).and_then(|a| parse_sim_addr(a));
                match (parts.first().copied(), addr) {
                    (Some("add"), Some(addr)) => {
                        let name = parts.get(2).copied().unwrap_or("Simulated NXDump");
                        simulator.announce(addr, name, "0.0.0-sim");
                    }
                    (Some("rm"), Some(addr)) => simulator.vanish(addr),
                    _ => println!("(Simulator) Use: 'add <ip[:port]> [name]' or 'rm <ip[:port]>'"),
                }
            }
        });

        return Box::new(adapter);
    }

    Box::new(BeaconAdapter::new(config.discovery.beacon_config()))
}

/// Pick the device client for this run.
pub fn get_client(config: &AppConfig) -> Result<Arc<dyn DeviceClient>> {
    if config.simulation {
        return Ok(Arc::new(
            SimulatedDevice::new().with_latency(Duration::from_millis(150)),
        ));
    }

    Ok(Arc::new(HttpDeviceClient::new(config.client.request_timeout())?))
}

fn parse_sim_addr(input: &str) -> Option<SocketAddr> {
    input.parse().ok().or_else(|| {
        input
            .parse::<std::net::IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, DEFAULT_DEVICE_PORT))
    })
}
