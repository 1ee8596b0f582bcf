//! UDP presence beacon.
//!
//! One task broadcasts a probe every `probe_interval`, sweeps stale devices
//! from the registry on the same cadence, and receives replies in between.
//! Failures here never propagate: a socket that cannot be bound degrades the
//! application to manual-add only.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::discovery::{
    DISCOVERY_PORT, DiscoveryAdapter, DiscoveryStatus, PROBE_MESSAGE, parse_reply,
};
use crate::core::registry::DeviceRegistry;

/// Wait after a receive error before listening again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Local address the beacon binds to
    pub bind: SocketAddr,
    /// Where probes are sent
    pub broadcast: SocketAddr,
    pub probe_interval: Duration,
    /// Devices not heard from for longer than this are evicted
    pub stale_after: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)),
            broadcast: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            probe_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

pub struct BeaconAdapter {
    config: BeaconConfig,
    running: Mutex<Option<Running>>,
}

impl BeaconAdapter {
    pub fn new(config: BeaconConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    /// Address the socket is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.local_addr)
    }
}

fn bind_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

impl DiscoveryAdapter for BeaconAdapter {
    fn start(&self, registry: DeviceRegistry) -> DiscoveryStatus {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return DiscoveryStatus::AlreadyRunning;
        }

        let socket = match bind_socket(self.config.bind) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    addr = %self.config.bind,
                    error = %e,
                    "Discovery unavailable, continuing with manual add only"
                );
                return DiscoveryStatus::ManualOnly;
            }
        };

        let local_addr = socket.local_addr().unwrap_or(self.config.bind);
        let cancel = CancellationToken::new();
        info!(addr = %local_addr, broadcast = %self.config.broadcast, "Beacon started");

        tokio::spawn(run_beacon(
            socket,
            registry,
            self.config.clone(),
            cancel.clone(),
        ));

        *running = Some(Running { cancel, local_addr });
        DiscoveryStatus::Active
    }

    fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
        }
    }
}

impl Drop for BeaconAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_beacon(
    socket: UdpSocket,
    registry: DeviceRegistry,
    config: BeaconConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                send_probe(&socket, config.broadcast).await;
                let lost = registry.evict_stale(config.stale_after).await;
                if !lost.is_empty() {
                    debug!(count = lost.len(), "Evicted stale devices");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => match parse_reply(&buf[..len]) {
                    Some(reply) => {
                        registry.record_sighting(reply.into_device(source.ip())).await;
                    }
                    None => trace!(source = %source, len, "Ignoring unrecognised datagram"),
                },
                Err(e) => {
                    warn!(error = %e, "Discovery receive failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            },
        }
    }

    info!("Beacon stopped");
}

async fn send_probe(socket: &UdpSocket, target: SocketAddr) {
    match socket.send_to(PROBE_MESSAGE.as_bytes(), target).await {
        Ok(_) => trace!(target = %target, "Probe sent"),
        Err(e) => debug!(target = %target, error = %e, "Probe broadcast failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_failure_is_manual_only() {
        let occupied = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let adapter = BeaconAdapter::new(BeaconConfig {
            bind: occupied.local_addr().unwrap(),
            ..BeaconConfig::default()
        });

        assert_eq!(
            adapter.start(DeviceRegistry::new()),
            DiscoveryStatus::ManualOnly
        );
        assert!(adapter.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_reports_already_running() {
        let adapter = BeaconAdapter::new(BeaconConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            broadcast: "127.0.0.1:9".parse().unwrap(),
            ..BeaconConfig::default()
        });
        let registry = DeviceRegistry::new();

        assert_eq!(adapter.start(registry.clone()), DiscoveryStatus::Active);
        assert_eq!(adapter.start(registry), DiscoveryStatus::AlreadyRunning);
        adapter.stop();
        assert!(adapter.local_addr().is_none());
    }
}
