//! Registry of known devices.
//!
//! This module is the single owner of device records. The beacon task and any
//! consumer (CLI, tests) share one registry by cloning the handle; every read
//! and write goes through the methods below, which take the internal lock for
//! the whole operation. Callers only ever receive clones.
//!
//! Observers subscribe to a broadcast channel of [`RegistryEvent`]s. Events are
//! queued while the lock is held, so for any single device a `Discovered` is
//! always queued before the matching `Lost`. Delivery happens on the
//! subscriber's own task, never under the registry lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info};

use super::models::Device;

/// Default number of undelivered events a subscriber may fall behind by.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Discovered(Device),
    Lost(Device),
}

/// Thread-safe store of known devices, keyed by address.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<HashMap<SocketAddr, Device>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Register an observer for discovered/lost notifications.
    ///
    /// The channel is bounded so a stalled observer can never hold up the
    /// registry. An observer that falls more than the event capacity behind
    /// gets `RecvError::Lagged` and has lost the skipped events, `Lost` ones
    /// included; it should resynchronise from [`list`](Self::list).
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Point-in-time snapshot of all known devices, ordered by address.
    pub async fn list(&self) -> Vec<Device> {
        let map = self.inner.read().await;
        let mut devices: Vec<Device> = map.values().cloned().collect();
        devices.sort_by_key(|d| d.addr);
        devices
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Device> {
        let map = self.inner.read().await;
        map.get(addr).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Insert or replace a device. Returns true if the address was not known,
    /// in which case a `Discovered` event is emitted.
    pub async fn upsert(&self, device: Device) -> bool {
        let mut map = self.inner.write().await;
        let is_new = map.insert(device.addr, device.clone()).is_none();
        if is_new {
            info!(addr = %device.addr, name = %device.name, "Device discovered");
            let _ = self.events.send(RegistryEvent::Discovered(device));
        } else {
            debug!(addr = %device.addr, "Device replaced");
        }
        is_new
    }

    /// Record a beacon reply: refresh a known device, or insert a new one.
    /// Both paths run under one write lock so concurrent sightings of the same
    /// address cannot both insert.
    pub async fn record_sighting(&self, device: Device) -> bool {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get_mut(&device.addr) {
            existing.touch();
            existing.name = device.name;
            existing.version = device.version;
            return false;
        }

        info!(addr = %device.addr, name = %device.name, version = %device.version, "Device discovered");
        map.insert(device.addr, device.clone());
        let _ = self.events.send(RegistryEvent::Discovered(device));
        true
    }

    /// Remove a device. Returns whether it existed.
    pub async fn remove(&self, addr: &SocketAddr) -> bool {
        let mut map = self.inner.write().await;
        match map.remove(addr) {
            Some(device) => {
                info!(addr = %addr, name = %device.name, "Device removed");
                let _ = self.events.send(RegistryEvent::Lost(device));
                true
            }
            None => false,
        }
    }

    /// Evict every device not seen within `max_age`, emitting one `Lost` per
    /// eviction. Returns the evicted devices.
    pub async fn evict_stale(&self, max_age: Duration) -> Vec<Device> {
        let now = Instant::now();
        let mut map = self.inner.write().await;

        let stale: Vec<SocketAddr> = map
            .values()
            .filter(|d| now.saturating_duration_since(d.last_seen) > max_age)
            .map(|d| d.addr)
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for addr in stale {
            if let Some(device) = map.remove(&addr) {
                info!(addr = %addr, name = %device.name, "Device lost");
                let _ = self.events.send(RegistryEvent::Lost(device.clone()));
                evicted.push(device);
            }
        }
        evicted
    }
}
