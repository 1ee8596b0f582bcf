use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::{DeviceClient, DeviceRegistry, Result};

/// Shared handles for one run of the application.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: DeviceRegistry,
    pub client: Arc<dyn DeviceClient>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self> {
        let client = adapters::get_client(&config)?;
        let registry = DeviceRegistry::with_event_capacity(config.discovery.event_capacity);
        Ok(Self {
            config: Arc::new(config),
            registry,
            client,
        })
    }
}
