//! Shared server state — connection registry plus the persistence gateway.

use std::sync::Arc;

use crate::config::Config;
use crate::gateway::SessionGateway;
use crate::registry::ConnectionRegistry;

/// Shared state accessible from all handlers. One per server; tests build
/// as many independent instances as they like.
pub struct AppState {
    pub gateway: SessionGateway,
    /// Live WebSocket connections keyed by connection id.
    pub registry: ConnectionRegistry,
    pub config: Config,
}

impl AppState {
    pub fn new(gateway: SessionGateway, config: Config) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            registry: ConnectionRegistry::new(),
            config,
        })
    }
}
