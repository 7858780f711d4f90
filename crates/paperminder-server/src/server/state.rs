use std::sync::Arc;
use std::time::Duration;

use paperminder_core::ServerConfig;

use crate::delivery::DeliveryEngine;
use crate::firmware::FirmwareCatalog;
use crate::registry::ConnectionRegistry;
use crate::rollout::RolloutOrchestrator;
use crate::storage::Database;
use crate::updates::UpdateTracker;

/// Shared application state, cloned into every handler and session.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<ServerConfig>,
    pub registry: ConnectionRegistry,
    pub delivery: DeliveryEngine,
    pub catalog: FirmwareCatalog,
    pub tracker: UpdateTracker,
    pub orchestrator: RolloutOrchestrator,
}

impl AppState {
    /// Wire up every component around one database and one registry.
    pub fn new(db: Database, config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let registry = ConnectionRegistry::new(Duration::from_secs(config.write_timeout_secs));
        let delivery = DeliveryEngine::new(db.clone(), registry.clone());
        let catalog = FirmwareCatalog::new(db.clone(), Arc::clone(&config));
        let tracker = UpdateTracker::new(db.clone(), catalog.clone());
        let orchestrator = RolloutOrchestrator::new(
            db.clone(),
            catalog.clone(),
            delivery.clone(),
            tracker.clone(),
        );

        Self {
            db,
            config,
            registry,
            delivery,
            catalog,
            tracker,
            orchestrator,
        }
    }
}
