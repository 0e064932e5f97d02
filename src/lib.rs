pub mod cache;
pub mod capture;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod events;
pub mod geo;
pub mod identify;
pub mod retention;
pub mod threat;

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::capture::FlowEngine;
use crate::config::AppConfig;
use crate::devices::DeviceRegistry;
use crate::events::EventHub;
use crate::geo::{GeoLookup, NoGeo};
use crate::identify::EnhancedIdentifier;
use crate::threat::ThreatScorer;

/// All long-lived services, assembled once at startup and torn down on
/// shutdown. There are no process-wide singletons; everything reachable from
/// here is reachable only from here.
pub struct Services {
    pub config: AppConfig,
    pub db: SqlitePool,
    pub hub: Arc<EventHub>,
    pub identifier: Arc<EnhancedIdentifier>,
    pub registry: Arc<DeviceRegistry>,
    pub scorer: Arc<ThreatScorer>,
    pub engine: FlowEngine,
}

impl Services {
    /// Build the service container: open the database (running migrations),
    /// then wire the registry, scorer and engine together through the event
    /// hub. No capture is started yet.
    pub async fn build(config: AppConfig) -> Result<Self> {
        Self::build_with_geo(config, Arc::new(NoGeo)).await
    }

    /// Same as [`Services::build`] but with a caller-supplied geolocation
    /// backend.
    pub async fn build_with_geo(
        config: AppConfig,
        geo: Arc<dyn GeoLookup>,
    ) -> Result<Self> {
        let pool = db::init(&config.db_path).await?;
        info!(path = %config.db_path, "Database initialized");

        let hub = EventHub::new();
        let identifier = Arc::new(EnhancedIdentifier::new(config.identify.clone()));
        let registry = Arc::new(DeviceRegistry::new(
            pool.clone(),
            hub.clone(),
            identifier.clone(),
        ));
        let scorer = Arc::new(ThreatScorer::new(pool.clone(), hub.clone()));
        let engine = FlowEngine::new(
            config.capture.clone(),
            pool.clone(),
            registry.clone(),
            scorer.clone(),
            identifier.clone(),
            geo,
            hub.clone(),
        );

        Ok(Self {
            config,
            db: pool,
            hub,
            identifier,
            registry,
            scorer,
            engine,
        })
    }
}
