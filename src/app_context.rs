//! Application state shared by all services.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::info;
use tokio::sync::watch;

use crate::{
    config::{Config, ConfigManager},
    fan_controller::FanSnapshot,
    fan_curve::SpeedCurve,
    fans::{self, Fan},
    persistence::{JsonFilePersistence, Persistence},
    registry::Registry,
    temperature_sensors,
};

/// Shared application state.
///
/// Everything here is built once at startup. Controllers own their fan's
/// runtime state; other services only see the published snapshots.
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    /// Sensors and curves, looked up by id.
    pub registry: Arc<Registry>,
    pub fans: Vec<Arc<dyn Fan>>,
    pub persistence: Arc<dyn Persistence>,
    /// Latest snapshot of every running fan controller, by fan id.
    pub snapshots: DashMap<String, watch::Receiver<FanSnapshot>>,
}

impl AppState {
    /// Builds sensors, curves, fans and the persistence store from the
    /// validated configuration.
    pub async fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.clone_config().await;

        let registry = build_registry(&config)?;
        let fans: Vec<Arc<dyn Fan>> = config.fans.iter().map(fans::build_fan).collect();
        let persistence = Arc::new(JsonFilePersistence::new(&config.db_path));
        info!(
            "Loaded {} fans, {} sensors, {} curves; data in {}",
            fans.len(),
            config.sensors.len(),
            config.curves.len(),
            persistence.path().display()
        );

        Ok(Self::from_parts(
            config_manager,
            Arc::new(registry),
            fans,
            persistence,
        ))
    }

    /// Assembles state from already built parts.
    pub fn from_parts(
        config_manager: ConfigManager,
        registry: Arc<Registry>,
        fans: Vec<Arc<dyn Fan>>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            config_manager: Arc::new(config_manager),
            registry,
            fans,
            persistence,
            snapshots: DashMap::new(),
        }
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn fan(&self, id: &str) -> Option<Arc<dyn Fan>> {
        self.fans.iter().find(|fan| fan.id() == id).cloned()
    }

    /// Current snapshots of all running controllers, sorted by fan id.
    pub fn fan_snapshots(&self) -> Vec<FanSnapshot> {
        let mut snapshots: Vec<FanSnapshot> = self
            .snapshots
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }
}

/// Registers every configured sensor and curve.
pub fn build_registry(config: &Config) -> Result<Registry> {
    let registry = Registry::new();
    for sensor in temperature_sensors::build_sensors(&config.sensors)
        .context("Failed to initialize temperature sensors")?
    {
        registry.register_sensor(sensor)?;
    }
    for curve in &config.curves {
        registry.register_curve(SpeedCurve::from(curve))?;
    }
    Ok(registry)
}
