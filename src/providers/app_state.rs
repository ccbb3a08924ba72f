//! Application state provider for dependency injection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::{app_context::AppState, config::ConfigManager, providers::traits::AsyncProvider};

/// Provider building the application state from a validated configuration.
pub struct AppStateProvider {
    config_manager: ConfigManager,
}

impl AppStateProvider {
    pub const fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }
}

#[async_trait]
impl AsyncProvider<Arc<AppState>> for AppStateProvider {
    async fn provide(&self) -> Result<Arc<AppState>> {
        self.config_manager
            .validate()
            .await
            .context("Refusing to start with an invalid configuration")?;
        let app_state = AppState::new(self.config_manager.clone()).await?;
        Ok(Arc::new(app_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CurveCfg};
    use std::path::PathBuf;

    #[tokio::test]
    async fn invalid_configuration_is_rejected() {
        let config = Config {
            curves: vec![CurveCfg::Linear {
                id: "c".into(),
                sensor: "missing".into(),
                min: Some(40.0),
                max: Some(80.0),
                steps: None,
            }],
            ..Default::default()
        };
        let provider = AppStateProvider::new(ConfigManager::new(config, PathBuf::from("/tmp/x.yml")));

        let err = provider.provide().await.err().unwrap();
        assert!(format!("{err:#}").contains("missing"));
    }

    #[tokio::test]
    async fn empty_configuration_builds_empty_state() {
        let provider = AppStateProvider::new(ConfigManager::new(
            Config::default(),
            PathBuf::from("/tmp/x.yml"),
        ));

        let state = provider.provide().await.unwrap();
        assert!(state.fans.is_empty());
        assert!(state.registry.curves().is_empty());
    }
}
