//! System coordinator for managing service lifecycle and dependency injection.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    app_context::AppState,
    config::ConfigManager,
    event::{Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, FanControlServiceProvider, SensorMonitorServiceProvider,
        ServiceProvider,
    },
    task_manager::TaskManager,
};

/// Manages the lifecycle of every service.
///
/// Sensors are sampled before any fan controller starts so curves never
/// evaluate against an empty average. Shutdown cancels all controllers,
/// each of which hands its fan back to the firmware before exiting.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCoordinator {
    pub fn new() -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus: EventBus::new(),
            shared_state: None,
            service_providers: Vec::new(),
        }
    }

    /// Builds the shared state and registers all service providers.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let state = AppStateProvider::new(config_manager)
            .provide()
            .await
            .context("Failed to initialize application state")?;
        self.shared_state = Some(Arc::clone(&state));

        self.register_service_providers(state);

        info!("SystemCoordinator initialization completed");
        Ok(())
    }

    fn register_service_providers(&mut self, state: Arc<AppState>) {
        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(SensorMonitorServiceProvider::new(Arc::clone(&state))),
            Box::new(FanControlServiceProvider::new(
                state,
                self.event_bus.clone(),
            )),
        ];

        providers.sort_by_key(|b| std::cmp::Reverse(b.priority()));
        self.service_providers = providers;

        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );
    }

    /// Starts all registered services in priority order.
    ///
    /// Critical services must start successfully, while non-critical services
    /// can fail without stopping the system.
    pub async fn start_all_services(&mut self) -> Result<()> {
        info!(
            "Starting {} services in priority order...",
            self.service_providers.len()
        );

        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => {
                    info!(
                        "Service '{}' started successfully (priority: {}, critical: {})",
                        provider.name(),
                        provider.priority(),
                        is_critical
                    );
                }
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => {
                    warn!(
                        "Non-critical service '{}' failed to start: {e}",
                        provider.name()
                    );
                }
            }
        }

        info!("All critical services started successfully");
        Ok(())
    }

    /// Runs until SIGINT, SIGTERM or a shutdown event, then stops every service.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        bail!("Failed to listen for shutdown signal: {e}");
                    }
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    break;
                }
                event = event_rx.recv() => {
                    if self.handle_event(event)?.is_break() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Main event loop terminated");
        Ok(())
    }

    fn handle_event(
        &self,
        event_result: Result<Event, tokio::sync::broadcast::error::RecvError>,
    ) -> Result<std::ops::ControlFlow<()>> {
        use std::ops::ControlFlow;

        match event_result {
            Ok(Event::FanControllerExited { fan, error }) => {
                match error {
                    Some(e) => warn!("Fan '{fan}' is no longer controlled: {e}"),
                    None => info!("Fan '{fan}' controller exited"),
                }
                if let Some(state) = &self.shared_state {
                    state.snapshots.remove(&fan);
                }
            }
            Ok(Event::SystemShutdown) => {
                info!("Processing SystemShutdown event");
                return Ok(ControlFlow::Break(()));
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                bail!("Event bus channel closed unexpectedly");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event bus lagged by {n} messages");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.task_manager.shutdown_all().await {
            log::error!("Error during task shutdown: {e:#}");
        }

        info!("Shutdown complete");
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn shared_state(&self) -> Option<&Arc<AppState>> {
        self.shared_state.as_ref()
    }

    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config_manager(dir: &TempDir) -> ConfigManager {
        let config = Config {
            db_path: dir.path().join("db.json"),
            ..Default::default()
        };
        ConfigManager::new(config, PathBuf::from("/tmp/test.yml"))
    }

    #[tokio::test]
    async fn registers_services_by_priority() {
        let dir = TempDir::new().unwrap();
        let mut coordinator = SystemCoordinator::new();

        coordinator.initialize(config_manager(&dir)).await.unwrap();

        assert_eq!(
            coordinator.running_services(),
            vec!["SensorMonitorService", "FanControlService"]
        );
        assert!(coordinator.shared_state().is_some());
    }

    #[tokio::test]
    async fn shutdown_event_ends_main_loop() {
        let dir = TempDir::new().unwrap();
        let mut coordinator = SystemCoordinator::new();
        coordinator.initialize(config_manager(&dir)).await.unwrap();
        coordinator.start_all_services().await.unwrap();

        let event_bus = coordinator.event_bus().clone();
        let publisher = tokio::spawn(async move {
            // retry until the main loop has subscribed
            while event_bus.publish(Event::SystemShutdown).is_err() {
                tokio::task::yield_now().await;
            }
        });

        coordinator.run_main_loop().await.unwrap();
        publisher.await.unwrap();
        assert_eq!(coordinator.task_manager.active_count(), 0);
    }

    #[test]
    fn exit_events_keep_loop_running_until_shutdown() {
        let coordinator = SystemCoordinator::new();
        let flow = coordinator
            .handle_event(Ok(Event::FanControllerExited {
                fan: "cpu".into(),
                error: Some("unknown curve".into()),
            }))
            .unwrap();
        assert!(flow.is_continue());

        let flow = coordinator.handle_event(Ok(Event::SystemShutdown)).unwrap();
        assert!(flow.is_break());
    }
}
