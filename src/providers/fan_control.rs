use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    event::{Event, EventBus},
    fan_controller::{ControllerSettings, FanController},
    fans::Fan,
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Fan control service provider.
///
/// Spawns one supervised [`FanController`] per configured fan. Fans are
/// isolated from each other: a failing controller is restarted after a
/// back-off when its error is recoverable, and abandoned otherwise, without
/// touching any other fan.
///
/// # Priority and Criticality
///
/// - **Priority**: 5
/// - **Critical**: Yes
pub struct FanControlServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl FanControlServiceProvider {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl ServiceProvider for FanControlServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let (settings, restart_delay, parallel) = {
            let config = self.state.config().await;
            (
                ControllerSettings::from(&*config),
                Duration::from_secs(config.restart_delay_seconds),
                config.run_fan_initialization_in_parallel,
            )
        };
        let calibration_lock = (!parallel).then(|| Arc::new(Mutex::new(())));

        for fan in &self.state.fans {
            let supervisor = FanSupervisor {
                fan: Arc::clone(fan),
                state: Arc::clone(&self.state),
                event_bus: self.event_bus.clone(),
                settings: settings.clone(),
                restart_delay,
                calibration_lock: calibration_lock.clone(),
            };
            task_manager
                .spawn_task(format!("fan:{}", fan.id()), move |cancel_token| {
                    supervisor.run(cancel_token)
                })
                .await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FanControlService"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn is_critical(&self) -> bool {
        true
    }
}

/// Restarts one fan's controller after recoverable failures.
pub struct FanSupervisor {
    pub fan: Arc<dyn Fan>,
    pub state: Arc<AppState>,
    pub event_bus: EventBus,
    pub settings: ControllerSettings,
    pub restart_delay: Duration,
    pub calibration_lock: Option<Arc<Mutex<()>>>,
}

impl FanSupervisor {
    pub async fn run(self, cancel_token: CancellationToken) -> Result<()> {
        let id = self.fan.id().to_string();

        loop {
            let mut controller = FanController::new(
                Arc::clone(&self.fan),
                Arc::clone(&self.state.registry),
                Arc::clone(&self.state.persistence),
                self.settings.clone(),
            );
            if let Some(lock) = &self.calibration_lock {
                controller = controller.with_calibration_lock(Arc::clone(lock));
            }
            self.state.snapshots.insert(id.clone(), controller.subscribe());

            let error = match controller.run(cancel_token.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => e,
                Err(e) => {
                    error!("Fan '{id}': giving up: {e}");
                    self.event_bus
                        .publish(Event::FanControllerExited {
                            fan: id.clone(),
                            error: Some(e.to_string()),
                        })
                        .ok();
                    return Ok(());
                }
            };

            warn!("Fan '{id}': {error}; restarting in {:?}", self.restart_delay);
            tokio::select! {
                () = cancel_token.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.restart_delay) => info!("Fan '{id}': restarting controller"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, ConfigManager},
        fan_controller::ControllerState,
        fans::{FanProfile, test_profile},
        persistence::MemoryPersistence,
        registry::Registry,
        testing::FakeFan,
    };
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tokio::time::sleep;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            startup_delay: Duration::from_millis(100),
            pwm_set_delay: Duration::from_millis(1),
            ..ControllerSettings::default()
        }
    }

    fn state_with(fan: Arc<dyn Fan>) -> Arc<AppState> {
        Arc::new(AppState::from_parts(
            ConfigManager::new(Config::default(), PathBuf::from("/tmp/test.yml")),
            Arc::new(Registry::new()),
            vec![fan],
            Arc::new(MemoryPersistence::new()),
        ))
    }

    fn supervisor(fan: Arc<dyn Fan>, event_bus: EventBus) -> FanSupervisor {
        FanSupervisor {
            state: state_with(Arc::clone(&fan)),
            fan,
            event_bus,
            settings: settings(),
            restart_delay: Duration::from_secs(1),
            calibration_lock: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_failures_restart_the_controller() {
        let fan = Arc::new(FakeFan::new(test_profile("cpu")));
        fan.update(|s| s.fail_writes = true);
        let sup = supervisor(fan.clone(), EventBus::new());
        let state = Arc::clone(&sup.state);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sup.run(cancel.clone()));

        sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // every attempt switches to manual mode and restores afterwards
        let attempts = fan.state().mode_writes.len() / 2;
        assert!(attempts >= 3, "only {attempts} attempts");
        assert_eq!(fan.state().enabled, 2);
        assert_eq!(
            state.snapshots.get("cpu").unwrap().borrow().state,
            ControllerState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_publishes_exit_and_stops() {
        let profile = FanProfile {
            curve: "ghost".into(),
            ..test_profile("cpu")
        };
        let fan = Arc::new(FakeFan::new(profile).without(crate::fans::Feature::RpmSensor));
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();

        supervisor(fan.clone(), event_bus)
            .run(CancellationToken::new())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            Event::FanControllerExited { fan, error } => {
                assert_eq!(fan, "cpu");
                assert!(error.unwrap().contains("ghost"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(fan.state().mode_writes, vec![1, 2]);
    }

    #[tokio::test]
    async fn serial_calibration_shares_one_lock() {
        let fans: Vec<Arc<dyn Fan>> = vec![
            Arc::new(FakeFan::new(test_profile("a"))),
            Arc::new(FakeFan::new(test_profile("b"))),
        ];
        let config = Config {
            run_fan_initialization_in_parallel: false,
            ..Default::default()
        };
        let state = Arc::new(AppState::from_parts(
            ConfigManager::new(config, PathBuf::from("/tmp/test.yml")),
            Arc::new(Registry::new()),
            fans,
            Arc::new(MemoryPersistence::new()),
        ));
        let mut manager = TaskManager::new();

        FanControlServiceProvider::new(state, EventBus::new())
            .start(&mut manager)
            .await
            .unwrap();

        assert_eq!(manager.active_count(), 2);
        assert!(manager.is_running("fan:a"));
        manager.shutdown_all().await.unwrap();
    }
}
