use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState, providers::traits::ServiceProvider, sensors::Sensor,
    smoothing::update_moving_avg, task_manager::TaskManager,
};

/// Temperature sampling service provider.
///
/// Spawns one task per registered sensor. Each task polls its sensor and
/// folds the readings into the sensor's moving average, which is all the
/// curves ever look at.
///
/// # Priority and Criticality
///
/// - **Priority**: 10 (highest, averages must exist before fans start)
/// - **Critical**: Yes
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use fanwarden::providers::SensorMonitorServiceProvider;
/// use fanwarden::app_context::AppState;
///
/// # async fn example(state: Arc<AppState>) -> anyhow::Result<()> {
/// let provider = SensorMonitorServiceProvider::new(state);
/// // Use with TaskManager to start the service
/// # Ok(())
/// # }
/// ```
pub struct SensorMonitorServiceProvider {
    state: Arc<AppState>,
}

impl SensorMonitorServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for SensorMonitorServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let (poll, window) = {
            let config = self.state.config().await;
            (
                Duration::from_millis(config.temp_sensor_poll_rate_ms),
                config.temp_rolling_window_size.max(1),
            )
        };

        for sensor in self.state.registry.sensors() {
            task_manager
                .spawn_task(format!("sensor:{}", sensor.id()), move |cancel_token| {
                    run_sensor_sampler(sensor, poll, window, cancel_token)
                })
                .await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SensorMonitorService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}

/// Polls `sensor` until cancelled.
///
/// The first successful reading seeds the average; later readings are
/// folded in with a window of `window` samples. Failed reads keep the
/// previous average.
pub async fn run_sensor_sampler(
    sensor: Arc<dyn Sensor>,
    poll: Duration,
    window: usize,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut ticks = interval(poll);
    let mut seeded = false;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Sensor '{}' sampling cancelled", sensor.id());
                break;
            }
            _instant = ticks.tick() => match sensor.read_value().await {
                Ok(value) => {
                    let avg = if seeded {
                        update_moving_avg(sensor.moving_avg(), window, value)
                    } else {
                        seeded = true;
                        value
                    };
                    sensor.set_moving_avg(avg);
                    debug!("Sensor '{}': {value} (avg {avg:.0})", sensor.id());
                }
                Err(e) => warn!("Sensor '{}': read failed: {e:#}", sensor.id()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, ConfigManager},
        persistence::MemoryPersistence,
        registry::Registry,
        testing::FakeSensor,
    };
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn first_reading_seeds_then_smooths() {
        let sensor = FakeSensor::new("cpu", 0.0);
        sensor.set_reading(50_000.0);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sensor_sampler(
            sensor.clone(),
            Duration::from_millis(100),
            2,
            cancel.clone(),
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(sensor.moving_avg(), 50_000.0);

        sensor.set_reading(60_000.0);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(sensor.moving_avg(), 55_000.0);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reads_keep_previous_average() {
        let sensor = FakeSensor::new("cpu", 42_000.0);
        sensor.fail_reads("EIO");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sensor_sampler(
            sensor.clone(),
            Duration::from_millis(100),
            4,
            cancel.clone(),
        ));

        sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(sensor.moving_avg(), 42_000.0);
    }

    #[tokio::test]
    async fn spawns_one_task_per_sensor() {
        let registry = Registry::new();
        registry.register_sensor(FakeSensor::with_avg("cpu", 0.0)).unwrap();
        registry.register_sensor(FakeSensor::with_avg("gpu", 0.0)).unwrap();
        let state = Arc::new(AppState::from_parts(
            ConfigManager::new(Config::default(), PathBuf::from("/tmp/test.yml")),
            Arc::new(registry),
            Vec::new(),
            Arc::new(MemoryPersistence::new()),
        ));
        let mut manager = TaskManager::new();

        SensorMonitorServiceProvider::new(state)
            .start(&mut manager)
            .await
            .unwrap();

        assert!(manager.is_running("sensor:cpu"));
        assert!(manager.is_running("sensor:gpu"));
        manager.shutdown_all().await.unwrap();
    }
}
