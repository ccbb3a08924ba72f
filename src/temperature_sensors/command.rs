use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::{
    exec::{DEFAULT_TIMEOUT, ExecCfg},
    sensors::{MovingAverage, Sensor, parse_reading},
};

/// Sensor whose value is printed by an external program.
pub struct CmdSensor {
    id: String,
    command: ExecCfg,
    average: MovingAverage,
}

impl CmdSensor {
    pub fn new(id: String, command: ExecCfg) -> Self {
        Self {
            id,
            command,
            average: MovingAverage::default(),
        }
    }
}

#[async_trait]
impl Sensor for CmdSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_value(&self) -> Result<f64> {
        let command = self.command.clone();
        let raw = tokio::task::spawn_blocking(move || command.run(DEFAULT_TIMEOUT))
            .await
            .context("Sensor command task panicked")??;
        parse_reading(&raw)
    }

    fn moving_avg(&self) -> f64 {
        self.average.get()
    }

    fn set_moving_avg(&self, avg: f64) {
        self.average.set(avg);
    }
}
