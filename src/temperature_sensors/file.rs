use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::sensors::{MovingAverage, Sensor, parse_reading};

/// Sensor backed by a file holding a single number, such as an hwmon
/// `tempN_input` entry (milli-degrees Celsius).
pub struct FileSensor {
    id: String,
    path: PathBuf,
    average: MovingAverage,
}

impl FileSensor {
    pub fn new(id: String, path: PathBuf) -> Self {
        Self {
            id,
            path,
            average: MovingAverage::default(),
        }
    }
}

#[async_trait]
impl Sensor for FileSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_value(&self) -> Result<f64> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read sensor file {}", self.path.display()))?;
        parse_reading(&raw)
    }

    fn moving_avg(&self) -> f64 {
        self.average.get()
    }

    fn set_moving_avg(&self, avg: f64) {
        self.average.set(avg);
    }
}
