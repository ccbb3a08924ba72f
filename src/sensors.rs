//! Temperature sensor contract.
//!
//! A sensor is read by its own sampling task, which folds each reading into
//! the sensor's moving average. Curves only ever look at that average.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;

/// A labelled temperature source, in milli-degrees Celsius.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Unique identifier used by curves to reference this sensor.
    fn id(&self) -> &str;

    /// Performs an instantaneous hardware read.
    async fn read_value(&self) -> Result<f64>;

    /// Returns the current moving average.
    fn moving_avg(&self) -> f64;

    /// Replaces the moving average. Only the sampling task calls this.
    fn set_moving_avg(&self, avg: f64);
}

/// Lock-free `f64` cell backing a sensor's moving average.
#[derive(Debug, Default)]
pub struct MovingAverage(AtomicU64);

impl MovingAverage {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Parses a numeric reading as printed by sysfs files or commands.
pub(crate) fn parse_reading(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    trimmed
        .parse::<f64>()
        .map_err(|e| anyhow::anyhow!("invalid sensor reading '{trimmed}': {e}"))
}
