//! Lookup tables for sensors and speed curves.
//!
//! Both tables are filled once at startup and only read afterwards. The
//! registry is constructed explicitly and handed to every controller, so
//! tests can build isolated registries of their own.

use std::sync::Arc;

use anyhow::{Result, bail};
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{fan_curve::SpeedCurve, sensors::Sensor};

/// Append-once registry of sensors and curves keyed by id.
#[derive(Default)]
pub struct Registry {
    sensors: DashMap<String, Arc<dyn Sensor>>,
    curves: DashMap<String, Arc<SpeedCurve>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sensor. Ids may be registered only once.
    pub fn register_sensor(&self, sensor: Arc<dyn Sensor>) -> Result<()> {
        match self.sensors.entry(sensor.id().to_string()) {
            Entry::Occupied(entry) => bail!("Sensor '{}' is already registered", entry.key()),
            Entry::Vacant(entry) => {
                entry.insert(sensor);
                Ok(())
            }
        }
    }

    /// Registers a curve. Ids may be registered only once.
    pub fn register_curve(&self, curve: SpeedCurve) -> Result<()> {
        match self.curves.entry(curve.id().to_string()) {
            Entry::Occupied(entry) => bail!("Curve '{}' is already registered", entry.key()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(curve));
                Ok(())
            }
        }
    }

    pub fn sensor(&self, id: &str) -> Option<Arc<dyn Sensor>> {
        self.sensors.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn curve(&self, id: &str) -> Option<Arc<SpeedCurve>> {
        self.curves.get(id).map(|c| Arc::clone(c.value()))
    }

    /// All registered sensors, in no particular order.
    pub fn sensors(&self) -> Vec<Arc<dyn Sensor>> {
        self.sensors.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// All registered curves, sorted by id.
    pub fn curves(&self) -> Vec<Arc<SpeedCurve>> {
        let mut curves: Vec<_> = self.curves.iter().map(|c| Arc::clone(c.value())).collect();
        curves.sort_by(|a, b| a.id().cmp(b.id()));
        curves
    }
}
