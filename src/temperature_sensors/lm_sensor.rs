use std::sync::{Arc, LazyLock};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lm_sensors::{
    LMSensors, SubFeatureRef,
    value::{Kind as ValueKind, Value},
};
use log::{debug, info, warn};

use crate::{
    config::SensorCfg,
    sensors::{MovingAverage, Sensor},
};

/// Wrapper for the lm-sensors library instance.
///
/// Needed to implement Send + Sync for the library handle, which does not
/// carry these markers itself.
pub struct LMSensorsRef(pub LMSensors);

// SAFETY: lm-sensors library (>= 3.6) uses internal global mutex for all operations.
// The library is thread-safe but doesn't implement Send/Sync markers.
unsafe impl Send for LMSensorsRef {}
unsafe impl Sync for LMSensorsRef {}

/// Process-wide libsensors handle.
///
/// libsensors keeps global state of its own, so one handle is initialized
/// lazily the first time an lm-sensors sensor is configured. `None` when the
/// library is not available on this system.
pub static LMSENSORS: LazyLock<Option<LMSensorsRef>> =
    LazyLock::new(|| match lm_sensors::Initializer::default().initialize() {
        Ok(sensors) => {
            info!("lm-sensors initialized successfully");
            Some(LMSensorsRef(sensors))
        }
        Err(e) => {
            warn!("lm-sensors not available: {e}");
            None
        }
    });

/// Temperature input resolved from a libsensors chip feature.
pub struct LmSensor {
    id: String,
    subfeature: SubFeatureRef<'static>,
    average: MovingAverage,
}

// SAFETY: libsensors (>= 3.6) guards all sensor access with an internal global mutex.
//         The `SubFeatureRef::value()` call is read-only.
//         Therefore, moving this pointer across threads cannot cause data races.
unsafe impl Send for LmSensor {}
unsafe impl Sync for LmSensor {}

impl LmSensor {
    /// Resolves every lm-sensors entry of `cfg` to its temperature input.
    pub fn discover(lmsensors: &'static LMSensors, cfg: &[&SensorCfg]) -> Result<Vec<Arc<dyn Sensor>>> {
        cfg.iter()
            .filter_map(|c| match c {
                SensorCfg::LmSensors { id, chip, feature } => Some((id, chip, feature)),
                _ => None,
            })
            .map(|(id, chip, feature)| {
                debug!("Discovering LM sensor: chip={chip}, feature={feature}");
                let subfeature = find_temperature_input(lmsensors, chip, feature)
                    .ok_or_else(|| anyhow!("Sensor '{id}': no temperature input for {chip}/{feature}"))?;
                info!("Found LM sensor '{id}' at {chip}/{feature}");

                Ok(Arc::new(LmSensor {
                    id: id.clone(),
                    subfeature,
                    average: MovingAverage::default(),
                }) as Arc<dyn Sensor>)
            })
            .collect()
    }
}

fn find_temperature_input(
    lmsensors: &'static LMSensors,
    chip: &str,
    feature: &str,
) -> Option<SubFeatureRef<'static>> {
    let chip_ref = lmsensors
        .chip_iter(None)
        .find(|c| c.name().map(|n| n == chip).unwrap_or(false))?;
    let feat_ref = chip_ref.feature_iter().find(|f| {
        f.name()
            .map(|n| n.unwrap_or("N/A"))
            .map(|s| s == feature)
            .unwrap_or(false)
    })?;
    feat_ref
        .sub_feature_iter()
        .find(|s| matches!(s.kind(), Some(ValueKind::TemperatureInput)))
}

#[async_trait]
impl Sensor for LmSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_value(&self) -> Result<f64> {
        match self.subfeature.value()? {
            Value::TemperatureInput(t) => Ok(t * 1000.0),
            _ => Err(anyhow!("Sensor '{}': non-temperature value", self.id)),
        }
    }

    fn moving_avg(&self) -> f64 {
        self.average.get()
    }

    fn set_moving_avg(&self, avg: f64) {
        self.average.set(avg);
    }
}
