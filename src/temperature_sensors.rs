//! Temperature sensor back-ends.

pub mod command;
pub mod file;
pub mod lm_sensor;

use std::sync::Arc;

use anyhow::Result;

use crate::{config::SensorCfg, sensors::Sensor};

/// Builds every configured sensor.
///
/// lm-sensors entries are resolved against the system's chips; an entry
/// that cannot be found is an error, as curves referencing it could never
/// be evaluated.
pub fn build_sensors(cfg: &[SensorCfg]) -> Result<Vec<Arc<dyn Sensor>>> {
    let mut sensors: Vec<Arc<dyn Sensor>> = Vec::with_capacity(cfg.len());

    for sensor_cfg in cfg {
        match sensor_cfg {
            SensorCfg::File { id, path } => {
                sensors.push(Arc::new(file::FileSensor::new(id.clone(), path.clone())));
            }
            SensorCfg::Cmd { id, command } => {
                sensors.push(Arc::new(command::CmdSensor::new(
                    id.clone(),
                    command.clone(),
                )));
            }
            SensorCfg::LmSensors { .. } => {}
        }
    }

    let lm_cfg: Vec<&SensorCfg> = cfg
        .iter()
        .filter(|c| matches!(c, SensorCfg::LmSensors { .. }))
        .collect();
    if !lm_cfg.is_empty() {
        match lm_sensor::LMSENSORS.as_ref() {
            Some(lms) => sensors.extend(lm_sensor::LmSensor::discover(&lms.0, &lm_cfg)?),
            None => anyhow::bail!(
                "{} lm-sensors sensor(s) configured but libsensors is unavailable",
                lm_cfg.len()
            ),
        }
    }

    Ok(sensors)
}
