//! Stateful fakes shared by unit tests.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::{
    fans::{Fan, FanProfile, Feature},
    sensors::{MovingAverage, Sensor},
};

pub struct FakeSensor {
    id: String,
    reading: Mutex<Result<f64, String>>,
    average: MovingAverage,
}

impl FakeSensor {
    /// Sensor whose moving average is already `avg`; reads also return `avg`.
    pub fn with_avg(id: &str, avg: f64) -> Arc<dyn Sensor> {
        Self::new(id, avg)
    }

    pub fn new(id: &str, avg: f64) -> Arc<Self> {
        let sensor = Self {
            id: id.to_string(),
            reading: Mutex::new(Ok(avg)),
            average: MovingAverage::default(),
        };
        sensor.average.set(avg);
        Arc::new(sensor)
    }

    pub fn set_reading(&self, value: f64) {
        *self.reading.lock().unwrap() = Ok(value);
    }

    pub fn fail_reads(&self, message: &str) {
        *self.reading.lock().unwrap() = Err(message.to_string());
    }
}

#[async_trait]
impl Sensor for FakeSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_value(&self) -> Result<f64> {
        match &*self.reading.lock().unwrap() {
            Ok(v) => Ok(*v),
            Err(e) => bail!("{e}"),
        }
    }

    fn moving_avg(&self) -> f64 {
        self.average.get()
    }

    fn set_moving_avg(&self, avg: f64) {
        self.average.set(avg);
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeFanState {
    /// Duty cycle the hardware reports.
    pub pwm: u8,
    pub enabled: i32,
    /// Every requested duty cycle, in order.
    pub writes: Vec<u8>,
    pub mode_writes: Vec<i32>,
    pub fail_writes: bool,
}

/// In-memory fan with configurable quantization and RPM response.
pub struct FakeFan {
    profile: FanProfile,
    features: HashSet<Feature>,
    quantize: fn(u8) -> u8,
    rpm_at: fn(u8) -> u32,
    accepted_modes: Vec<i32>,
    state: Mutex<FakeFanState>,
}

impl FakeFan {
    /// All features, exact duty cycles, stalls below 20 and spins at 10 RPM per step above.
    pub fn new(profile: FanProfile) -> Self {
        Self {
            profile,
            features: [Feature::RpmSensor, Feature::PwmEnable, Feature::PwmReadback]
                .into_iter()
                .collect(),
            quantize: |pwm| pwm,
            rpm_at: |pwm| if pwm < 20 { 0 } else { u32::from(pwm) * 10 },
            accepted_modes: vec![0, 1, 2],
            state: Mutex::new(FakeFanState {
                enabled: 2,
                ..Default::default()
            }),
        }
    }

    pub fn quantize(mut self, f: fn(u8) -> u8) -> Self {
        self.quantize = f;
        self
    }

    pub fn without(mut self, feature: Feature) -> Self {
        self.features.remove(&feature);
        self
    }

    pub fn reject_mode(mut self, mode: i32) -> Self {
        self.accepted_modes.retain(|m| *m != mode);
        self
    }

    pub fn state(&self) -> FakeFanState {
        self.state.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut FakeFanState)) {
        f(&mut self.state.lock().unwrap());
    }
}

impl Fan for FakeFan {
    fn profile(&self) -> &FanProfile {
        &self.profile
    }

    fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    fn pwm(&self) -> Result<u8> {
        Ok(self.state.lock().unwrap().pwm)
    }

    fn set_pwm(&self, pwm: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            bail!("write failed");
        }
        state.writes.push(pwm);
        state.pwm = (self.quantize)(pwm);
        Ok(())
    }

    fn rpm(&self) -> Result<u32> {
        if !self.supports(Feature::RpmSensor) {
            bail!("no tachometer");
        }
        Ok((self.rpm_at)(self.state.lock().unwrap().pwm))
    }

    fn pwm_enabled(&self) -> Result<i32> {
        Ok(self.state.lock().unwrap().enabled)
    }

    fn set_pwm_enabled(&self, mode: i32) -> Result<()> {
        if !self.accepted_modes.contains(&mode) {
            bail!("mode {mode} rejected");
        }
        let mut state = self.state.lock().unwrap();
        state.enabled = mode;
        state.mode_writes.push(mode);
        Ok(())
    }
}
