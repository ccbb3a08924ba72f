use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};

use super::{Fan, FanProfile, Feature};

/// Fan whose duty cycle lives in a plain file, optionally paired with a
/// file holding its RPM. Useful for custom drivers and for dry runs.
pub struct FileFan {
    profile: FanProfile,
    path: PathBuf,
    rpm_path: Option<PathBuf>,
}

impl FileFan {
    pub fn new(profile: FanProfile, path: PathBuf, rpm_path: Option<PathBuf>) -> Self {
        Self {
            profile,
            path,
            rpm_path,
        }
    }
}

impl Fan for FileFan {
    fn profile(&self) -> &FanProfile {
        &self.profile
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::RpmSensor => self.rpm_path.is_some(),
            Feature::PwmEnable => false,
            Feature::PwmReadback => true,
        }
    }

    fn pwm(&self) -> Result<u8> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        raw.trim()
            .parse()
            .with_context(|| format!("Invalid PWM value in {}", self.path.display()))
    }

    fn set_pwm(&self, pwm: u8) -> Result<()> {
        fs::write(&self.path, pwm.to_string())
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    fn rpm(&self) -> Result<u32> {
        let Some(path) = &self.rpm_path else {
            bail!("Fan '{}' has no RPM file", self.profile.id);
        };
        let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        raw.trim()
            .parse()
            .with_context(|| format!("Invalid RPM value in {}", path.display()))
    }

    fn pwm_enabled(&self) -> Result<i32> {
        bail!("Fan '{}' has no control mode", self.profile.id)
    }

    fn set_pwm_enabled(&self, _mode: i32) -> Result<()> {
        bail!("Fan '{}' has no control mode", self.profile.id)
    }
}
