use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use super::{Fan, FanProfile, Feature};

/// Fan driven through hwmon sysfs entries (`pwmN`, `pwmN_enable`, `fanN_input`).
pub struct HwmonFan {
    profile: FanProfile,
    pwm_path: PathBuf,
    pwm_enable_path: PathBuf,
    rpm_path: Option<PathBuf>,
}

impl HwmonFan {
    /// Creates the fan; `pwm_enable_path` defaults to `<pwm_path>_enable`.
    pub fn new(
        profile: FanProfile,
        pwm_path: PathBuf,
        pwm_enable_path: Option<PathBuf>,
        rpm_path: Option<PathBuf>,
    ) -> Self {
        let pwm_enable_path = pwm_enable_path.unwrap_or_else(|| {
            let mut name = pwm_path.clone().into_os_string();
            name.push("_enable");
            PathBuf::from(name)
        });

        Self {
            profile,
            pwm_path,
            pwm_enable_path,
            rpm_path,
        }
    }
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("Unexpected content in {}: '{}'", path.display(), raw.trim()))
}

fn write_number(path: &Path, value: impl std::fmt::Display) -> Result<()> {
    fs::write(path, value.to_string()).with_context(|| format!("Failed to write {}", path.display()))
}

impl Fan for HwmonFan {
    fn profile(&self) -> &FanProfile {
        &self.profile
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::RpmSensor => self.rpm_path.is_some(),
            Feature::PwmEnable => self.pwm_enable_path.exists(),
            Feature::PwmReadback => true,
        }
    }

    fn pwm(&self) -> Result<u8> {
        read_number(&self.pwm_path)
    }

    fn set_pwm(&self, pwm: u8) -> Result<()> {
        write_number(&self.pwm_path, pwm)
    }

    fn rpm(&self) -> Result<u32> {
        let path = self
            .rpm_path
            .as_deref()
            .with_context(|| format!("Fan '{}' has no RPM input", self.profile.id))?;
        read_number(path)
    }

    fn pwm_enabled(&self) -> Result<i32> {
        read_number(&self.pwm_enable_path)
    }

    fn set_pwm_enabled(&self, mode: i32) -> Result<()> {
        write_number(&self.pwm_enable_path, mode)
    }
}
