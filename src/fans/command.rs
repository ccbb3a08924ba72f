use anyhow::{Context, Result, bail};

use super::{Fan, FanProfile, Feature};
use crate::exec::{DEFAULT_TIMEOUT, ExecCfg};

/// Placeholder replaced by the duty cycle in `set_pwm` arguments.
pub const PWM_PLACEHOLDER: &str = "%pwm%";

/// Fan controlled by external programs.
pub struct CmdFan {
    profile: FanProfile,
    set_pwm: ExecCfg,
    get_pwm: Option<ExecCfg>,
    get_rpm: Option<ExecCfg>,
}

impl CmdFan {
    pub fn new(
        profile: FanProfile,
        set_pwm: ExecCfg,
        get_pwm: Option<ExecCfg>,
        get_rpm: Option<ExecCfg>,
    ) -> Self {
        Self {
            profile,
            set_pwm,
            get_pwm,
            get_rpm,
        }
    }
}

impl Fan for CmdFan {
    fn profile(&self) -> &FanProfile {
        &self.profile
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::RpmSensor => self.get_rpm.is_some(),
            Feature::PwmEnable => false,
            Feature::PwmReadback => self.get_pwm.is_some(),
        }
    }

    fn pwm(&self) -> Result<u8> {
        let Some(cmd) = &self.get_pwm else {
            bail!("Fan '{}' has no get_pwm command", self.profile.id);
        };
        let out = cmd.run(DEFAULT_TIMEOUT)?;
        out.parse()
            .with_context(|| format!("get_pwm printed '{out}'"))
    }

    fn set_pwm(&self, pwm: u8) -> Result<()> {
        self.set_pwm
            .run_with(PWM_PLACEHOLDER, &pwm.to_string(), DEFAULT_TIMEOUT)
            .map(|_| ())
    }

    fn rpm(&self) -> Result<u32> {
        let Some(cmd) = &self.get_rpm else {
            bail!("Fan '{}' has no get_rpm command", self.profile.id);
        };
        let out = cmd.run(DEFAULT_TIMEOUT)?;
        out.parse()
            .with_context(|| format!("get_rpm printed '{out}'"))
    }

    fn pwm_enabled(&self) -> Result<i32> {
        bail!("Fan '{}' has no control mode", self.profile.id)
    }

    fn set_pwm_enabled(&self, _mode: i32) -> Result<()> {
        bail!("Fan '{}' has no control mode", self.profile.id)
    }
}
