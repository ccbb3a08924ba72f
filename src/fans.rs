//! Fan hardware contract and back-ends.
//!
//! Hardware access is synchronous: sysfs reads and writes return quickly,
//! and command back-ends bound every invocation with a timeout. Keeping the
//! trait synchronous also lets the controller restore a fan from a scope
//! guard, which cannot await.

pub mod command;
pub mod file;
pub mod hwmon;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{config::FanCfg, control_loop::ControlLoopCfg};

/// `pwm_enable` value selecting manual duty-cycle control.
pub const PWM_ENABLE_MANUAL: i32 = 1;

/// Fallback `pwm_enable` value for drivers rejecting [`PWM_ENABLE_MANUAL`].
pub const PWM_ENABLE_DISABLED: i32 = 0;

/// Highest duty cycle a fan accepts.
pub const MAX_PWM: u8 = 255;

/// Optional capabilities of a fan back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// The back-end can read the tachometer.
    RpmSensor,
    /// The back-end exposes a `pwm_enable` style control mode.
    PwmEnable,
    /// Written duty cycles can be read back for verification.
    PwmReadback,
}

/// Static, configuration-derived settings of one fan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanProfile {
    pub id: String,
    pub curve: String,
    pub never_stop: bool,
    pub min_pwm: Option<u8>,
    pub start_pwm: Option<u8>,
    pub max_pwm: Option<u8>,
    pub control_loop: ControlLoopCfg,
}

impl From<&FanCfg> for FanProfile {
    fn from(cfg: &FanCfg) -> Self {
        Self {
            id: cfg.id.clone(),
            curve: cfg.curve.clone(),
            never_stop: cfg.never_stop,
            min_pwm: cfg.min_pwm,
            start_pwm: cfg.start_pwm,
            max_pwm: cfg.max_pwm,
            control_loop: cfg.control_loop.clone(),
        }
    }
}

/// A controllable fan.
///
/// Back-ends (hwmon sysfs, plain files, external commands) look identical
/// to the controller through this trait.
#[cfg_attr(test, mockall::automock)]
pub trait Fan: Send + Sync {
    fn profile(&self) -> &FanProfile;

    fn supports(&self, feature: Feature) -> bool;

    /// Reads the current duty cycle.
    fn pwm(&self) -> Result<u8>;

    fn set_pwm(&self, pwm: u8) -> Result<()>;

    /// Reads the tachometer.
    fn rpm(&self) -> Result<u32>;

    fn pwm_enabled(&self) -> Result<i32>;

    fn set_pwm_enabled(&self, mode: i32) -> Result<()>;
}

impl dyn Fan {
    pub fn id(&self) -> &str {
        &self.profile().id
    }

    pub fn curve_id(&self) -> &str {
        &self.profile().curve
    }

    pub fn should_never_stop(&self) -> bool {
        self.profile().never_stop
    }
}

/// Builds the back-end selected by a fan's configuration.
pub fn build_fan(cfg: &FanCfg) -> Arc<dyn Fan> {
    use crate::config::FanBackendCfg;

    let profile = FanProfile::from(cfg);
    match &cfg.backend {
        FanBackendCfg::Hwmon {
            pwm_path,
            pwm_enable_path,
            rpm_path,
        } => Arc::new(hwmon::HwmonFan::new(
            profile,
            pwm_path.clone(),
            pwm_enable_path.clone(),
            rpm_path.clone(),
        )),
        FanBackendCfg::File { path, rpm_path } => {
            Arc::new(file::FileFan::new(profile, path.clone(), rpm_path.clone()))
        }
        FanBackendCfg::Cmd {
            set_pwm,
            get_pwm,
            get_rpm,
        } => Arc::new(command::CmdFan::new(
            profile,
            set_pwm.clone(),
            get_pwm.clone(),
            get_rpm.clone(),
        )),
    }
}

#[cfg(test)]
pub(crate) fn test_profile(id: &str) -> FanProfile {
    FanProfile {
        id: id.to_string(),
        curve: "curve".to_string(),
        never_stop: false,
        min_pwm: None,
        start_pwm: None,
        max_pwm: None,
        control_loop: ControlLoopCfg::default(),
    }
}
