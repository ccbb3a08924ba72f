//! Classified failures of the fan control engine.

use thiserror::Error;

/// Failure raised by a fan controller.
///
/// Back-ends report plain [`anyhow::Error`]s; the controller wraps them into
/// one of these variants so the supervisor can decide whether to restart.
#[derive(Debug, Error)]
pub enum ControlError {
    /// A read or write on the fan hardware failed.
    #[error("fan '{fan}': hardware I/O failed during {operation}")]
    HardwareIo {
        fan: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A write succeeded but reading it back disagrees.
    #[error("fan '{fan}': {what} (expected {expected}, read back {actual})")]
    VerificationMismatch {
        fan: String,
        what: &'static str,
        expected: i32,
        actual: i32,
    },

    /// Calibration could not derive a usable RPM curve.
    #[error("fan '{fan}': calibration incomplete: {reason}")]
    CalibrationIncomplete { fan: String, reason: String },

    /// A never-stop fan stays at zero RPM at its maximum duty cycle.
    #[error("fan '{fan}': RPM average is {rpm_avg} even at PWM {pwm}")]
    NeverStopViolation { fan: String, pwm: u8, rpm_avg: f64 },

    /// A reference the configuration should have rejected was found at runtime.
    #[error("configuration defect: {0}")]
    ConfigurationDefect(String),
}

impl ControlError {
    pub fn hardware(fan: &str, operation: &'static str, source: anyhow::Error) -> Self {
        Self::HardwareIo {
            fan: fan.to_string(),
            operation,
            source,
        }
    }

    /// Whether the controller may be restarted after this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::HardwareIo { .. } | Self::VerificationMismatch { .. }
        )
    }
}
