//! Control loops that move a fan from its last commanded duty cycle toward a
//! target.
//!
//! Loops keep their own timing state between calls and are driven by exactly
//! one task, so they need no internal synchronization.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Strategy turning a `(target, current)` pair into the next duty cycle.
pub trait ControlLoop: Send + Sync + core::fmt::Debug {
    /// Returns the next duty cycle to command, in `[0, 255]`.
    fn cycle(&mut self, target: u8, current: u8) -> u8;
}

/// Control loop selection as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlLoopCfg {
    /// Rate-limited jump toward the target.
    Direct {
        /// Maximum duty cycle change per second; unlimited when absent.
        #[serde(default)]
        max_change_per_second: Option<f64>,
    },
    /// Classic PID loop on the duty cycle error.
    Pid { p: f64, i: f64, d: f64 },
}

impl Default for ControlLoopCfg {
    fn default() -> Self {
        Self::Direct {
            max_change_per_second: None,
        }
    }
}

impl ControlLoopCfg {
    /// Builds a fresh loop with no accumulated state.
    pub fn build(&self) -> Box<dyn ControlLoop> {
        match self {
            Self::Direct {
                max_change_per_second,
            } => Box::new(DirectControlLoop::new(*max_change_per_second)),
            Self::Pid { p, i, d } => Box::new(PidControlLoop::new(*p, *i, *d)),
        }
    }
}

fn elapsed_seconds(last: Option<Instant>, now: Instant) -> f64 {
    match last {
        Some(last) => now.saturating_duration_since(last).as_secs_f64(),
        None => 1.0,
    }
}

/// Moves straight toward the target, limited to `max_change_per_second * dt`.
#[derive(Debug, Clone)]
pub struct DirectControlLoop {
    max_change_per_second: Option<f64>,
    last_time: Option<Instant>,
}

impl DirectControlLoop {
    pub fn new(max_change_per_second: Option<f64>) -> Self {
        Self {
            max_change_per_second,
            last_time: None,
        }
    }

    /// Same as [`ControlLoop::cycle`] with an explicit clock reading.
    pub fn cycle_at(&mut self, target: u8, current: u8, now: Instant) -> u8 {
        let dt = elapsed_seconds(self.last_time, now);
        self.last_time = Some(now);

        let Some(rate) = self.max_change_per_second else {
            return target;
        };

        let error = f64::from(target) - f64::from(current);
        // At least one unit per call so short ticks never stall the fan.
        let limit = (rate * dt).max(1.0);
        let step = error.clamp(-limit, limit).trunc();

        (f64::from(current) + step).clamp(0.0, 255.0) as u8
    }
}

impl ControlLoop for DirectControlLoop {
    fn cycle(&mut self, target: u8, current: u8) -> u8 {
        self.cycle_at(target, current, Instant::now())
    }
}

/// Proportional-integral-derivative loop on plain floating point values.
///
/// The error is `target - measured`; the output is clamped to
/// `[output_min, output_max]` and the integral term is held inside the same
/// range so it cannot wind up.
#[derive(Debug, Clone)]
pub struct PidLoop {
    p: f64,
    i: f64,
    d: f64,
    output_min: f64,
    output_max: f64,
    integral: f64,
    last_error: f64,
    last_time: Option<Instant>,
}

impl PidLoop {
    pub fn new(p: f64, i: f64, d: f64, output_min: f64, output_max: f64) -> Self {
        Self {
            p,
            i,
            d,
            output_min,
            output_max,
            integral: 0.0,
            last_error: 0.0,
            last_time: None,
        }
    }

    pub fn step(&mut self, target: f64, measured: f64) -> f64 {
        self.step_at(target, measured, Instant::now())
    }

    /// Runs one iteration at the given instant. The first call assumes one
    /// second has elapsed.
    pub fn step_at(&mut self, target: f64, measured: f64, now: Instant) -> f64 {
        let dt = elapsed_seconds(self.last_time, now);
        let error = target - measured;

        let derivative = if dt > 0.0 {
            self.integral += error * dt;
            if self.i != 0.0 {
                let (a, b) = (self.output_min / self.i, self.output_max / self.i);
                self.integral = self.integral.clamp(a.min(b), a.max(b));
            }
            (error - self.last_error) / dt
        } else {
            0.0
        };

        self.last_error = error;
        self.last_time = Some(now);

        let output = self.p * error + self.i * self.integral + self.d * derivative;
        output.clamp(self.output_min, self.output_max)
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }
}

/// PID loop applied to the duty cycle error of a fan.
#[derive(Debug, Clone)]
pub struct PidControlLoop {
    pid: PidLoop,
}

impl PidControlLoop {
    pub fn new(p: f64, i: f64, d: f64) -> Self {
        Self {
            pid: PidLoop::new(p, i, d, -255.0, 255.0),
        }
    }

    pub fn cycle_at(&mut self, target: u8, current: u8, now: Instant) -> u8 {
        let adjustment = self
            .pid
            .step_at(f64::from(target), f64::from(current), now);
        (f64::from(current) + adjustment).round().clamp(0.0, 255.0) as u8
    }
}

impl ControlLoop for PidControlLoop {
    fn cycle(&mut self, target: u8, current: u8) -> u8 {
        self.cycle_at(target, current, Instant::now())
    }
}
