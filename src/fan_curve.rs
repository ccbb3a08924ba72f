//! Speed curves turning sensor readings into a duty cycle.
//!
//! A curve is evaluated on demand by the fan controller's tick and always
//! recomputes from the current sensor averages. Function curves evaluate
//! their children depth-first; the configuration layer guarantees the curve
//! graph is acyclic, so the recursion terminates.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicI32, Ordering},
    },
    time::Instant,
};

use log::debug;

use crate::{
    config::{CurveCfg, FunctionKind},
    control_loop::PidLoop,
    error::ControlError,
    registry::Registry,
    smoothing::interpolate_linear,
};

const MILLI: f64 = 1000.0;

/// A named curve producing a duty cycle value.
///
/// Linear and function curves are pure functions of the sensor averages.
/// PID curves carry loop state and depend on the time between evaluations.
///
/// # Example
///
/// ```
/// use fanwarden::config::CurveCfg;
/// use fanwarden::fan_curve::SpeedCurve;
///
/// let curve = SpeedCurve::from(&CurveCfg::Linear {
///     id: "cpu".into(),
///     sensor: "cpu_package".into(),
///     min: Some(40.0),
///     max: Some(80.0),
///     steps: None,
/// });
/// assert_eq!(curve.id(), "cpu");
/// assert_eq!(curve.current_value(), 0);
/// ```
#[derive(Debug)]
pub struct SpeedCurve {
    id: String,
    kind: CurveKind,
    value: AtomicI32,
}

#[derive(Debug)]
enum CurveKind {
    Linear {
        sensor: String,
        shape: LinearShape,
    },
    Pid {
        sensor: String,
        set_point: f64,
        pid: Mutex<PidLoop>,
    },
    Function {
        function: FunctionKind,
        curves: Vec<String>,
    },
}

#[derive(Debug)]
enum LinearShape {
    /// Bounds in milli-degrees.
    Bounds { min: f64, max: f64 },
    /// Degrees to duty cycle.
    Steps(BTreeMap<i32, f64>),
}

impl From<&CurveCfg> for SpeedCurve {
    fn from(cfg: &CurveCfg) -> Self {
        let kind = match cfg {
            CurveCfg::Linear {
                sensor,
                min,
                max,
                steps,
                ..
            } => {
                let shape = match steps {
                    Some(steps) if !steps.is_empty() => LinearShape::Steps(
                        steps.iter().map(|(t, v)| (*t, f64::from(*v))).collect(),
                    ),
                    _ => LinearShape::Bounds {
                        min: min.unwrap_or(0.0) * MILLI,
                        max: max.unwrap_or(100.0) * MILLI,
                    },
                };
                CurveKind::Linear {
                    sensor: sensor.clone(),
                    shape,
                }
            }
            CurveCfg::Pid {
                sensor,
                set_point,
                p,
                i,
                d,
                ..
            } => CurveKind::Pid {
                sensor: sensor.clone(),
                set_point: *set_point,
                pid: Mutex::new(PidLoop::new(*p, *i, *d, 0.0, 1.0)),
            },
            CurveCfg::Function {
                function, curves, ..
            } => CurveKind::Function {
                function: *function,
                curves: curves.clone(),
            },
        };

        Self {
            id: cfg.get_id().to_string(),
            kind,
            value: AtomicI32::new(0),
        }
    }
}

impl SpeedCurve {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last evaluated value, without recomputing.
    pub fn current_value(&self) -> i32 {
        self.value.load(Ordering::Relaxed)
    }

    /// Ids of the curves a function curve aggregates.
    pub fn children(&self) -> &[String] {
        match &self.kind {
            CurveKind::Function { curves, .. } => curves,
            _ => &[],
        }
    }

    /// Recomputes the curve from the current sensor averages.
    ///
    /// Linear and PID curves yield values in `[0, 255]`. Function curves
    /// may leave that range (`sum`, `difference`); the controller clamps.
    pub fn evaluate(&self, registry: &Registry) -> Result<i32, ControlError> {
        self.evaluate_at(registry, Instant::now())
    }

    pub(crate) fn evaluate_at(&self, registry: &Registry, now: Instant) -> Result<i32, ControlError> {
        let value = match &self.kind {
            CurveKind::Linear { sensor, shape } => {
                let avg = self.sensor_avg(registry, sensor)?;
                match shape {
                    LinearShape::Steps(steps) => interpolate_linear(steps, avg / MILLI) as i32,
                    LinearShape::Bounds { min, max } => {
                        let ratio = ((avg - min) / (max - min)).clamp(0.0, 1.0);
                        (ratio * 255.0) as i32
                    }
                }
            }
            CurveKind::Pid {
                sensor,
                set_point,
                pid,
            } => {
                let measured = self.sensor_avg(registry, sensor)? / MILLI;
                let mut pid = pid.lock().map_err(|_| {
                    ControlError::ConfigurationDefect(format!("curve '{}': PID state poisoned", self.id))
                })?;
                let output = pid.step_at(*set_point, measured, now).clamp(0.0, 1.0);
                (output * 255.0) as i32
            }
            CurveKind::Function { function, curves } => {
                let values = curves
                    .iter()
                    .map(|child| {
                        registry
                            .curve(child)
                            .ok_or_else(|| {
                                ControlError::ConfigurationDefect(format!(
                                    "curve '{}' references unknown curve '{child}'",
                                    self.id
                                ))
                            })?
                            .evaluate_at(registry, now)
                    })
                    .collect::<Result<Vec<i32>, _>>()?;
                reduce(*function, &values).ok_or_else(|| {
                    ControlError::ConfigurationDefect(format!("function curve '{}' has no children", self.id))
                })?
            }
        };

        debug!("Curve '{}' evaluated to {value}", self.id);
        self.value.store(value, Ordering::Relaxed);
        Ok(value)
    }

    fn sensor_avg(&self, registry: &Registry, sensor: &str) -> Result<f64, ControlError> {
        registry
            .sensor(sensor)
            .map(|s| s.moving_avg())
            .ok_or_else(|| {
                ControlError::ConfigurationDefect(format!(
                    "curve '{}' references unknown sensor '{sensor}'",
                    self.id
                ))
            })
    }
}

/// Applies a function operator to child values. `None` for no children.
pub fn reduce(function: FunctionKind, values: &[i32]) -> Option<i32> {
    let (first, rest) = values.split_first()?;
    let min = values.iter().copied().min()?;
    let max = values.iter().copied().max()?;
    let sum: i32 = values.iter().sum();

    Some(match function {
        FunctionKind::Minimum => min,
        FunctionKind::Maximum => max,
        FunctionKind::Average => sum / values.len() as i32,
        FunctionKind::Sum => sum,
        FunctionKind::Difference => first - rest.iter().sum::<i32>(),
        FunctionKind::Delta => max - min,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSensor;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::Duration;

    fn linear(id: &str, sensor: &str, min: f64, max: f64) -> CurveCfg {
        CurveCfg::Linear {
            id: id.into(),
            sensor: sensor.into(),
            min: Some(min),
            max: Some(max),
            steps: None,
        }
    }

    fn function(id: &str, function: FunctionKind, curves: &[&str]) -> CurveCfg {
        CurveCfg::Function {
            id: id.into(),
            function,
            curves: curves.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn registry(sensors: &[(&str, f64)], curves: &[CurveCfg]) -> Registry {
        let registry = Registry::new();
        for (id, avg) in sensors {
            registry.register_sensor(FakeSensor::with_avg(id, *avg)).unwrap();
        }
        for cfg in curves {
            registry.register_curve(SpeedCurve::from(cfg)).unwrap();
        }
        registry
    }

    fn eval(registry: &Registry, id: &str) -> i32 {
        registry.curve(id).unwrap().evaluate(registry).unwrap()
    }

    #[test]
    fn linear_bounds_truncate() {
        let reg = registry(&[("cpu", 50_000.0)], &[linear("c", "cpu", 0.0, 100.0)]);
        assert_eq!(eval(&reg, "c"), 127);
    }

    #[test]
    fn linear_bounds_clamp_outside_range() {
        let reg = registry(
            &[("cold", 20_000.0), ("hot", 95_000.0)],
            &[linear("low", "cold", 40.0, 80.0), linear("high", "hot", 40.0, 80.0)],
        );
        assert_eq!(eval(&reg, "low"), 0);
        assert_eq!(eval(&reg, "high"), 255);
    }

    #[test]
    fn linear_steps_interpolate_in_degrees() {
        let cfg = CurveCfg::Linear {
            id: "c".into(),
            sensor: "cpu".into(),
            min: None,
            max: None,
            steps: Some(BTreeMap::from([(40, 0), (60, 100), (80, 255)])),
        };
        let reg = registry(&[("cpu", 50_000.0), ("hot", 90_000.0)], &[cfg]);

        assert_eq!(eval(&reg, "c"), 50);
        assert_eq!(reg.curve("c").unwrap().current_value(), 50);
    }

    #[test]
    fn average_uses_truncating_division() {
        let reg = registry(
            &[("a", 25_000.0), ("b", 50_000.0), ("c", 50_200.0)],
            &[
                linear("low", "a", 0.0, 100.0),
                linear("mid", "b", 0.0, 100.0),
                linear("mid2", "c", 0.0, 100.0),
                function("avg", FunctionKind::Average, &["low", "mid"]),
                function("avg2", FunctionKind::Average, &["low", "mid2"]),
            ],
        );

        assert_eq!(eval(&reg, "low"), 63);
        assert_eq!(eval(&reg, "mid"), 127);
        assert_eq!(eval(&reg, "mid2"), 128);
        assert_eq!(eval(&reg, "avg"), 95);
        assert_eq!(eval(&reg, "avg2"), 95);
    }

    #[test]
    fn function_operators() {
        let values = [63, 127, 200];

        assert_eq!(reduce(FunctionKind::Minimum, &values), Some(63));
        assert_eq!(reduce(FunctionKind::Maximum, &values), Some(200));
        assert_eq!(reduce(FunctionKind::Average, &values), Some(130));
        assert_eq!(reduce(FunctionKind::Sum, &values), Some(390));
        assert_eq!(reduce(FunctionKind::Difference, &[200, 63]), Some(137));
        assert_eq!(reduce(FunctionKind::Difference, &[63, 200]), Some(-137));
        assert_eq!(reduce(FunctionKind::Delta, &values), Some(137));
        assert_eq!(reduce(FunctionKind::Sum, &[]), None);
    }

    #[test]
    fn nested_function_shares_children() {
        let reg = registry(
            &[("cpu", 50_000.0), ("gpu", 25_000.0)],
            &[
                linear("cpu_c", "cpu", 0.0, 100.0),
                linear("gpu_c", "gpu", 0.0, 100.0),
                function("hottest", FunctionKind::Maximum, &["cpu_c", "gpu_c"]),
                function("spread", FunctionKind::Delta, &["hottest", "gpu_c", "cpu_c"]),
            ],
        );

        assert_eq!(eval(&reg, "hottest"), 127);
        assert_eq!(eval(&reg, "spread"), 64);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let reg = registry(
            &[("cpu", 61_234.0)],
            &[
                linear("c", "cpu", 30.0, 90.0),
                function("f", FunctionKind::Sum, &["c", "c"]),
            ],
        );

        assert_eq!(eval(&reg, "c"), eval(&reg, "c"));
        assert_eq!(eval(&reg, "f"), eval(&reg, "f"));
    }

    #[test]
    fn missing_sensor_is_configuration_defect() {
        let reg = registry(&[], &[linear("c", "ghost", 0.0, 100.0)]);
        let err = reg.curve("c").unwrap().evaluate(&reg).unwrap_err();

        assert!(matches!(err, ControlError::ConfigurationDefect(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn pid_curve_zero_elapsed_time_adds_no_integral() {
        let cfg = CurveCfg::Pid {
            id: "pid".into(),
            sensor: "cpu".into(),
            set_point: 60.0,
            p: -0.05,
            i: -0.005,
            d: 0.0,
        };
        let reg = registry(&[("cpu", 70_000.0)], &[cfg]);
        let curve = reg.curve("pid").unwrap();
        let now = Instant::now();

        let first = curve.evaluate_at(&reg, now).unwrap();
        let second = curve.evaluate_at(&reg, now).unwrap();
        assert_eq!(first, second);

        let later = curve.evaluate_at(&reg, now + Duration::from_secs(1)).unwrap();
        assert!(later >= second);
    }

    #[test]
    fn pid_curve_output_within_duty_range() {
        let cfg = CurveCfg::Pid {
            id: "pid".into(),
            sensor: "cpu".into(),
            set_point: 60.0,
            p: -1.0,
            i: 0.0,
            d: 0.0,
        };
        let hot = registry(&[("cpu", 95_000.0)], std::slice::from_ref(&cfg));
        let cold = registry(&[("cpu", 20_000.0)], &[cfg]);

        assert_eq!(eval(&hot, "pid"), 255);
        assert_eq!(eval(&cold, "pid"), 0);
    }

    proptest! {
        #[test]
        fn linear_bounds_stay_in_duty_range(avg in -50_000.0f64..200_000.0) {
            let reg = registry(&[("cpu", avg)], &[linear("c", "cpu", 30.0, 90.0)]);
            let value = eval(&reg, "c");
            prop_assert!((0..=255).contains(&value));
        }
    }
}
