//! Configuration management for the fanwarden daemon.
//!
//! Handles loading, parsing, and validation of YAML configuration files
//! that define fans, sensors, speed curves, and engine timing.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{control_loop::ControlLoopCfg, exec::ExecCfg};

/// Main configuration structure for the fanwarden daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// fans:
///   - id: cpu
///     kind: hwmon
///     pwm_path: /sys/class/hwmon/hwmon2/pwm1
///     rpm_path: /sys/class/hwmon/hwmon2/fan1_input
///     curve: cpu_curve
///     never_stop: true
/// sensors:
///   - kind: file
///     id: cpu_package
///     path: /sys/class/hwmon/hwmon1/temp1_input
/// curves:
///   - kind: linear
///     id: cpu_curve
///     sensor: cpu_package
///     min: 40
///     max: 80
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// File holding calibration data and quantization tables.
    #[serde(default = "defaults::db_path")]
    pub db_path: PathBuf,

    /// Calibrate all fans at once instead of one after another.
    #[serde(default = "defaults::run_fan_initialization_in_parallel")]
    pub run_fan_initialization_in_parallel: bool,

    /// RPM jitter below which a fan counts as settled during calibration.
    #[serde(default = "defaults::max_rpm_diff_for_settled_fan")]
    pub max_rpm_diff_for_settled_fan: f64,

    /// Upper bound on the initial settle wait of a calibration.
    #[serde(default = "defaults::max_settle_wait_seconds")]
    pub max_settle_wait_seconds: u64,

    /// Fixed settle delay between calibration steps.
    #[serde(default = "defaults::calibration_step_delay_ms")]
    pub calibration_step_delay_ms: u64,

    /// Settle delay between writes while building the quantization table.
    #[serde(default = "defaults::pwm_set_delay_ms")]
    pub pwm_set_delay_ms: u64,

    /// Warm-up time for sensor averages before curves are trusted.
    #[serde(default = "defaults::startup_delay_ms")]
    pub startup_delay_ms: u64,

    #[serde(default = "defaults::temp_sensor_poll_rate_ms")]
    pub temp_sensor_poll_rate_ms: u64,

    #[serde(default = "defaults::rolling_window_size")]
    pub temp_rolling_window_size: usize,

    #[serde(default = "defaults::rpm_poll_rate_ms")]
    pub rpm_poll_rate_ms: u64,

    #[serde(default = "defaults::rolling_window_size")]
    pub rpm_rolling_window_size: usize,

    /// Period of the fan adjustment tick.
    #[serde(default = "defaults::fan_controller_tick_rate_ms")]
    pub fan_controller_tick_rate_ms: u64,

    /// Back-off before a failed fan controller is restarted.
    #[serde(default = "defaults::restart_delay_seconds")]
    pub restart_delay_seconds: u64,

    #[serde(default)]
    pub fans: Vec<FanCfg>,

    #[serde(default)]
    pub sensors: Vec<SensorCfg>,

    #[serde(default)]
    pub curves: Vec<CurveCfg>,
}

/// Individual fan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanCfg {
    /// Unique identifier for this fan.
    pub id: String,

    /// Curve driving this fan.
    pub curve: String,

    /// Keep the fan spinning at all times.
    #[serde(default)]
    pub never_stop: bool,

    #[serde(default)]
    pub min_pwm: Option<u8>,

    /// Overrides the calibrated start duty cycle; 255 means "use calibration".
    #[serde(default)]
    pub start_pwm: Option<u8>,

    #[serde(default)]
    pub max_pwm: Option<u8>,

    #[serde(default)]
    pub control_loop: ControlLoopCfg,

    /// Hardware back-end.
    #[serde(flatten)]
    pub backend: FanBackendCfg,
}

/// Fan hardware back-end variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FanBackendCfg {
    /// hwmon sysfs entries.
    Hwmon {
        pwm_path: PathBuf,
        /// Defaults to `<pwm_path>_enable`.
        #[serde(default)]
        pwm_enable_path: Option<PathBuf>,
        #[serde(default)]
        rpm_path: Option<PathBuf>,
    },
    /// Plain files.
    File {
        path: PathBuf,
        #[serde(default)]
        rpm_path: Option<PathBuf>,
    },
    /// External programs; `%pwm%` in `set_pwm` arguments is replaced.
    Cmd {
        set_pwm: ExecCfg,
        #[serde(default)]
        get_pwm: Option<ExecCfg>,
        #[serde(default)]
        get_rpm: Option<ExecCfg>,
    },
}

/// Temperature sensor configuration variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SensorCfg {
    /// File holding milli-degrees, such as an hwmon `tempN_input`.
    File { id: String, path: PathBuf },

    /// External program printing milli-degrees.
    Cmd { id: String, command: ExecCfg },

    /// lm-sensors hardware monitoring configuration.
    LmSensors {
        id: String,
        /// Hardware chip identifier (e.g., "k10temp-pci-00c3").
        chip: String,
        /// Sensor feature name (e.g., "Tctl").
        feature: String,
    },
}

impl SensorCfg {
    pub fn get_id(&self) -> &str {
        match self {
            SensorCfg::File { id, .. } | SensorCfg::Cmd { id, .. } | SensorCfg::LmSensors { id, .. } => id,
        }
    }
}

/// Reduction applied by a function curve to its children's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Minimum,
    Maximum,
    Average,
    Sum,
    Difference,
    Delta,
}

/// Speed curve configuration variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CurveCfg {
    /// Sensor temperature mapped linearly, by bounds or by control points.
    Linear {
        id: String,
        sensor: String,
        /// Temperature (°C) at and below which the curve yields 0.
        #[serde(default)]
        min: Option<f64>,
        /// Temperature (°C) at and above which the curve yields 255.
        #[serde(default)]
        max: Option<f64>,
        /// Temperature (°C) to duty cycle control points.
        #[serde(default)]
        steps: Option<BTreeMap<i32, u8>>,
    },
    /// PID loop holding a sensor at a set point (°C).
    Pid {
        id: String,
        sensor: String,
        set_point: f64,
        p: f64,
        i: f64,
        d: f64,
    },
    /// Aggregate over other curves.
    Function {
        id: String,
        function: FunctionKind,
        curves: Vec<String>,
    },
}

impl CurveCfg {
    /// Gets the unique identifier for this curve.
    pub fn get_id(&self) -> &str {
        match self {
            CurveCfg::Linear { id, .. } | CurveCfg::Pid { id, .. } | CurveCfg::Function { id, .. } => id,
        }
    }

    /// Curves this curve evaluates as children.
    pub fn references(&self) -> &[String] {
        match self {
            CurveCfg::Function { curves, .. } => curves,
            _ => &[],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            db_path: defaults::db_path(),
            run_fan_initialization_in_parallel: defaults::run_fan_initialization_in_parallel(),
            max_rpm_diff_for_settled_fan: defaults::max_rpm_diff_for_settled_fan(),
            max_settle_wait_seconds: defaults::max_settle_wait_seconds(),
            calibration_step_delay_ms: defaults::calibration_step_delay_ms(),
            pwm_set_delay_ms: defaults::pwm_set_delay_ms(),
            startup_delay_ms: defaults::startup_delay_ms(),
            temp_sensor_poll_rate_ms: defaults::temp_sensor_poll_rate_ms(),
            temp_rolling_window_size: defaults::rolling_window_size(),
            rpm_poll_rate_ms: defaults::rpm_poll_rate_ms(),
            rpm_rolling_window_size: defaults::rolling_window_size(),
            fan_controller_tick_rate_ms: defaults::fan_controller_tick_rate_ms(),
            restart_delay_seconds: defaults::restart_delay_seconds(),
            fans: Vec::new(),
            sensors: Vec::new(),
            curves: Vec::new(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    ///
    /// Checks identifier uniqueness, every fan/curve/sensor reference, curve
    /// parameters, and rejects curve dependency cycles. The control engine
    /// relies on this having passed: an unchecked cycle would recurse forever.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fanwarden::config::Config;
    ///
    /// let config = Config::default();
    /// config.validate()?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn validate(&self) -> Result<()> {
        let fan_ids = unique_ids("fan", self.fans.iter().map(|f| f.id.as_str()))?;
        let sensor_ids = unique_ids("sensor", self.sensors.iter().map(SensorCfg::get_id))?;
        let curve_ids = unique_ids("curve", self.curves.iter().map(CurveCfg::get_id))?;
        debug_assert_eq!(fan_ids.len(), self.fans.len());

        for fan in &self.fans {
            if !curve_ids.contains(fan.curve.as_str()) {
                bail!("Fan '{}' references non-existent curve '{}'", fan.id, fan.curve);
            }
            let max = fan.max_pwm.unwrap_or(u8::MAX);
            for (name, value) in [("min_pwm", fan.min_pwm), ("start_pwm", fan.start_pwm)] {
                if let Some(value) = value.filter(|v| *v > max) {
                    bail!("Fan '{}' has {name} {value} above max_pwm {max}", fan.id);
                }
            }
        }

        for curve in &self.curves {
            match curve {
                CurveCfg::Linear {
                    id,
                    sensor,
                    min,
                    max,
                    steps,
                } => {
                    check_sensor(&sensor_ids, id, sensor)?;
                    match (min, max, steps) {
                        (_, _, Some(steps)) if steps.is_empty() => {
                            bail!("Linear curve '{id}' has empty steps")
                        }
                        (None, None, Some(_)) => {}
                        (Some(min), Some(max), None) if min < max => {}
                        (Some(min), Some(max), None) => {
                            bail!("Linear curve '{id}' needs min < max, got {min} >= {max}")
                        }
                        _ => bail!("Linear curve '{id}' needs either min and max, or steps"),
                    }
                }
                CurveCfg::Pid { id, sensor, .. } => check_sensor(&sensor_ids, id, sensor)?,
                CurveCfg::Function {
                    id,
                    function,
                    curves,
                } => {
                    if curves.is_empty() {
                        bail!("Function curve '{id}' references no curves");
                    }
                    if *function == FunctionKind::Difference && curves.len() != 2 {
                        bail!(
                            "Function curve '{id}': difference needs exactly 2 curves, got {}",
                            curves.len()
                        );
                    }
                    if let Some(missing) = curves.iter().find(|c| !curve_ids.contains(c.as_str())) {
                        bail!("Function curve '{id}' references non-existent curve '{missing}'");
                    }
                }
            }
        }

        if let Some(cycle) = find_curve_cycles(&self.curves).first() {
            bail!("Curve dependency cycle detected: {}", cycle.join(" -> "));
        }

        Ok(())
    }

    /// Finds a curve configuration by ID.
    pub fn find_curve(&self, id: &str) -> Option<&CurveCfg> {
        self.curves.iter().find(|curve| curve.get_id() == id)
    }
}

fn unique_ids<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            bail!("Duplicate {kind} id '{id}'");
        }
    }
    Ok(seen)
}

fn check_sensor(sensor_ids: &HashSet<&str>, curve: &str, sensor: &str) -> Result<()> {
    if sensor_ids.contains(sensor) {
        Ok(())
    } else {
        bail!("Curve '{curve}' references non-existent sensor '{sensor}'")
    }
}

/// Returns every cyclic group of curves, each as a list of ids.
///
/// Builds the graph of function curve -> referenced curve edges and runs
/// Tarjan's strongly connected components algorithm; components with more
/// than one curve, and curves referencing themselves, are reported.
pub fn find_curve_cycles(curves: &[CurveCfg]) -> Vec<Vec<String>> {
    let index: HashMap<&str, usize> = curves
        .iter()
        .enumerate()
        .map(|(i, c)| (c.get_id(), i))
        .collect();
    let edges: Vec<Vec<usize>> = curves
        .iter()
        .map(|c| {
            c.references()
                .iter()
                .filter_map(|r| index.get(r.as_str()).copied())
                .collect()
        })
        .collect();

    let mut tarjan = Tarjan::new(&edges);
    for node in 0..curves.len() {
        if tarjan.index[node].is_none() {
            tarjan.visit(node);
        }
    }

    tarjan
        .components
        .into_iter()
        .filter(|scc| scc.len() > 1 || edges[scc[0]].contains(&scc[0]))
        .map(|mut scc| {
            scc.sort_unstable();
            scc.into_iter()
                .map(|i| curves[i].get_id().to_string())
                .collect()
        })
        .collect()
}

struct Tarjan<'a> {
    edges: &'a [Vec<usize>],
    next_index: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn new(edges: &'a [Vec<usize>]) -> Self {
        let n = edges.len();
        Self {
            edges,
            next_index: 0,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &w in &self.edges[v] {
            match self.index[w] {
                None => {
                    self.visit(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn db_path() -> PathBuf {
        PathBuf::from("/var/lib/fanwarden/fanwarden.json")
    }

    pub fn run_fan_initialization_in_parallel() -> bool {
        true
    }

    pub fn max_rpm_diff_for_settled_fan() -> f64 {
        10.0
    }

    pub fn max_settle_wait_seconds() -> u64 {
        60
    }

    /// Most tachometers refresh once per second; two seconds guarantees a
    /// fresh reading.
    pub fn calibration_step_delay_ms() -> u64 {
        2000
    }

    pub fn pwm_set_delay_ms() -> u64 {
        5
    }

    pub fn startup_delay_ms() -> u64 {
        5000
    }

    pub fn temp_sensor_poll_rate_ms() -> u64 {
        200
    }

    pub fn rolling_window_size() -> usize {
        10
    }

    pub fn rpm_poll_rate_ms() -> u64 {
        1000
    }

    pub fn fan_controller_tick_rate_ms() -> u64 {
        200
    }

    pub fn restart_delay_seconds() -> u64 {
        5
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("FANWARDEN_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("fanwarden/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/fanwarden/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    bail!("Configuration file not found in any standard location")
}

/// Configuration manager that owns the loaded config and its origin.
///
/// # Example
///
/// ```no_run
/// use fanwarden::config::ConfigManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.yml"))).await?;
/// let tick = config_manager.get().await.fan_controller_tick_rate_ms;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. FANWARDEN_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/fanwarden/config.yml or ~/.config/fanwarden/config.yml
    /// 4. /etc/fanwarden/config.yml
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, config_path))
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn validate(&self) -> Result<()> {
        self.config.read().await.validate()
    }

    /// Clones the current configuration.
    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    fn linear(id: &str, sensor: &str) -> CurveCfg {
        CurveCfg::Linear {
            id: id.into(),
            sensor: sensor.into(),
            min: Some(40.0),
            max: Some(80.0),
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

    fn sensor(id: &str) -> SensorCfg {
        SensorCfg::File {
            id: id.into(),
            path: PathBuf::from("/sys/class/hwmon/hwmon0/temp1_input"),
        }
    }

    fn config_with_curves(curves: Vec<CurveCfg>) -> Config {
        Config {
            sensors: vec![sensor("cpu")],
            curves,
            ..Default::default()
        }
    }

    #[test]
    fn config_load_valid_yaml() {
        let yaml_content = r#"
version: 1
fan_controller_tick_rate_ms: 250
run_fan_initialization_in_parallel: false
fans:
  - id: cpu_fan
    kind: hwmon
    pwm_path: /sys/class/hwmon/hwmon2/pwm1
    rpm_path: /sys/class/hwmon/hwmon2/fan1_input
    curve: case
    never_stop: true
    min_pwm: 30
    control_loop:
      kind: direct
      max_change_per_second: 20
  - id: pump
    kind: cmd
    set_pwm:
      exec: /usr/bin/pumpctl
      args: ["--duty", "%pwm%"]
    curve: cpu_curve

sensors:
  - kind: file
    id: cpu
    path: /sys/class/hwmon/hwmon1/temp1_input
  - kind: lm-sensors
    id: gpu
    chip: amdgpu-pci-0300
    feature: edge

curves:
  - kind: linear
    id: cpu_curve
    sensor: cpu
    min: 40
    max: 80
  - kind: linear
    id: gpu_curve
    sensor: gpu
    steps:
      40: 0
      60: 128
      80: 255
  - kind: pid
    id: gpu_pid
    sensor: gpu
    set_point: 60
    p: -0.05
    i: -0.005
    d: -0.005
  - kind: function
    id: case
    function: maximum
    curves: [cpu_curve, gpu_curve, gpu_pid]
"#;

        let temp_file = create_temp_config(yaml_content);
        let config_manager =
            tokio_test::block_on(ConfigManager::load(Some(temp_file.path().to_path_buf()))).unwrap();
        let config = tokio_test::block_on(config_manager.clone_config());

        assert_eq!(config.fan_controller_tick_rate_ms, 250);
        assert!(!config.run_fan_initialization_in_parallel);
        assert_eq!(config.rpm_rolling_window_size, 10);
        assert_eq!(config.fans.len(), 2);
        assert_eq!(config.fans[0].min_pwm, Some(30));
        assert!(matches!(config.fans[0].backend, FanBackendCfg::Hwmon { .. }));
        assert!(matches!(config.fans[1].backend, FanBackendCfg::Cmd { .. }));
        assert_eq!(
            config.fans[0].control_loop,
            ControlLoopCfg::Direct {
                max_change_per_second: Some(20.0)
            }
        );
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.curves.len(), 4);

        match config.find_curve("gpu_curve") {
            Some(CurveCfg::Linear { steps: Some(steps), .. }) => {
                assert_eq!(steps.get(&60), Some(&128));
            }
            other => panic!("Expected linear steps curve, got {other:?}"),
        }
    }

    #[test]
    fn config_rejects_unsupported_version() {
        let temp_file = create_temp_config("version: 2\n");
        let result = tokio_test::block_on(ConfigManager::load(Some(temp_file.path().to_path_buf())));

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Unsupported config version"));
    }

    #[test]
    fn config_validate_missing_curve_reference() {
        let config = Config {
            fans: vec![FanCfg {
                id: "fan1".into(),
                curve: "nonexistent_curve".into(),
                never_stop: false,
                min_pwm: None,
                start_pwm: None,
                max_pwm: None,
                control_loop: ControlLoopCfg::default(),
                backend: FanBackendCfg::File {
                    path: PathBuf::from("/tmp/pwm"),
                    rpm_path: None,
                },
            }],
            ..Default::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("nonexistent_curve"));
    }

    #[test]
    fn config_validate_missing_sensor_reference() {
        let config = config_with_curves(vec![linear("c1", "missing")]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("non-existent sensor 'missing'"));
    }

    #[test]
    fn config_validate_rejects_duplicate_ids() {
        let config = config_with_curves(vec![linear("c1", "cpu"), linear("c1", "cpu")]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate curve id 'c1'"));
    }

    #[test]
    fn config_validate_linear_needs_bounds_or_steps() {
        let config = config_with_curves(vec![CurveCfg::Linear {
            id: "c1".into(),
            sensor: "cpu".into(),
            min: Some(40.0),
            max: None,
            steps: None,
        }]);
        assert!(config.validate().is_err());

        let inverted = config_with_curves(vec![CurveCfg::Linear {
            id: "c1".into(),
            sensor: "cpu".into(),
            min: Some(80.0),
            max: Some(40.0),
            steps: None,
        }]);
        assert!(inverted.validate().unwrap_err().to_string().contains("min < max"));
    }

    #[test]
    fn config_validate_difference_needs_two_curves() {
        let config = config_with_curves(vec![
            linear("a", "cpu"),
            linear("b", "cpu"),
            linear("c", "cpu"),
            function("diff", FunctionKind::Difference, &["a", "b", "c"]),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exactly 2"));
    }

    #[test]
    fn config_validate_rejects_self_reference() {
        let config = config_with_curves(vec![function("loop", FunctionKind::Sum, &["loop"])]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn config_validate_rejects_indirect_cycle() {
        let config = config_with_curves(vec![
            linear("leaf", "cpu"),
            function("a", FunctionKind::Maximum, &["leaf", "b"]),
            function("b", FunctionKind::Minimum, &["c"]),
            function("c", FunctionKind::Average, &["a"]),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("a -> b -> c"));
    }

    #[test]
    fn shared_children_are_not_cycles() {
        let curves = vec![
            linear("leaf", "cpu"),
            function("a", FunctionKind::Maximum, &["leaf", "leaf"]),
            function("b", FunctionKind::Minimum, &["a", "leaf"]),
        ];

        assert!(find_curve_cycles(&curves).is_empty());
        assert!(config_with_curves(curves).validate().is_ok());
    }

    #[test]
    fn find_curve_cycles_reports_each_group() {
        let curves = vec![
            function("self", FunctionKind::Sum, &["self"]),
            function("x", FunctionKind::Sum, &["y"]),
            function("y", FunctionKind::Sum, &["x"]),
        ];

        let mut cycles = find_curve_cycles(&curves);
        cycles.sort();

        assert_eq!(
            cycles,
            vec![vec!["self".to_string()], vec!["x".to_string(), "y".to_string()]]
        );
    }

    #[test]
    fn config_validate_start_above_max() {
        let mut config = config_with_curves(vec![linear("c1", "cpu")]);
        config.fans.push(FanCfg {
            id: "f".into(),
            curve: "c1".into(),
            never_stop: true,
            min_pwm: None,
            start_pwm: Some(200),
            max_pwm: Some(150),
            control_loop: ControlLoopCfg::default(),
            backend: FanBackendCfg::File {
                path: PathBuf::from("/tmp/pwm"),
                rpm_path: None,
            },
        });

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("start_pwm 200"));
    }

    #[test]
    fn unknown_function_operator_is_rejected_at_parse_time() {
        let yaml = "kind: function\nid: f\nfunction: median\ncurves: [a]\n";
        assert!(serde_yaml::from_str::<CurveCfg>(yaml).is_err());
    }
}
