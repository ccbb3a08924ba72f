//! Per-fan control state machine.
//!
//! A [`FanController`] owns one fan for the lifetime of the daemon:
//!
//! ```text
//! Starting -> Calibrating -> Mapping -> Active -> Restoring -> Stopped
//! ```
//!
//! Calibration only runs when no calibration data is persisted. The fan's
//! original control mode is restored by a drop guard, so every exit path
//! (error, cancellation, panic) hands the fan back to the hardware.

use std::{
    collections::BTreeMap,
    fmt,
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
    sync::{Mutex, watch},
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    control_loop::ControlLoop,
    error::ControlError,
    fans::{Fan, FanProfile, Feature, MAX_PWM, PWM_ENABLE_DISABLED, PWM_ENABLE_MANUAL},
    persistence::{Persistence, PwmData, PwmTable},
    registry::Registry,
    smoothing::{
        RollingWindow, find_closest, interpolate_linear_range, interpolate_step, update_moving_avg,
    },
};

/// RPM polling period while waiting for a fan to settle.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// RPM average seeded after a never-stop escalation.
const ESCALATION_RPM_SEED: f64 = 1.0;

/// Timing and smoothing parameters shared by all controllers.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub tick_interval: Duration,
    pub rpm_poll_interval: Duration,
    pub rpm_window_size: usize,
    pub startup_delay: Duration,
    pub calibration_step_delay: Duration,
    pub pwm_set_delay: Duration,
    pub settle_threshold: f64,
    pub settle_poll_interval: Duration,
    pub max_settle_wait: Duration,
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.fan_controller_tick_rate_ms),
            rpm_poll_interval: Duration::from_millis(config.rpm_poll_rate_ms),
            rpm_window_size: config.rpm_rolling_window_size.max(1),
            startup_delay: Duration::from_millis(config.startup_delay_ms),
            calibration_step_delay: Duration::from_millis(config.calibration_step_delay_ms),
            pwm_set_delay: Duration::from_millis(config.pwm_set_delay_ms),
            settle_threshold: config.max_rpm_diff_for_settled_fan,
            settle_poll_interval: SETTLE_POLL_INTERVAL,
            max_settle_wait: Duration::from_secs(config.max_settle_wait_seconds),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Lifecycle phase of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Starting,
    Calibrating,
    Mapping,
    Active,
    Restoring,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Calibrating => "calibrating",
            Self::Mapping => "mapping",
            Self::Active => "active",
            Self::Restoring => "restoring",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Operating range of a fan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PwmBounds {
    pub min: u8,
    pub start: u8,
    pub max: u8,
}

impl Default for PwmBounds {
    fn default() -> Self {
        Self {
            min: 0,
            start: 0,
            max: MAX_PWM,
        }
    }
}

/// Read-only view of a controller, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanSnapshot {
    pub id: String,
    pub state: ControllerState,
    pub bounds: PwmBounds,
    pub last_set_pwm: Option<u8>,
    pub rpm_avg: f64,
    pub never_stop_violation: bool,
}

/// Quantization table: requested duty cycle to the value read back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PwmMap {
    table: PwmTable,
    distinct: Vec<u8>,
}

impl PwmMap {
    /// Builds the map and the ascending list of requests whose read-back
    /// differs from the previous distinct entry's.
    pub fn new(table: PwmTable) -> Self {
        let mut distinct = Vec::new();
        let mut previous = None;
        for (&requested, &actual) in &table {
            if previous != Some(actual) {
                distinct.push(requested);
                previous = Some(actual);
            }
        }
        Self { table, distinct }
    }

    /// Every duty cycle is honoured as requested.
    pub fn identity() -> Self {
        Self::new((0..=MAX_PWM).map(|pwm| (pwm, pwm)).collect())
    }

    /// Value the hardware reports after `requested` was written.
    pub fn actual(&self, requested: u8) -> u8 {
        interpolate_step(&self.table, requested).unwrap_or(requested)
    }

    /// Nearest request producing a distinct hardware value.
    pub fn closest(&self, target: u8) -> u8 {
        find_closest(target, &self.distinct).unwrap_or(target)
    }

    pub fn table(&self) -> &PwmTable {
        &self.table
    }

    pub fn distinct(&self) -> &[u8] {
        &self.distinct
    }
}

/// Derives `(start, max)` from calibration data.
///
/// The sparse data is expanded to every duty cycle by linear interpolation.
/// `start` is the lowest duty cycle with a nonzero RPM (255 when the fan
/// never moved), `max` the lowest duty cycle reaching the highest RPM.
pub fn compute_pwm_boundaries(data: &PwmData) -> (u8, u8) {
    if data.is_empty() {
        return (MAX_PWM, MAX_PWM);
    }

    let dense = interpolate_linear_range(data, 0, MAX_PWM);
    let start = dense
        .iter()
        .find(|(_, rpm)| **rpm > 0.0)
        .map_or(MAX_PWM, |(pwm, _)| *pwm);
    let top = dense.values().copied().fold(f64::MIN, f64::max);
    let max = dense
        .iter()
        .find(|(_, rpm)| **rpm >= top)
        .map_or(MAX_PWM, |(pwm, _)| *pwm);

    (start, max)
}

/// Combines configured overrides with calibration results.
///
/// A configured `start_pwm` of 255 counts as unset.
pub fn derive_bounds(profile: &FanProfile, data: Option<&PwmData>) -> PwmBounds {
    let (derived_start, derived_max) = match data {
        Some(data) if !data.is_empty() => compute_pwm_boundaries(data),
        _ => (0, MAX_PWM),
    };

    let max = profile.max_pwm.unwrap_or(derived_max);
    let start = match profile.start_pwm {
        Some(start) if start != MAX_PWM => start,
        _ => derived_start,
    };
    let min = profile.min_pwm.unwrap_or(0);

    PwmBounds {
        min: min.min(max),
        start: start.min(max),
        max,
    }
}

#[derive(Debug)]
struct RpmTracker {
    window: RollingWindow,
    window_size: usize,
    avg: f64,
    pwm: Option<u8>,
    calibration: PwmData,
    track_calibration: bool,
    dirty: bool,
}

impl RpmTracker {
    fn new(window_size: usize) -> Self {
        Self {
            window: RollingWindow::new(window_size),
            window_size,
            avg: 0.0,
            pwm: None,
            calibration: BTreeMap::new(),
            track_calibration: false,
            dirty: false,
        }
    }

    fn record(&mut self, rpm: f64) -> f64 {
        self.window.push(rpm);
        self.avg = self.window.avg().unwrap_or(rpm);

        if let Some(pwm) = self.pwm.filter(|_| self.track_calibration) {
            let entry = self.calibration.entry(pwm).or_insert(rpm);
            *entry = update_moving_avg(*entry, self.window_size, rpm);
            self.dirty = true;
        }
        self.avg
    }
}

/// Restores a fan's original control mode when dropped.
///
/// Falls back to full duty cycle when the mode is unknown or cannot be
/// written back, so a fan never stays stalled under a dead controller.
pub struct RestoreGuard {
    fan: Arc<dyn Fan>,
    original_mode: Option<i32>,
}

impl RestoreGuard {
    pub fn new(fan: Arc<dyn Fan>, original_mode: Option<i32>) -> Self {
        Self { fan, original_mode }
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let id = self.fan.id().to_string();
        let restored = match self.original_mode {
            Some(mode) => self.fan.set_pwm_enabled(mode).map(|()| mode),
            None => Err(anyhow::anyhow!("original pwm_enable mode unknown")),
        };

        match restored {
            Ok(mode) => info!("Fan '{id}': restored pwm_enable mode {mode}"),
            Err(e) => {
                warn!("Fan '{id}': could not restore control mode ({e}), forcing full speed");
                if let Err(e) = self.fan.set_pwm(MAX_PWM) {
                    error!("Fan '{id}': failed to force full speed: {e}");
                }
            }
        }
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> ControlFlow<()> {
    tokio::select! {
        () = cancel.cancelled() => ControlFlow::Break(()),
        () = sleep(duration) => ControlFlow::Continue(()),
    }
}

/// Controller owning one fan.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use fanwarden::{fan_controller::{ControllerSettings, FanController}, fans::Fan,
/// #     persistence::MemoryPersistence, registry::Registry};
/// # async fn example(fan: Arc<dyn Fan>) -> Result<(), fanwarden::error::ControlError> {
/// let controller = FanController::new(
///     fan,
///     Arc::new(Registry::new()),
///     Arc::new(MemoryPersistence::new()),
///     ControllerSettings::default(),
/// );
/// let snapshots = controller.subscribe();
/// let cancel = tokio_util::sync::CancellationToken::new();
/// controller.run(cancel).await?;
/// assert_eq!(snapshots.borrow().last_set_pwm, None);
/// # Ok(())
/// # }
/// ```
pub struct FanController {
    fan: Arc<dyn Fan>,
    registry: Arc<Registry>,
    persistence: Arc<dyn Persistence>,
    settings: ControllerSettings,
    calibration_lock: Option<Arc<Mutex<()>>>,
    state: ControllerState,
    bounds: PwmBounds,
    last_set_pwm: Option<u8>,
    pwm_map: PwmMap,
    rpm: Arc<Mutex<RpmTracker>>,
    control_loop: Box<dyn ControlLoop>,
    snapshot: Arc<watch::Sender<FanSnapshot>>,
}

impl FanController {
    pub fn new(
        fan: Arc<dyn Fan>,
        registry: Arc<Registry>,
        persistence: Arc<dyn Persistence>,
        settings: ControllerSettings,
    ) -> Self {
        let bounds = derive_bounds(fan.profile(), None);
        let (snapshot, _) = watch::channel(FanSnapshot {
            id: fan.id().to_string(),
            state: ControllerState::Starting,
            bounds,
            last_set_pwm: None,
            rpm_avg: 0.0,
            never_stop_violation: false,
        });

        Self {
            control_loop: fan.profile().control_loop.build(),
            rpm: Arc::new(Mutex::new(RpmTracker::new(settings.rpm_window_size))),
            fan,
            registry,
            persistence,
            settings,
            calibration_lock: None,
            state: ControllerState::Starting,
            bounds,
            last_set_pwm: None,
            pwm_map: PwmMap::identity(),
            snapshot: Arc::new(snapshot),
        }
    }

    /// Serializes calibration with every other controller sharing `lock`.
    pub fn with_calibration_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.calibration_lock = Some(lock);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<FanSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn id(&self) -> &str {
        self.fan.id()
    }

    /// Drives the fan until `cancel` fires or an error occurs.
    ///
    /// Returns `Ok(())` after cancellation. The fan is restored before this
    /// returns in both cases.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ControlError> {
        self.set_state(ControllerState::Starting);

        let original_mode = if self.fan.supports(Feature::PwmEnable) {
            Some(self.hw(self.fan.pwm_enabled(), "get_pwm_enabled")?)
        } else {
            None
        };
        let guard = RestoreGuard::new(Arc::clone(&self.fan), original_mode);

        let result = self.drive(&cancel).await;
        if let Err(e) = &result {
            error!("Fan '{}': {e}", self.id());
        }

        self.set_state(ControllerState::Restoring);
        self.persist_live_calibration().await;
        drop(guard);
        self.set_state(ControllerState::Stopped);

        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), ControlError> {
        self.ensure_manual_mode()?;
        if sleep_or_cancel(cancel, self.settings.startup_delay).await.is_break() {
            return Ok(());
        }

        let sampler = sample_rpm(
            Arc::clone(&self.fan),
            Arc::clone(&self.rpm),
            Arc::clone(&self.snapshot),
            self.settings.rpm_poll_interval,
            cancel.clone(),
        );
        let control = async {
            if self.initialize(cancel).await?.is_break() {
                return Ok(());
            }
            self.run_active(cancel).await
        };

        tokio::try_join!(sampler, control).map(|_| ())
    }

    /// Switches the fan to manual control, trying mode 1 then mode 0.
    fn ensure_manual_mode(&self) -> Result<(), ControlError> {
        if !self.fan.supports(Feature::PwmEnable) {
            return Ok(());
        }

        let mut actual = None;
        for mode in [PWM_ENABLE_MANUAL, PWM_ENABLE_DISABLED] {
            if let Err(e) = self.fan.set_pwm_enabled(mode) {
                debug!("Fan '{}': pwm_enable {mode} rejected: {e}", self.id());
                continue;
            }
            let read_back = self.hw(self.fan.pwm_enabled(), "get_pwm_enabled")?;
            if read_back == mode {
                info!("Fan '{}': manual control enabled (mode {mode})", self.id());
                return Ok(());
            }
            actual = Some(read_back);
        }

        Err(ControlError::VerificationMismatch {
            fan: self.id().to_string(),
            what: "PWM mode stuck",
            expected: PWM_ENABLE_MANUAL,
            actual: actual.unwrap_or(-1),
        })
    }

    async fn initialize(&mut self, cancel: &CancellationToken) -> Result<ControlFlow<()>, ControlError> {
        let data = match self.load_or_calibrate(cancel).await? {
            ControlFlow::Break(()) => return Ok(ControlFlow::Break(())),
            ControlFlow::Continue(data) => data,
        };

        self.bounds = derive_bounds(self.fan.profile(), data.as_ref());
        info!(
            "Fan '{}': min={} start={} max={}",
            self.id(),
            self.bounds.min,
            self.bounds.start,
            self.bounds.max
        );
        {
            let mut rpm = self.rpm.lock().await;
            rpm.track_calibration = data.is_some();
            rpm.calibration = data.unwrap_or_default();
        }

        if self.build_pwm_map(cancel).await?.is_break() {
            return Ok(ControlFlow::Break(()));
        }
        self.last_set_pwm = None;
        self.publish();
        Ok(ControlFlow::Continue(()))
    }

    async fn load_or_calibrate(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<ControlFlow<(), Option<PwmData>>, ControlError> {
        match self.persistence.load_fan_pwm_data(self.id()) {
            Ok(Some(data)) if !data.is_empty() => {
                info!("Fan '{}': using persisted calibration ({} points)", self.id(), data.len());
                return Ok(ControlFlow::Continue(Some(data)));
            }
            Ok(_) => {}
            Err(e) => warn!("Fan '{}': cannot load calibration: {e}", self.id()),
        }

        if !(self.fan.supports(Feature::RpmSensor) && self.fan.supports(Feature::PwmReadback)) {
            info!("Fan '{}': calibration not supported, using configured bounds", self.id());
            return Ok(ControlFlow::Continue(None));
        }

        let lock = self.calibration_lock.clone();
        let _permit = match &lock {
            Some(lock) => tokio::select! {
                () = cancel.cancelled() => return Ok(ControlFlow::Break(())),
                permit = lock.lock() => Some(permit),
            },
            None => None,
        };

        self.set_state(ControllerState::Calibrating);
        let data = match self.calibrate(cancel).await? {
            ControlFlow::Break(()) => return Ok(ControlFlow::Break(())),
            ControlFlow::Continue(data) => data,
        };

        if let Err(e) = self.persistence.save_fan_pwm_data(self.id(), &data) {
            warn!("Fan '{}': cannot persist calibration: {e}", self.id());
        }
        Ok(ControlFlow::Continue(Some(data)))
    }

    /// Sweeps every duty cycle and records the RPM each one produces.
    async fn calibrate(&mut self, cancel: &CancellationToken) -> Result<ControlFlow<(), PwmData>, ControlError> {
        info!("Fan '{}': calibrating", self.id());
        let mut data = BTreeMap::new();
        let mut settled = false;

        for pwm in 0..=MAX_PWM {
            self.io("set_pwm", move |fan| fan.set_pwm(pwm)).await?;
            let actual = self.io("get_pwm", |fan| fan.pwm()).await?;
            if actual != pwm {
                debug!("Fan '{}': PWM {pwm} read back as {actual}, skipping", self.id());
                continue;
            }

            let flow = if settled {
                sleep_or_cancel(cancel, self.settings.calibration_step_delay).await
            } else {
                settled = true;
                self.wait_until_settled(cancel).await?
            };
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }

            let rpm = self.io("get_rpm", |fan| fan.rpm()).await?;
            debug!("Fan '{}': PWM {pwm} -> {rpm} RPM", self.id());
            data.insert(pwm, f64::from(rpm));
        }

        if data.is_empty() {
            return Err(ControlError::CalibrationIncomplete {
                fan: self.id().to_string(),
                reason: "no duty cycle was honoured by the hardware".into(),
            });
        }
        info!("Fan '{}': calibration finished with {} points", self.id(), data.len());
        Ok(ControlFlow::Continue(data))
    }

    /// Waits until consecutive RPM deltas stay below the settle threshold.
    async fn wait_until_settled(&self, cancel: &CancellationToken) -> Result<ControlFlow<()>, ControlError> {
        let threshold = self.settings.settle_threshold;
        let mut deltas = RollingWindow::new(self.settings.rpm_window_size);
        deltas.fill(threshold * 2.0);

        let deadline = Instant::now() + self.settings.max_settle_wait;
        let mut last = f64::from(self.io("get_rpm", |fan| fan.rpm()).await?);

        while deltas.max().is_some_and(|d| d > threshold) {
            if Instant::now() >= deadline {
                warn!("Fan '{}': RPM did not settle within {:?}", self.id(), self.settings.max_settle_wait);
                break;
            }
            if sleep_or_cancel(cancel, self.settings.settle_poll_interval).await.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            let rpm = f64::from(self.io("get_rpm", |fan| fan.rpm()).await?);
            deltas.push((rpm - last).abs());
            last = rpm;
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Loads or measures the quantization table.
    async fn build_pwm_map(&mut self, cancel: &CancellationToken) -> Result<ControlFlow<()>, ControlError> {
        if !self.fan.supports(Feature::PwmReadback) {
            self.pwm_map = PwmMap::identity();
            return Ok(ControlFlow::Continue(()));
        }

        match self.persistence.load_fan_pwm_map(self.id()) {
            Ok(Some(table)) if !table.is_empty() => {
                self.pwm_map = PwmMap::new(table);
                debug!("Fan '{}': using persisted quantization table", self.id());
                return Ok(ControlFlow::Continue(()));
            }
            Ok(_) => {}
            Err(e) => warn!("Fan '{}': cannot load quantization table: {e}", self.id()),
        }

        self.set_state(ControllerState::Mapping);
        let mut table = BTreeMap::new();
        for pwm in 0..=MAX_PWM {
            self.io("set_pwm", move |fan| fan.set_pwm(pwm)).await?;
            if sleep_or_cancel(cancel, self.settings.pwm_set_delay).await.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            table.insert(pwm, self.io("get_pwm", |fan| fan.pwm()).await?);
        }

        if let Err(e) = self.persistence.save_fan_pwm_map(self.id(), &table) {
            warn!("Fan '{}': cannot persist quantization table: {e}", self.id());
        }
        self.pwm_map = PwmMap::new(table);
        info!(
            "Fan '{}': {} distinct duty cycles",
            self.id(),
            self.pwm_map.distinct().len()
        );
        Ok(ControlFlow::Continue(()))
    }

    async fn run_active(&mut self, cancel: &CancellationToken) -> Result<(), ControlError> {
        self.set_state(ControllerState::Active);
        let mut ticks = interval(self.settings.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticks.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    /// One adjustment step. Returns the duty cycle written, if any.
    pub(crate) async fn tick(&mut self) -> Result<Option<u8>, ControlError> {
        let current = if self.fan.supports(Feature::PwmReadback) {
            let current = self.io("get_pwm", |fan| fan.pwm()).await?;
            self.check_interference(current);
            current
        } else {
            // write-only fans: trust the last command
            self.last_set_pwm.unwrap_or(0)
        };

        let target = match self.compute_target(current).await {
            Ok(target) => target,
            Err(e @ ControlError::NeverStopViolation { .. }) => {
                error!("{e}");
                self.snapshot.send_modify(|s| s.never_stop_violation = true);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if Some(target) == self.last_set_pwm {
            return Ok(None);
        }
        self.write_pwm(target).await?;
        Ok(Some(target))
    }

    async fn compute_target(&mut self, current: u8) -> Result<u8, ControlError> {
        let curve_id = self.fan.curve_id();
        let curve = self.registry.curve(curve_id).ok_or_else(|| {
            ControlError::ConfigurationDefect(format!("fan '{}' uses unknown curve '{curve_id}'", self.fan.id()))
        })?;

        let raw = curve.evaluate(&self.registry)?;
        if !(0..=i32::from(MAX_PWM)).contains(&raw) {
            warn!("Fan '{}': curve '{curve_id}' value {raw} out of range, clamping", self.id());
        }
        let clamped = raw.clamp(0, i32::from(MAX_PWM)) as u8;

        let remapped = self.remap(clamped);
        let stepped = self
            .control_loop
            .cycle(remapped, self.last_set_pwm.unwrap_or(current));
        let mut target = self.pwm_map.closest(stepped);

        if self.fan.should_never_stop() && Some(target) == self.last_set_pwm {
            let mut rpm = self.rpm.lock().await;
            if rpm.avg <= 0.0 {
                if self.bounds.min >= self.bounds.max {
                    return Err(ControlError::NeverStopViolation {
                        fan: self.id().to_string(),
                        pwm: target,
                        rpm_avg: rpm.avg,
                    });
                }
                self.bounds.min += 1;
                target = target.saturating_add(1).max(self.bounds.min);
                rpm.avg = ESCALATION_RPM_SEED;
                warn!(
                    "Fan '{}' is not spinning, raising min PWM to {}",
                    self.id(),
                    self.bounds.min
                );
            }
        }

        Ok(target)
    }

    /// Maps `[0, 255]` linearly onto the fan's operating range.
    fn remap(&self, target: u8) -> u8 {
        let lower = if self.fan.should_never_stop() {
            self.bounds.min.max(self.bounds.start)
        } else {
            self.bounds.min
        };
        let upper = self.bounds.max;
        if upper <= lower {
            return lower;
        }
        let span = u32::from(upper - lower);
        lower + (u32::from(target) * span / u32::from(MAX_PWM)) as u8
    }

    fn check_interference(&self, current: u8) {
        if let Some(last) = self.last_set_pwm {
            let expected = self.pwm_map.actual(last);
            if current != expected {
                warn!(
                    "Fan '{}': PWM changed by a third party (expected {expected}, found {current})",
                    self.id()
                );
            }
        }
    }

    async fn write_pwm(&mut self, pwm: u8) -> Result<(), ControlError> {
        self.io("set_pwm", move |fan| fan.set_pwm(pwm)).await?;
        debug!("Fan '{}': PWM set to {pwm}", self.id());
        self.last_set_pwm = Some(pwm);
        self.rpm.lock().await.pwm = Some(pwm);
        self.publish();
        Ok(())
    }

    async fn persist_live_calibration(&self) {
        let rpm = self.rpm.lock().await;
        if !rpm.dirty || rpm.calibration.is_empty() {
            return;
        }
        if let Err(e) = self.persistence.save_fan_pwm_data(self.id(), &rpm.calibration) {
            warn!("Fan '{}': cannot persist calibration: {e}", self.id());
        }
    }

    fn set_state(&mut self, state: ControllerState) {
        if self.state != state {
            info!("Fan '{}': {} -> {state}", self.id(), self.state);
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let (state, bounds, last_set_pwm) = (self.state, self.bounds, self.last_set_pwm);
        self.snapshot.send_modify(|s| {
            s.state = state;
            s.bounds = bounds;
            s.last_set_pwm = last_set_pwm;
        });
    }

    fn hw<T>(&self, result: anyhow::Result<T>, operation: &'static str) -> Result<T, ControlError> {
        result.map_err(|e| ControlError::hardware(self.fan.id(), operation, e))
    }

    async fn io<T, F>(&self, operation: &'static str, f: F) -> Result<T, ControlError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Fan) -> anyhow::Result<T> + Send + 'static,
    {
        fan_io(&self.fan, operation, f).await
    }
}

/// Runs one fan operation on the blocking thread pool; back-ends may shell out.
async fn fan_io<T, F>(fan: &Arc<dyn Fan>, operation: &'static str, f: F) -> Result<T, ControlError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Fan) -> anyhow::Result<T> + Send + 'static,
{
    let handle = Arc::clone(fan);
    let result = tokio::task::spawn_blocking(move || f(handle.as_ref()))
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("hardware task failed: {e}")));
    result.map_err(|e| ControlError::hardware(fan.id(), operation, e))
}

/// Samples the tachometer, feeding the RPM average and live calibration.
async fn sample_rpm(
    fan: Arc<dyn Fan>,
    rpm: Arc<Mutex<RpmTracker>>,
    snapshot: Arc<watch::Sender<FanSnapshot>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<(), ControlError> {
    if !fan.supports(Feature::RpmSensor) {
        cancel.cancelled().await;
        return Ok(());
    }

    let mut ticks = IntervalStream::new(interval(poll_interval));
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            Some(_) = ticks.next() => {
                let value = fan_io(&fan, "get_rpm", |fan| fan.rpm()).await?;
                let avg = rpm.lock().await.record(f64::from(value));
                snapshot.send_modify(|s| s.rpm_avg = avg);
            }
        }
    }
}
