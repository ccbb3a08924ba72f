//! # fanwarden
//!
//! A Linux daemon driving PWM fans from temperature sensors.
//!
//! ## Features
//!
//! - **Speed Curves**: linear, stepped, PID and composite curves over smoothed sensor readings
//! - **Calibration**: measures each fan's RPM response and PWM quantization once and persists it
//! - **Fan Controllers**: one supervised state machine per fan with rate limited adjustments
//! - **Safe Exit**: every fan is handed back to its original mode, or full speed, on shutdown
//! - **Back-ends**: hwmon sysfs, plain files, external commands and lm-sensors
//!
//! ## Architecture
//!
//! The daemon uses a provider-based dependency injection system with:
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - Main lifecycle manager
//! - [`EventBus`](event::EventBus) - Inter-service communication
//! - [`AppState`](app_context::AppState) - Shared application state
//! - [`FanController`](fan_controller::FanController) - Per-fan control loop
//!
//! ## Example
//!
//! ```no_run
//! use fanwarden::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod cli;
pub mod config;
pub mod control_loop;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod exec;
pub mod fan_controller;
pub mod fan_curve;
pub mod fans;
pub mod persistence;
pub mod providers;
pub mod registry;
pub mod sensors;
pub mod smoothing;
pub mod task_manager;
pub mod temperature_sensors;

#[cfg(test)]
mod testing;
