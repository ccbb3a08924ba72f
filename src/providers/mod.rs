//! Dependency injection providers for service management.
//!
//! Each provider builds one long-running service on top of the shared
//! [`AppState`](crate::app_context::AppState) and registers its tasks with
//! the [`TaskManager`](crate::task_manager::TaskManager).

pub mod app_state;
pub mod fan_control;
pub mod sensor_monitor;
pub mod traits;

pub use app_state::AppStateProvider;
pub use fan_control::FanControlServiceProvider;
pub use sensor_monitor::SensorMonitorServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};
