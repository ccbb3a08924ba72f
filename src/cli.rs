//! Command line interface.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    app_context::build_registry,
    config::Config,
    persistence::{JsonFilePersistence, Persistence},
};

/// fanwarden: temperature driven PWM fan control daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $FANWARDEN_CONFIG, then the XDG config dir, then /etc/fanwarden/config.yml)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and log to syslog
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Log at debug level
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the control daemon (default)
    Run,
    /// Forget a fan's calibration so it is measured again on next start
    ResetFan {
        /// Fan id as written in the configuration
        id: String,
    },
    /// Sample every sensor once and print the value of every curve
    Curves,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// Deletes the persisted calibration and quantization table of one fan.
pub fn reset_fan(config: &Config, id: &str) -> Result<()> {
    if !config.fans.iter().any(|fan| fan.id == id) {
        anyhow::bail!("No fan with id '{id}' in the configuration");
    }
    let persistence = JsonFilePersistence::new(&config.db_path);
    persistence
        .delete_fan_pwm_data(id)
        .and_then(|()| persistence.delete_fan_pwm_map(id))
        .with_context(|| format!("Failed to reset fan '{id}'"))?;
    println!("Calibration data of fan '{id}' removed");
    Ok(())
}

/// Reads every sensor once, then evaluates all curves against those readings.
///
/// The configuration is validated first; function curves recurse into their
/// children and must never see a cycle.
pub async fn print_curves(config: &Config) -> Result<Vec<(String, i32)>> {
    config.validate().context("Invalid configuration")?;
    let registry = build_registry(config)?;
    let timeout = Duration::from_millis(config.temp_sensor_poll_rate_ms.max(1000));

    for sensor in registry.sensors() {
        match tokio::time::timeout(timeout, sensor.read_value()).await {
            Ok(Ok(value)) => {
                sensor.set_moving_avg(value);
                println!("sensor {:<20} {:>8.1} °C", sensor.id(), value / 1000.0);
            }
            Ok(Err(e)) => println!("sensor {:<20} error: {e:#}", sensor.id()),
            Err(_) => println!("sensor {:<20} timed out", sensor.id()),
        }
    }

    let mut values = Vec::new();
    for curve in registry.curves() {
        let value = curve.evaluate(&registry)?;
        println!("curve  {:<20} {value:>8}", curve.id());
        values.push((curve.id().to_string(), value));
    }
    Ok(values)
}
