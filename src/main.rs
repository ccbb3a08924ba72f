use std::fs::File;

use anyhow::{Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use fanwarden::{
    application::Application,
    cli::{self, Cli, Command},
    config::ConfigManager,
};

fn init_syslog(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: "fanwarden".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn init_env_logger(level: LevelFilter) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();
}

fn into_daemon() -> Result<()> {
    File::create("/var/tmp/fanwarden.log")
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

async fn run(cli: Cli) -> Result<()> {
    let config_manager = ConfigManager::load(cli.config.clone()).await?;

    match cli.command() {
        Command::Run => {
            info!(
                "fanwarden {} using {}",
                env!("CARGO_PKG_VERSION"),
                config_manager.path().display()
            );
            Application::builder()
                .with_config_manager(config_manager)
                .build()?
                .run()
                .await
        }
        Command::ResetFan { id } => cli::reset_fan(&*config_manager.get().await, &id),
        Command::Curves => cli::print_curves(&*config_manager.get().await).await.map(|_| ()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // fork before the runtime starts its worker threads
    if cli.daemonize && cli.command() == Command::Run {
        init_syslog(level).and(into_daemon())?;
    } else {
        init_env_logger(level);
    }

    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}
