use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use energy_collector::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use energy_collector::error::CollectorError;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!(
        "{} {} starting, PID is {}",
        version::NAME,
        version::VERSION,
        std::process::id()
    );

    let store = Arc::new(store_repo::InfluxStore::connect(&app_config.store)?);
    let hub = Arc::new(hub_repo::MqttHub::new(app_config.hub.clone()));
    let restart_delay = Duration::from_secs(app_config.collector.restart_delay_secs);

    let collector = match collector::Collector::start(app_config, store, hub).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return Ok(ExitCode::from(1));
        }
    };

    match collector.run(shutdown_signal()).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(CollectorError::WatchdogTimeout(source)) => {
            tracing::error!(
                source = %source,
                restart_delay_secs = restart_delay.as_secs(),
                "lost connection to hub; exiting for restart"
            );
            tokio::time::sleep(restart_delay).await;
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            tracing::error!(error = %e, "collector failed");
            Ok(ExitCode::from(1))
        }
    }
}
