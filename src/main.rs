use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use headlight_monitor::config::AppConfig;
use headlight_monitor::monitor::MonitorHandle;
use headlight_monitor::publisher::{LogSurface, PresentationSurface};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    // Optional config path as first argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).await?;
    let settings = config.monitor_settings()?;
    let announcer = config.build_announcer();

    info!(
        "Monitoring {} on {} as {}",
        settings.mqtt.topic, settings.mqtt.broker, settings.mqtt.client_id
    );

    let surfaces: Vec<Arc<dyn PresentationSurface>> = vec![Arc::new(LogSurface)];
    let monitor = MonitorHandle::new(settings, announcer, surfaces);

    monitor
        .start()
        .await
        .map_err(|e| eyre!("Failed to start monitor: {}", e))?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    monitor.stop().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
