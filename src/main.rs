use tracing::info;

use parkd::config::Config;
use parkd::service::Service;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    parkd::observability::init(config.metrics_port)?;

    let service = Service::open(config)?;
    let cfg = &service.config;
    info!("parkd started");
    info!("  data_dir: {}", cfg.data_dir.display());
    info!("  platform admins: {}", cfg.platform_admins.len());
    info!("  compact_threshold: {}", cfg.compact_threshold);
    info!(
        "  metrics: {}",
        cfg.metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );
    service.start().await;

    // Run until SIGTERM/ctrl-c, then let in-flight jobs finish
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping scheduler");
    service.shutdown().await;
    info!("parkd stopped");
    Ok(())
}
