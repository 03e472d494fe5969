use std::{sync::Arc, time::Duration};

use super::{handle_signals, Cli};
use anyhow::Result;
use fabricator_api::{Config, EmulatorRegistry, FleetPorts, MemoryGateway, Registry};

// How often finished jobs are checked against the retention window.
const RETENTION_SWEEP: Duration = Duration::from_secs(60 * 60);

pub async fn main(_cli: &Cli, cfg: &Config) -> Result<()> {
    let registry = Arc::new(Registry::new(
        cfg,
        FleetPorts::new(EmulatorRegistry::default()),
        Arc::new(MemoryGateway::new()),
    ));

    let interval = cfg.discovery.interval();
    tokio::spawn({
        let registry = registry.clone();
        async move { registry.discover_forever(interval).await }
    });

    let max_age = cfg.retention.max_age();
    tokio::spawn({
        let registry = registry.clone();
        async move {
            loop {
                if let Err(e) = registry.clear_space(max_age).await {
                    tracing::warn!(error = format!("{:?}", e), "retention sweep failed");
                }
                tokio::time::sleep(RETENTION_SWEEP).await;
            }
        }
    });

    tracing::info!(
        interval_secs = interval.as_secs(),
        export_dir = registry.export_dir().display().to_string(),
        "serving fleet"
    );
    handle_signals().await?;

    tracing::info!("triggering cleanup...");
    registry.shutdown().await;
    tracing::info!("all clean, exiting!");
    Ok(())
}
