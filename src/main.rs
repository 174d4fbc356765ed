use anyhow::Result;
use gridshare::{ChargingController, Config, DatapointRegistry, MemoryRegistry};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let first = args.next();

    #[cfg(feature = "schema")]
    if first.as_deref() == Some("--schema") {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = match first.as_deref() {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    gridshare::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    info!(
        "Gridshare {} starting with {} connector(s)",
        env!("CARGO_PKG_VERSION"),
        config.connectors.len()
    );

    // Optional JSON seed for the in-memory registry
    let seed = args.next().or_else(|| std::env::var("GRIDSHARE_SEED").ok());
    let registry = match seed {
        Some(path) => MemoryRegistry::from_json_file(&path, chrono::Utc::now())
            .map_err(|e| anyhow::anyhow!("Failed to load registry seed {}: {}", path, e))?,
        None => MemoryRegistry::new(),
    };
    let registry: Arc<dyn DatapointRegistry> = Arc::new(registry);

    let mut controller = ChargingController::new(config, registry)
        .map_err(|e| anyhow::anyhow!("Failed to create controller: {}", e))?;

    let shutdown = controller.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(());
        }
    });

    match controller.run().await {
        Ok(()) => {
            info!("Shutdown complete after {} cycle(s)", controller.total_cycles());
            Ok(())
        }
        Err(e) => {
            error!("Controller failed with error: {}", e);
            Err(anyhow::anyhow!("Controller error: {}", e))
        }
    }
}
