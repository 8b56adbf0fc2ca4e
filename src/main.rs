//! Main entry point for the crop analysis service
//!
//! Loads configuration, prepares the database and the model zoo, runs the
//! artifact discovery scan and starts the HTTP server.

use candle_core::Device;
use cropsight::{
    api::start_server,
    arch::ArchitectureRegistry,
    config::{known_models, Config},
    db,
    error::Result,
    utils::{ensure_directory, init_logging},
    zoo::ModelZoo,
    VERSION,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize logging
    if let Err(e) = init_logging(&config.logging.level, &config.logging.format) {
        eprintln!("Failed to initialize logging: {}", e);
        return Err(e);
    }

    info!("Cropsight v{} starting", VERSION);
    info!("  Server: {}:{}", config.server.host, config.server.port);
    info!("  Models directory: {}", config.models.directory.display());
    info!("  Device: {}", config.models.device);
    info!("  Database: {}", config.database.path.display());

    ensure_directory(&config.analysis.uploads_dir)?;

    // Database
    let pool = db::connect(&config.database.path, config.database.max_connections).await?;

    // Model zoo and discovery scan
    let device = select_device(&config.models.device);
    let zoo = Arc::new(ModelZoo::new(
        device,
        ArchitectureRegistry::with_defaults(),
        known_models(),
    ));
    let discovered = zoo.scan_directory(&config.models.directory)?;
    if discovered == 0 {
        warn!(
            "No model artifacts matched in {}; prediction endpoints will return 503",
            config.models.directory.display()
        );
    }

    // Start the HTTP server
    start_server(config, zoo, pool).await
}

/// Resolve the configured device name, falling back to CPU when CUDA is
/// not available on this host.
fn select_device(name: &str) -> Device {
    if name == "cuda" {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(e) => warn!("CUDA requested but unavailable ({}); using CPU", e),
        }
    }
    Device::Cpu
}
