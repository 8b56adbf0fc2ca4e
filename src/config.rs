//! Configuration management for the crop analysis service
//!
//! This module handles all configuration settings, including server settings,
//! model discovery, persistence, uploads and logging, plus the table of known
//! model families with their default class layouts.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure for the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Model discovery and device configuration
    pub models: ModelsConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Analysis and upload configuration
    pub analysis: AnalysisConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

/// Model discovery and device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory scanned for checkpoint artifacts at startup
    pub directory: PathBuf,
    /// Device to use for inference (cpu, cuda)
    pub device: String,
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    pub path: PathBuf,
    /// Maximum pool connections
    pub max_connections: u32,
}

/// Analysis and upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Directory where spot images are stored
    pub uploads_dir: PathBuf,
    /// Square side length images are resized to before inference
    pub image_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            models: ModelsConfig::default(),
            database: DatabaseConfig::default(),
            analysis: AnalysisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            enable_cors: true,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("models"),
            device: "cpu".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("crop_analysis.db"),
            max_connections: 5,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("uploads"),
            image_size: 224,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("CROPSIGHT_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("CROPSIGHT_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ServiceError::config("Invalid port number"))?;
        }
        if let Ok(cors) = std::env::var("CROPSIGHT_ENABLE_CORS") {
            config.server.enable_cors = cors
                .parse()
                .map_err(|_| ServiceError::config("Invalid CORS flag"))?;
        }

        if let Ok(dir) = std::env::var("CROPSIGHT_MODELS_DIR") {
            config.models.directory = PathBuf::from(dir);
        }
        if let Ok(device) = std::env::var("CROPSIGHT_DEVICE") {
            config.models.device = device;
        }

        if let Ok(db) = std::env::var("CROPSIGHT_DATABASE_PATH") {
            config.database.path = PathBuf::from(db);
        }
        if let Ok(max) = std::env::var("CROPSIGHT_DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = max
                .parse()
                .map_err(|_| ServiceError::config("Invalid max connections"))?;
        }

        if let Ok(dir) = std::env::var("CROPSIGHT_UPLOADS_DIR") {
            config.analysis.uploads_dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("CROPSIGHT_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("CROPSIGHT_LOG_FORMAT") {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(ServiceError::config("Server port cannot be 0"));
        }
        if !["cpu", "cuda"].contains(&self.models.device.as_str()) {
            return Err(ServiceError::config("Device must be one of: cpu, cuda"));
        }
        if self.database.max_connections == 0 {
            return Err(ServiceError::config(
                "Database max connections must be greater than 0",
            ));
        }
        if self.analysis.image_size == 0 {
            return Err(ServiceError::config("Image size must be greater than 0"));
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(ServiceError::config(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }
        Ok(())
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Default class layout for one known model family.
///
/// The table is pure data supplied to the model zoo; the checkpoint loader
/// overrides `num_classes` and `class_names` when it can infer them from the
/// artifact itself.
#[derive(Debug, Clone)]
pub struct KnownModel {
    pub name: &'static str,
    pub num_classes: usize,
    pub class_names: &'static [&'static str],
}

/// Class names of the five-way leaf disease models
pub const MULTI_CLASS_NAMES: [&str; 5] = ["Cerscospora", "Healthy", "Leaf rust", "Miner", "Phoma"];

/// Class names of the binary health models
pub const BINARY_CLASS_NAMES: [&str; 2] = ["Healthy", "Not Healthy"];

/// The registry of model families the scanner will match artifact files
/// against, in matching priority order.
pub fn known_models() -> Vec<KnownModel> {
    vec![
        KnownModel {
            name: "CustomCNN1",
            num_classes: 5,
            class_names: &MULTI_CLASS_NAMES,
        },
        KnownModel {
            name: "CustomCNN2",
            num_classes: 5,
            class_names: &MULTI_CLASS_NAMES,
        },
        KnownModel {
            name: "CustomCNN3",
            num_classes: 5,
            class_names: &MULTI_CLASS_NAMES,
        },
        KnownModel {
            name: "BinaryCNN_Light",
            num_classes: 2,
            class_names: &BINARY_CLASS_NAMES,
        },
        KnownModel {
            name: "BinaryCNN_Deep",
            num_classes: 2,
            class_names: &BINARY_CLASS_NAMES,
        },
        KnownModel {
            name: "BinaryCNN_Efficient",
            num_classes: 2,
            class_names: &BINARY_CLASS_NAMES,
        },
    ]
}

/// Canonical class names for a detected class count
pub fn class_names_for(num_classes: usize) -> Vec<String> {
    match num_classes {
        2 => BINARY_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        5 => MULTI_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        n => (0..n).map(|i| format!("Class_{i}")).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.models.device, "cpu");
        assert_eq!(config.analysis.image_size, 224);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());

        config.server.port = 5000;
        config.models.device = "tpu".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_address() {
        let config = Config::default();
        assert_eq!(config.server_address(), "0.0.0.0:5000");
    }

    #[test]
    fn test_class_names_for_known_counts() {
        assert_eq!(class_names_for(2), vec!["Healthy", "Not Healthy"]);
        assert_eq!(class_names_for(5).len(), 5);
        assert_eq!(class_names_for(10)[3], "Class_3");
    }

    #[test]
    fn test_known_models_cover_both_class_layouts() {
        let known = known_models();
        assert_eq!(known.len(), 6);
        assert!(known.iter().any(|m| m.num_classes == 5));
        assert!(known.iter().any(|m| m.num_classes == 2));
    }
}
