//! Configuration management for the entity registry
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (entities.toml)
//! - Environment variables (ENTITIES__*)
//!
//! ## Example config file (entities.toml):
//! ```toml
//! [registry]
//! verify_on_read = true
//!
//! [versioning]
//! track_moves = true
//! force = false
//!
//! [graph]
//! max_depth = 512
//!
//! [export]
//! format = "mermaid"
//! include_fields = false
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::graph::{ExportFormat, GraphBuilder, DEFAULT_MAX_DEPTH};
use crate::version::VersionOptions;

/// Main configuration for the entity registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Store settings
    #[serde(default)]
    pub registry: StoreConfig,

    /// Revision settings
    #[serde(default)]
    pub versioning: VersioningConfig,

    /// Graph builder limits
    #[serde(default)]
    pub graph: GraphConfig,

    /// Export settings
    #[serde(default)]
    pub export: ExportConfig,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Verify record checksums whenever an entity is read back
    #[serde(default = "default_true")]
    pub verify_on_read: bool,
}

/// Versioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersioningConfig {
    /// Re-version entities whose owning parent changed
    #[serde(default = "default_true")]
    pub track_moves: bool,

    /// Re-version every entity on every revision
    #[serde(default)]
    pub force: bool,
}

/// Graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum ownership depth below the root
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

/// Export configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Output format (mermaid or dot)
    #[serde(default)]
    pub format: ExportFormat,

    /// Include ids and scalar fields in node labels
    #[serde(default)]
    pub include_fields: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            verify_on_read: true,
        }
    }
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            track_moves: true,
            force: false,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = ["entities.toml", ".entities.toml", "config/entities.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "entities") {
            let xdg_config = config_dir.config_dir().join("entities.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (ENTITIES__*)
        builder = builder.add_source(
            Environment::with_prefix("ENTITIES")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Revision options implied by the `[versioning]` section
    pub fn version_options(&self) -> VersionOptions {
        VersionOptions {
            force: self.versioning.force,
            track_moves: self.versioning.track_moves,
        }
    }

    /// Graph builder honoring the `[graph]` section
    pub fn graph_builder(&self) -> GraphBuilder {
        GraphBuilder::new().max_depth(self.graph.max_depth)
    }
}
