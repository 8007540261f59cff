//! TOML configuration for the `docsync` binary.
//!
//! ```toml
//! [engine]
//! batch_size = 4000
//!
//! [source]
//! seed_dir = "data/source"
//!
//! [target]
//! output_dir = "data/target"
//!
//! [checkpoints]
//! dir = ".docsync/checkpoints"
//!
//! [[transfers]]
//! source_database = "shop"
//! source_collection = "orders"
//! target_bucket = "main"
//! target_scope = "_default"
//! target_collection = "orders"
//! checkpoint_id = "shop-orders"
//! ```

use std::path::{Path, PathBuf};

use docsync_migration_models::{MigrationConfig, TransferRequest};
use serde::{Deserialize, Serialize};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "docsync.toml";

/// Errors that can occur while loading or printing the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read {path}: {source}", path = path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML or does not match the schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Seed directory laid out as `{seed_dir}/{database}/{collection}.json`.
    pub seed_dir: PathBuf,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            seed_dir: PathBuf::from("data/source"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    /// Where the target snapshot is written, as
    /// `{output_dir}/{bucket}/{scope}/{collection}.json`.
    pub output_dir: PathBuf,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/target"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub dir: PathBuf,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".docsync/checkpoints"),
        }
    }
}

/// One configured transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    #[serde(flatten)]
    pub request: TransferRequest,
    /// Makes the transfer resumable under this checkpoint id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

/// The whole config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocsyncConfig {
    pub engine: MigrationConfig,
    pub source: SourceSection,
    pub target: TargetSection,
    pub checkpoints: CheckpointSection,
    pub transfers: Vec<TransferEntry>,
}

impl DocsyncConfig {
    /// Parses a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text does not match the schema.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the config at `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Renders the effective config as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Render`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Returns the transfers to run, filtered by the `--transfers` CLI
    /// flag or the `DOCSYNC_TRANSFERS` environment variable (comma
    /// separated migration keys). If neither is set, all transfers are
    /// returned.
    #[must_use]
    pub fn enabled_transfers(&self, cli_filter: Option<String>) -> Vec<TransferEntry> {
        let filter = cli_filter.or_else(|| std::env::var("DOCSYNC_TRANSFERS").ok());
        self.filter_transfers(filter.as_deref())
    }

    fn filter_transfers(&self, filter: Option<&str>) -> Vec<TransferEntry> {
        let Some(filter) = filter else {
            return self.transfers.clone();
        };

        let keys: Vec<&str> = filter.split(',').map(str::trim).collect();
        let filtered: Vec<TransferEntry> = self
            .transfers
            .iter()
            .filter(|entry| keys.contains(&entry.request.migration_key().as_str()))
            .cloned()
            .collect();

        if filtered.is_empty() {
            log::warn!(
                "No matching transfers found for filter {:?}. Available: {}",
                keys,
                self.transfers
                    .iter()
                    .map(|entry| entry.request.migration_key())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        filtered
    }
}

/// The config path from `--config`, else `DOCSYNC_CONFIG`, else
/// [`DEFAULT_CONFIG_PATH`].
#[must_use]
pub fn config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path
        .or_else(|| std::env::var_os("DOCSYNC_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [engine]
        batch_size = 500
        concurrency = 8

        [source]
        seed_dir = "fixtures"

        [[transfers]]
        source_database = "shop"
        source_collection = "orders"
        target_bucket = "main"
        target_scope = "_default"
        target_collection = "orders"
        checkpoint_id = "shop-orders"

        [[transfers]]
        source_database = "shop"
        source_collection = "customers"
        target_bucket = "main"
        target_scope = "_default"
        target_collection = "people"
    "#;

    #[test]
    fn parses_sections_and_fills_defaults() {
        let config = DocsyncConfig::from_toml(SAMPLE).unwrap();

        assert_eq!(config.engine.batch_size, 500);
        assert_eq!(config.engine.concurrency, 8);
        assert_eq!(config.engine.tag_field, "sourceCollection");
        assert_eq!(config.source.seed_dir, PathBuf::from("fixtures"));
        assert_eq!(config.target, TargetSection::default());
        assert_eq!(config.transfers.len(), 2);
        assert_eq!(config.transfers[0].checkpoint_id.as_deref(), Some("shop-orders"));
        assert_eq!(config.transfers[1].request.target_collection, "people");
        assert_eq!(config.transfers[1].checkpoint_id, None);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(DocsyncConfig::from_toml("").unwrap(), DocsyncConfig::default());
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(matches!(
            DocsyncConfig::from_toml("[engine]\nbatch_size = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn filter_selects_by_migration_key() {
        let config = DocsyncConfig::from_toml(SAMPLE).unwrap();

        let selected = config.filter_transfers(Some("shop.customers, shop.missing"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].request.source_collection, "customers");

        assert_eq!(config.filter_transfers(None).len(), 2);
        assert!(config.filter_transfers(Some("other.db")).is_empty());
    }

    #[test]
    fn rendered_config_parses_back() {
        let config = DocsyncConfig::from_toml(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        assert_eq!(DocsyncConfig::from_toml(&rendered).unwrap(), config);
    }
}
