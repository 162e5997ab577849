//! Importer configuration.
//!
//! Supports loading from YAML files with environment variable overrides,
//! then converting into the core crate's [`listen_publisher_core::PublisherConfig`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Importer configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Lexicon collection to publish into.
    /// Override: `LISTEN_IMPORTER_COLLECTION`
    pub collection: String,

    /// Root directory for persisted component state.
    /// Override: `LISTEN_IMPORTER_STATE_ROOT`
    pub state_root: PathBuf,

    /// Base URL of the account's personal data server.
    /// Override: `LISTEN_IMPORTER_PDS_ENDPOINT`
    pub pds_endpoint: String,

    /// Fixed clock id for the TID generator, mainly useful for
    /// reproducible dry runs.
    pub fixed_clock_id: Option<u64>,

    /// If `true`, never actually calls `applyWrites`.
    pub dry_run: bool,

    /// Multiplier on the governor's advertised remaining quota.
    /// Default: 0.75.
    pub safety_factor: Option<f64>,

    /// Sets the safety factor to 0.85 instead of the default 0.75.
    pub aggressive: bool,

    /// Fixes the adaptive sizer's initial batch size instead of
    /// estimating it from the backlog.
    pub batch_size: Option<u32>,

    /// Hours a populated remote record cache is trusted. Default: 24.
    pub cache_ttl_hours: Option<i64>,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            collection: "fm.teal.alpha.feed.play".to_string(),
            state_root: PathBuf::from("./state"),
            pds_endpoint: String::new(),
            fixed_clock_id: None,
            dry_run: false,
            safety_factor: None,
            aggressive: false,
            batch_size: None,
            cache_ttl_hours: None,
        }
    }
}

impl ImporterConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LISTEN_IMPORTER_COLLECTION") {
            self.collection = val;
        }
        if let Ok(val) = std::env::var("LISTEN_IMPORTER_STATE_ROOT") {
            self.state_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("LISTEN_IMPORTER_PDS_ENDPOINT") {
            self.pds_endpoint = val;
        }
    }

    /// Converts to listen-publisher-core's `PublisherConfig`.
    pub fn to_core_config(&self) -> listen_publisher_core::PublisherConfig {
        listen_publisher_core::PublisherConfig {
            collection: self.collection.clone(),
            state_root: self.state_root.clone(),
            pds_endpoint: self.pds_endpoint.clone(),
            fixed_clock_id: self.fixed_clock_id,
            dry_run: self.dry_run,
            safety_factor: self.safety_factor,
            aggressive: self.aggressive,
            batch_size_override: self.batch_size,
            cache_ttl_hours: self.cache_ttl_hours,
        }
    }
}
