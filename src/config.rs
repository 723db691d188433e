//! Startup configuration: batching limits and entity shapes.

use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::OnDuplicate;
use crate::error::ConfigError;
use crate::projection::ShapeRegistry;

/// Batching limits shared by every loader built from the same
/// [`LoaderRules`](crate::LoaderRules).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Close a batch once it holds this many distinct keys. Unbounded when
    /// unset.
    pub max_batch_size: Option<NonZeroUsize>,

    /// Extra milliseconds to hold a batch open after it's first polled.
    pub delay_ms: Option<u64>,

    pub on_duplicate: OnDuplicate,
}

impl LoaderConfig {
    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }
}

/// Everything the loader layer reads once at startup.
///
/// ```json
/// {
///   "loader": { "max_batch_size": 100 },
///   "shapes": [
///     { "name": "Company", "fields": { "_id": "scalar", "name": "scalar" } }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub loader: LoaderConfig,
    pub shapes: ShapeRegistry,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.shapes.validate()?;
        debug!(
            shapes = config.shapes.len(),
            max_batch_size = ?config.loader.max_batch_size,
            delay_ms = ?config.loader.delay_ms,
            "loaded config"
        );
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}
