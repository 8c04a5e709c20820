//! Read-only access to persisted client settings
//!
//! The orchestrator takes one snapshot per start attempt, on the caller's
//! task. Stores never hand out references, so later edits cannot reach an
//! attempt already in flight.

use super::{ClientConfig, Config};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;
use tracing::warn;

/// Source of the active client configuration
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Current configuration, or `None` when nothing usable is stored
    async fn snapshot(&self) -> Option<ClientConfig>;
}

/// Settings held in memory
#[derive(Default)]
pub struct MemorySettings {
    current: RwLock<Option<ClientConfig>>,
}

impl MemorySettings {
    pub fn new(config: Option<ClientConfig>) -> Self {
        MemorySettings {
            current: RwLock::new(config),
        }
    }

    /// Replace the stored configuration
    pub fn update(&self, config: Option<ClientConfig>) {
        *self.current.write() = config;
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn snapshot(&self) -> Option<ClientConfig> {
        let config = self.current.read().clone()?;
        config.validate().ok()?;
        Some(config)
    }
}

/// Settings read from the YAML config file on every snapshot
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSettings { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for FileSettings {
    async fn snapshot(&self) -> Option<ClientConfig> {
        match Config::load_async(&self.path).await {
            Ok(config) => config.client,
            Err(e) => {
                warn!("Ignoring settings in {:?}: {}", self.path, e);
                None
            }
        }
    }
}
