use crate::diff::MirrorKind;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_UPDATE_TIMEOUT_MS: u64 = 90 * 60 * 1_000;

/// Stores the core configuration for this indexer instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub module_address: String,
    pub rpc_url: String,
    pub db_path: PathBuf,
    pub update_interval_ms: u64,
    pub update_timeout_ms: u64,
    pub registry_enabled: bool,
    pub mirror: MirrorKind,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            module_address: String::new(),
            rpc_url: String::new(),
            db_path: PathBuf::from("registry.sqlite"),
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            update_timeout_ms: DEFAULT_UPDATE_TIMEOUT_MS,
            registry_enabled: true,
            mirror: MirrorKind::Key,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let file = File::options()
            .read(true)
            .open(path)
            .map_err(|e| format!("failed to open file {:?}", e))?;
        serde_yaml::from_reader(file).map_err(|e| format!("failed to deserialize file {:?}", e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.update_interval_ms == 0 {
            return Err("update_interval_ms must be greater than zero".to_string());
        }
        if self.update_timeout_ms == 0 {
            return Err("update_timeout_ms must be greater than zero".to_string());
        }
        self.module_address()?;
        self.rpc_url
            .parse::<reqwest::Url>()
            .map_err(|e| format!("invalid rpc url: {}", e))?;
        Ok(())
    }

    pub fn module_address(&self) -> Result<Address, String> {
        self.module_address
            .parse::<Address>()
            .map_err(|e| format!("invalid module address: {}", e))
    }
}
