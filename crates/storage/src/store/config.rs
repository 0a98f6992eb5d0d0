#![forbid(unsafe_code)]

use super::StoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use ww_core::ClockConfig;

const DEFAULT_DB_FILE_NAME: &str = "wordwiki.db";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_ROOT_TAG: &str = "dct";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub storage_dir: PathBuf,
    pub db_file_name: String,
    pub busy_timeout_ms: u64,
    /// Value of the `ty0` column on every row.
    pub root_tag: String,
    pub clock: ClockConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("."),
            db_file_name: DEFAULT_DB_FILE_NAME.to_string(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            root_tag: DEFAULT_ROOT_TAG.to_string(),
            clock: ClockConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, StoreError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(&self.db_file_name)
    }
}
