//! Application configuration
//!
//! Everything that was ambient state in earlier iterations of this tool (the
//! flashing tool binary, the registry and history file locations) is carried
//! explicitly by [`Config`], so tests and embedders can construct isolated
//! instances. A TOML file under the user's configuration directory provides
//! persistent overrides.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Configuration for the flashing tool invocation and provenance storage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Flashing tool binary to invoke
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Target chip family passed to the tool via `--chip`
    #[serde(default = "default_chip")]
    pub chip: String,
    /// Baud rate passed to the tool via `--baud`
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Flash destination address passed to `write_flash`
    #[serde(default = "default_flash_addr")]
    pub flash_addr: String,
    /// Per-device flash timeout in seconds; 0 disables the timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Device registry JSON document; defaults to the user data directory
    #[serde(default)]
    pub registry_file: Option<PathBuf>,
    /// Append-only flash history log; defaults to the user data directory
    #[serde(default)]
    pub history_log: Option<PathBuf>,
}

fn default_tool() -> String {
    "esptool.py".into()
}

fn default_chip() -> String {
    "esp32".into()
}

fn default_baud() -> u32 {
    921_600
}

fn default_flash_addr() -> String {
    "0x0".into()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            chip: default_chip(),
            baud: default_baud(),
            flash_addr: default_flash_addr(),
            timeout_secs: default_timeout_secs(),
            registry_file: None,
            history_log: None,
        }
    }
}

impl Config {
    /// Load the configuration from the default location, falling back to the
    /// built-in defaults when no file exists.
    pub fn load() -> Result<Self, Error> {
        Self::load_from(&Self::default_config_path())
    }

    /// Load the configuration from an explicit path. A missing file is not an
    /// error; a present but malformed file is.
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        match read_to_string(path) {
            Ok(data) => {
                debug!("Loading configuration from {}", path.display());
                toml::from_str(&data).map_err(|source| Error::InvalidConfig {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Resolved path of the device registry document
    pub fn registry_path(&self) -> PathBuf {
        self.registry_file
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("devices.json"))
    }

    /// Resolved path of the append-only flash history log
    pub fn history_log_path(&self) -> PathBuf {
        self.history_log
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("flash_log.txt"))
    }

    fn default_config_path() -> PathBuf {
        match ProjectDirs::from("rs", "esp", "espbatch") {
            Some(dirs) => dirs.config_dir().join("espbatch.toml"),
            None => PathBuf::from("espbatch.toml"),
        }
    }

    fn data_dir() -> PathBuf {
        match ProjectDirs::from("rs", "esp", "espbatch") {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            None => PathBuf::from("."),
        }
    }
}
