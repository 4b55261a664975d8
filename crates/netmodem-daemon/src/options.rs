//! Daemon runtime options
//!
//! Read from an optional JSON file, then overridden by `NETMODEM_*`
//! environment variables. Missing fields fall back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use netmodem_core::protocol::DEFAULT_BAUD_RATE;
use netmodem_core::modem::DEFAULT_HELP_URL;

/// Serial device override
pub const ENV_PORT: &str = "NETMODEM_PORT";
/// Baud override
pub const ENV_BAUD: &str = "NETMODEM_BAUD";
/// Options file location
pub const ENV_CONFIG: &str = "NETMODEM_CONFIG";
/// Data directory override
pub const ENV_DATA_DIR: &str = "NETMODEM_DATA_DIR";

/// Default data directory (cross-platform)
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("NetModem")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonOptions {
    /// Serial device the terminal is attached to
    pub port: String,
    /// Line speed used to open the device before the saved configuration
    /// is loaded
    pub baud: u32,
    /// Where configuration records and the phonebook live
    pub data_dir: PathBuf,
    pub help_url: String,
    /// Loop period
    pub tick_ms: u64,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            port: if cfg!(windows) { "COM1" } else { "/dev/ttyUSB0" }.to_string(),
            baud: DEFAULT_BAUD_RATE,
            data_dir: default_data_dir(),
            help_url: DEFAULT_HELP_URL.to_string(),
            tick_ms: 1,
        }
    }
}

impl DaemonOptions {
    /// Options file named by `NETMODEM_CONFIG`, or `options.json` in the
    /// default data directory
    pub fn default_path(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir().join("options.json"))
    }

    /// Read `path` if it exists; a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply environment overrides through `env`
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = env(ENV_PORT) {
            self.port = port;
        }
        if let Some(baud) = env(ENV_BAUD) {
            self.baud = baud
                .trim()
                .parse()
                .with_context(|| format!("{} is not a baud rate: {}", ENV_BAUD, baud))?;
        }
        if let Some(dir) = env(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Defaults, then the options file, then the process environment
    pub fn from_environment() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let mut options = Self::load(&Self::default_path(env))?;
        options.apply_env(env)?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let options = DaemonOptions::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(options, DaemonOptions::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{ "port": "/dev/ttyS1", "baud": 9600 }"#).unwrap();
        let options = DaemonOptions::load(&path).unwrap();
        assert_eq!(options.port, "/dev/ttyS1");
        assert_eq!(options.baud, 9600);
        assert_eq!(options.tick_ms, 1);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(DaemonOptions::load(&path).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [(ENV_PORT, "/dev/ttyACM0"), (ENV_BAUD, "2400"), (ENV_DATA_DIR, "/tmp/nm")]
            .into_iter()
            .collect();
        let mut options = DaemonOptions::default();
        options.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(options.port, "/dev/ttyACM0");
        assert_eq!(options.baud, 2400);
        assert_eq!(options.data_dir, PathBuf::from("/tmp/nm"));

        let mut options = DaemonOptions::default();
        assert!(options.apply_env(|k| (k == ENV_BAUD).then(|| "fast".to_string())).is_err());
    }
}
