//! Configuration loading and persistence (spec §6's config key table).
//!
//! Grounded on the teacher's `config.rs`: a serde `Config` struct with a
//! `Default` impl, JSON load/save under a platform config directory, and
//! environment-variable overrides layered on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_FRAG_TIMEOUT_MS, DEFAULT_INTERMSG_TIMEOUT_MS,
    DEFAULT_INTERSYMBOL_TIMEOUT_MS, DEFAULT_RETRY_MAX, DEFAULT_SRSP_TIMEOUT_MS,
    DEFAULT_TX_FRAG_SIZE, DEFAULT_TX_LOCK_TIMEOUT_MS,
};
use crate::iface::InterfaceConfig;

const APP_NAME: &str = "mt-npi-bridge";

/// Every key in spec §6's config table, plus the TCP bind surface and the
/// UART device identity this crate needs to actually open the link.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// `frame-sync`: whether frames are preceded by a sync byte.
    pub frame_sync: bool,
    /// `include-chksum`: whether frames carry a trailing XOR checksum.
    pub include_chksum: bool,
    /// `startup-flush`: drain stale bytes when an interface opens.
    pub startup_flush: bool,
    /// `len-2bytes`: two-byte little-endian length field instead of one.
    pub len_2bytes: bool,
    /// `fragmentation-size`: max payload bytes per non-final fragment block.
    pub fragmentation_size: usize,
    /// `retry-max`: fragment block retry budget before aborting.
    pub retry_max: u32,
    pub fragmentation_timeout_msecs: u64,
    pub intersymbol_timeout_msecs: u64,
    pub srsp_timeout_msecs: u64,
    pub intermsg_timeout_msecs: u64,
    pub flush_timeout_msecs: u64,
    pub tx_lock_timeout_msecs: u64,

    /// TCP address the NPI server binds for client connections.
    pub bind_addr: String,

    /// UART device path (e.g. `/dev/ttyACM0`), used only with the `serial`
    /// feature.
    pub uart_device: String,
    pub uart_baud_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_sync: true,
            include_chksum: true,
            startup_flush: true,
            len_2bytes: false,
            fragmentation_size: DEFAULT_TX_FRAG_SIZE,
            retry_max: DEFAULT_RETRY_MAX,
            fragmentation_timeout_msecs: DEFAULT_FRAG_TIMEOUT_MS,
            intersymbol_timeout_msecs: DEFAULT_INTERSYMBOL_TIMEOUT_MS,
            srsp_timeout_msecs: DEFAULT_SRSP_TIMEOUT_MS,
            intermsg_timeout_msecs: DEFAULT_INTERMSG_TIMEOUT_MS,
            flush_timeout_msecs: DEFAULT_FLUSH_TIMEOUT_MS,
            tx_lock_timeout_msecs: DEFAULT_TX_LOCK_TIMEOUT_MS,
            bind_addr: "0.0.0.0:2000".to_string(),
            uart_device: "/dev/ttyACM0".to_string(),
            uart_baud_rate: 115_200,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(over) = std::env::var("MT_NPI_BRIDGE_CONFIG_DIR") {
            PathBuf::from(over)
        } else {
            dirs::config_dir()
                .context("could not determine platform config directory")?
                .join(APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration from file (falling back to defaults), then apply
    /// environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind_addr) = std::env::var("MT_NPI_BRIDGE_BIND_ADDR") {
            self.bind_addr = bind_addr;
        }
        if let Ok(device) = std::env::var("MT_NPI_BRIDGE_UART_DEVICE") {
            self.uart_device = device;
        }
        if let Ok(baud) = std::env::var("MT_NPI_BRIDGE_UART_BAUD") {
            if let Ok(baud) = baud.parse::<u32>() {
                self.uart_baud_rate = baud;
            }
        }
        if let Ok(size) = std::env::var("MT_NPI_BRIDGE_FRAGMENTATION_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                self.fragmentation_size = size;
            }
        }
        if let Ok(retry) = std::env::var("MT_NPI_BRIDGE_RETRY_MAX") {
            if let Ok(retry) = retry.parse::<u32>() {
                self.retry_max = retry;
            }
        }
    }

    /// Persist the current configuration to disk with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Build the UART-side `InterfaceConfig` from this configuration.
    pub fn uart_iface_config(&self) -> InterfaceConfig {
        InterfaceConfig {
            dbg_name: "uart".to_string(),
            is_npi: false,
            frame_sync: self.frame_sync,
            include_chksum: self.include_chksum,
            len_2bytes: self.len_2bytes,
            tx_frag_size: self.fragmentation_size,
            retry_max: self.retry_max,
            frag_timeout: Duration::from_millis(self.fragmentation_timeout_msecs),
            srsp_timeout: Duration::from_millis(self.srsp_timeout_msecs),
            intermsg_timeout: Duration::from_millis(self.intermsg_timeout_msecs),
            intersymbol_timeout: Duration::from_millis(self.intersymbol_timeout_msecs),
            flush_timeout: Duration::from_millis(self.flush_timeout_msecs),
            tx_lock_timeout: Duration::from_millis(self.tx_lock_timeout_msecs),
            stack_id: 0,
            startup_flush: self.startup_flush,
        }
    }

    /// Build the per-client socket-side `InterfaceConfig` template. The
    /// acceptor fills in `dbg_name` per connection.
    pub fn socket_iface_config(&self) -> InterfaceConfig {
        InterfaceConfig {
            is_npi: true,
            startup_flush: false,
            ..self.uart_iface_config()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_wire_defaults() {
        let config = Config::default();
        assert!(config.frame_sync);
        assert!(config.include_chksum);
        assert_eq!(config.fragmentation_size, DEFAULT_TX_FRAG_SIZE);
        assert_eq!(config.retry_max, DEFAULT_RETRY_MAX);
    }

    #[test]
    fn uart_iface_config_carries_timeouts() {
        let config = Config::default();
        let iface_cfg = config.uart_iface_config();
        assert_eq!(
            iface_cfg.srsp_timeout,
            Duration::from_millis(config.srsp_timeout_msecs)
        );
        assert!(iface_cfg.startup_flush);
    }

    #[test]
    fn socket_iface_config_disables_startup_flush() {
        let config = Config::default();
        let iface_cfg = config.socket_iface_config();
        assert!(iface_cfg.is_npi);
        assert!(!iface_cfg.startup_flush);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.bind_addr, config.bind_addr);
        assert_eq!(loaded.fragmentation_size, config.fragmentation_size);
    }

    #[test]
    fn save_then_load_round_trips_through_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MT_NPI_BRIDGE_CONFIG_DIR", dir.path());

        let mut config = Config::default();
        config.bind_addr = "127.0.0.1:9999".to_string();
        config.save().unwrap();

        let loaded = Config::load().unwrap();
        assert_eq!(loaded.bind_addr, "127.0.0.1:9999");

        std::env::remove_var("MT_NPI_BRIDGE_CONFIG_DIR");
    }
}
