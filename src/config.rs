//! Configuration management for the bridge.
//!
//! This module handles loading and saving the configuration from disk:
//! the SPP profile that gets registered with BlueZ and the loopback TCP
//! endpoint the Bluetooth peer is bridged to.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   bridge::listener::DEFAULT_BACKLOG,
   error::{BridgeError, Result},
};

/// Highest RFCOMM channel a profile may request.
pub const MAX_RFCOMM_CHANNEL: u8 = 30;

/// Main configuration structure for the bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   /// Loopback port the TCP client connects to.
   #[serde(default = "default_tcp_port")]
   pub tcp_port: u16,

   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   #[serde(default = "default_profile_name")]
   pub profile_name: String,

   /// D-Bus object path the `org.bluez.Profile1` object is exported at.
   #[serde(default = "default_profile_path")]
   pub profile_path: String,

   #[serde(default)]
   pub auto_connect: bool,

   #[serde(default = "default_listen_backlog")]
   pub listen_backlog: u32,

   /// Largest chunk read from either side in one go.
   #[serde(default = "default_buffer_size")]
   pub buffer_size: usize,

   /// Also forward Bluetooth -> TCP. Off by default: the bridge only feeds
   /// the Bluetooth peer.
   #[serde(default)]
   pub bidirectional: bool,

   /// Give up waiting for the TCP client after this many seconds.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub accept_timeout_sec: Option<u64>,
}

const fn default_tcp_port() -> u16 {
   8043
}

const fn default_rfcomm_channel() -> u8 {
   1
}

fn default_profile_name() -> String {
   "Reach SPP".to_string()
}

fn default_profile_path() -> String {
   "/org/bluez/sppbridge".to_string()
}

const fn default_listen_backlog() -> u32 {
   DEFAULT_BACKLOG
}

const fn default_buffer_size() -> usize {
   1024
}

impl Default for Config {
   fn default() -> Self {
      Self {
         tcp_port: default_tcp_port(),
         rfcomm_channel: default_rfcomm_channel(),
         profile_name: default_profile_name(),
         profile_path: default_profile_path(),
         auto_connect: false,
         listen_backlog: default_listen_backlog(),
         buffer_size: default_buffer_size(),
         bidirectional: false,
         accept_timeout_sec: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("SPPBRIDGE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(BridgeError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("sppbridge").join("config.toml"))
   }

   /// Rejects values BlueZ or the socket layer would refuse later on.
   pub fn validate(&self) -> Result<()> {
      if self.rfcomm_channel > MAX_RFCOMM_CHANNEL {
         return Err(BridgeError::InvalidConfig(format!(
            "rfcomm_channel {} out of range 0-{MAX_RFCOMM_CHANNEL}",
            self.rfcomm_channel
         )));
      }
      if self.buffer_size == 0 {
         return Err(BridgeError::InvalidConfig("buffer_size must be non-zero".into()));
      }
      if self.listen_backlog == 0 {
         return Err(BridgeError::InvalidConfig("listen_backlog must be non-zero".into()));
      }
      Ok(())
   }

   pub fn accept_timeout(&self) -> Option<Duration> {
      self.accept_timeout_sec.map(Duration::from_secs)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_defaults_match_reach_profile() {
      let config = Config::default();
      assert_eq!(config.tcp_port, 8043);
      assert_eq!(config.rfcomm_channel, 1);
      assert_eq!(config.profile_name, "Reach SPP");
      assert!(!config.auto_connect);
      assert!(!config.bidirectional);
      assert_eq!(config.accept_timeout(), None);
      assert!(config.validate().is_ok());
   }

   #[test]
   fn test_partial_toml_fills_defaults() {
      let config: Config = toml::from_str("tcp_port = 9000\nbidirectional = true\n").unwrap();
      assert_eq!(config.tcp_port, 9000);
      assert!(config.bidirectional);
      assert_eq!(config.rfcomm_channel, 1);
      assert_eq!(config.buffer_size, 1024);
   }

   #[test]
   fn test_validate_rejects_out_of_range_channel() {
      let config = Config {
         rfcomm_channel: 31,
         ..Config::default()
      };
      assert!(matches!(config.validate(), Err(BridgeError::InvalidConfig(_))));

      let config = Config {
         rfcomm_channel: 30,
         ..Config::default()
      };
      assert!(config.validate().is_ok());
   }

   #[test]
   fn test_validate_rejects_zero_buffer() {
      let config = Config {
         buffer_size: 0,
         ..Config::default()
      };
      assert!(config.validate().is_err());
   }

   #[test]
   fn test_load_creates_default_then_reads_back() -> Result<()> {
      let temp_dir = TempDir::new().unwrap();
      unsafe {
         env::set_var("SPPBRIDGE_HOME", temp_dir.path());
      }

      let created = Config::load()?;
      assert_eq!(created, Config::default());
      assert!(temp_dir.path().join("sppbridge").join("config.toml").exists());

      let edited = Config {
         tcp_port: 8100,
         accept_timeout_sec: Some(30),
         ..Config::default()
      };
      edited.save()?;
      let loaded = Config::load()?;
      assert_eq!(loaded, edited);
      assert_eq!(loaded.accept_timeout(), Some(Duration::from_secs(30)));

      Ok(())
   }
}
