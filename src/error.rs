//! Error types for the SPP bridge.
//!
//! This module defines every failure the bridge can run into, from the
//! control plane (BlueZ over D-Bus) down to the TCP and RFCOMM sockets.

use thiserror::Error;

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Control plane rejected request: {0}")]
   ControlPlane(String),

   #[error("Failed to bind TCP listener on port {port}: {source}")]
   Bind {
      port: u16,
      #[source]
      source: std::io::Error,
   },

   #[error("Invalid device path: {0}")]
   InvalidDevicePath(String),

   #[error("Invalid configuration: {0}")]
   InvalidConfig(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Server failed to start")]
   StartupFailed,
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
