//! Bluetooth <-> TCP bridging.
//!
//! This module provides the loopback listener the local client attaches to
//! and the session that relays bytes between it and the RFCOMM channel.

pub mod listener;
pub mod session;
