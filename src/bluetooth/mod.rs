//! Bluetooth control plane layer.
//!
//! This module provides SPP profile registration with BlueZ and the
//! device-level operations the bridge needs at session teardown.

pub mod bluez;
pub mod device;
pub mod profile;
