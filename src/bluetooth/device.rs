//! Remote device handling.
//!
//! The bridge needs exactly one thing from the device layer: dropping the
//! Bluetooth link to a peer once its session is over.

use std::{future::Future, str::FromStr};

use bluer::{Address, Session};
use log::{debug, error, info};

use crate::error::{BridgeError, Result};

/// Disconnects remote devices.
pub trait DeviceLink: Send + Sync + 'static {
   /// Drops the link to `address` (`AA:BB:CC:DD:EE:FF`). Returns `false` on
   /// failure; an already disconnected device counts as success.
   fn disconnect(&self, address: &str) -> impl Future<Output = bool> + Send;
}

/// [`DeviceLink`] backed by the default BlueZ adapter.
pub struct BluerDeviceLink {
   session: Session,
}

impl BluerDeviceLink {
   pub async fn new() -> Result<Self> {
      Ok(Self {
         session: Session::new().await?,
      })
   }

   async fn try_disconnect(&self, address: &str) -> Result<()> {
      let addr = Address::from_str(address)
         .map_err(|e| BridgeError::ControlPlane(format!("bad address {address}: {e}")))?;

      let adapter = self.session.default_adapter().await?;
      let device = adapter.device(addr)?;
      if device.is_connected().await? {
         device.disconnect().await?;
         info!("Disconnected {addr}");
      } else {
         debug!("{addr} already disconnected");
      }
      Ok(())
   }
}

impl DeviceLink for BluerDeviceLink {
   async fn disconnect(&self, address: &str) -> bool {
      match self.try_disconnect(address).await {
         Ok(()) => true,
         Err(e) => {
            error!("Failed to disconnect {address}: {e}");
            false
         },
      }
   }
}

#[cfg(test)]
pub(crate) mod tests {
   use std::sync::Arc;

   use parking_lot::Mutex;

   use super::*;

   /// Remembers every address it was asked to disconnect.
   #[derive(Clone, Default)]
   pub(crate) struct RecordingLink {
      calls: Arc<Mutex<Vec<String>>>,
   }

   impl RecordingLink {
      pub fn calls(&self) -> Vec<String> {
         self.calls.lock().clone()
      }
   }

   impl DeviceLink for RecordingLink {
      async fn disconnect(&self, address: &str) -> bool {
         self.calls.lock().push(address.to_string());
         true
      }
   }
}
