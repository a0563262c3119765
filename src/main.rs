//! Bluetooth SPP to TCP bridge.
//!
//! Registers a Serial Port Profile with BlueZ and, whenever a paired peer
//! opens the channel, exposes it to a local client on a loopback TCP port.

use log::{error, info};
use tokio::signal;

use bluetooth::{bluez::BluezControlPlane, device::BluerDeviceLink};
use server::ServerLifecycle;

mod bluetooth;
mod bridge;
mod config;
mod error;
mod event;
mod server;

use crate::error::{BridgeError, Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting SPP bridge...");

   let config = config::Config::load()?;
   config.validate()?;
   info!(
      "Loaded configuration: channel {}, TCP port {}{}",
      config.rfcomm_channel,
      config.tcp_port,
      if config.bidirectional { ", bidirectional" } else { "" }
   );

   let control = BluezControlPlane::connect().await?;
   let link = BluerDeviceLink::new().await?;
   let mut server = ServerLifecycle::new(config, control, link)?;

   if !server.run().await {
      error!("Could not register SPP profile, giving up (server {})", server.state());
      return Err(BridgeError::StartupFailed);
   }
   info!("Server {}, waiting for Bluetooth connections", server.state());

   signal::ctrl_c().await?;
   info!("Shutting down SPP bridge...");
   server.quit().await;
   info!("Server {}", server.state());

   Ok(())
}
