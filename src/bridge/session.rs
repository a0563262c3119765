//! A single Bluetooth <-> TCP bridge session.
//!
//! One session is started per `NewConnection` from BlueZ. It brings up the
//! loopback listener, waits for a local client and relays bytes until either
//! side goes away, then tears everything down and drops the Bluetooth link.

use std::net::SocketAddr;

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   io::{self, AsyncReadExt, AsyncWriteExt},
   select,
   sync::watch,
   time,
};

use crate::{
   bluetooth::device::DeviceLink,
   bridge::listener::ConnectionListener,
   config::Config,
   error::{BridgeError, Result},
   event::{BoxedStream, ConnectionEvent},
};

/// Length of `AA_BB_CC_DD_EE_FF` at the end of a BlueZ device path.
const ADDRESS_LEN: usize = 17;

/// How a session that got its listener up came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionEnd {
   /// The TCP client closed the connection.
   #[strum(serialize = "external connection shutdown")]
   ExternalShutdown,
   /// The Bluetooth side failed or hung up.
   #[strum(serialize = "aborted by bluetooth peer")]
   PeerAbort,
   /// Server shutdown or accept timeout.
   #[strum(serialize = "cancelled")]
   Cancelled,
}

/// Extracts `AA:BB:CC:DD:EE:FF` from `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
pub fn device_address(device_path: &str) -> Result<SmolStr> {
   let suffix = device_path
      .len()
      .checked_sub(ADDRESS_LEN)
      .and_then(|start| device_path.get(start..))
      .ok_or_else(|| BridgeError::InvalidDevicePath(device_path.to_string()))?;
   Ok(suffix.replace('_', ":").into())
}

/// Resolves once shutdown has been requested or the server is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
   let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct BridgeSession<'a, L> {
   config: &'a Config,
   link: &'a L,
   shutdown: watch::Receiver<bool>,
}

impl<'a, L: DeviceLink> BridgeSession<'a, L> {
   pub const fn new(config: &'a Config, link: &'a L, shutdown: watch::Receiver<bool>) -> Self {
      Self {
         config,
         link,
         shutdown,
      }
   }

   /// Runs the session to completion.
   ///
   /// Errors are returned only for failures before the bridge came up (bad
   /// device path, port in use); in that case the peer is left alone. Every
   /// other outcome closes both endpoints and disconnects the peer.
   pub async fn handle(&mut self, event: ConnectionEvent) -> Result<SessionEnd> {
      let ConnectionEvent {
         device_path,
         stream,
         properties,
      } = event;

      let address = device_address(&device_path)?;
      info!("Connected: {address}");
      for (key, value) in &properties {
         debug!("  {key} = {value}");
      }

      let mut tcp = ConnectionListener::new(self.config.buffer_size);
      tcp.bind(self.config.tcp_port, self.config.listen_backlog)?;

      let mut bt = stream;
      let end = self.bridge(&address, &mut tcp, &mut bt).await;

      tcp.kill_connection();
      drop(bt);

      match end {
         SessionEnd::ExternalShutdown | SessionEnd::Cancelled => {
            info!("Session with {address} ended: {end}");
         },
         SessionEnd::PeerAbort => warn!("Session with {address} ended: {end}"),
      }

      if !self.link.disconnect(&address).await {
         warn!("Could not disconnect {address}");
      }
      Ok(end)
   }

   async fn bridge(
      &mut self,
      address: &str,
      tcp: &mut ConnectionListener,
      bt: &mut BoxedStream,
   ) -> SessionEnd {
      info!("Waiting for TCP client on port {}...", self.config.tcp_port);
      match self.accept(tcp).await {
         Some(Ok(peer)) => info!("TCP client connected: {peer}"),
         Some(Err(e)) => {
            warn!("Failed to accept TCP client: {e}");
            return SessionEnd::ExternalShutdown;
         },
         None => return SessionEnd::Cancelled,
      }

      if self.config.bidirectional {
         self.relay_duplex(address, tcp, bt).await
      } else {
         self.relay(address, tcp, bt).await
      }
   }

   /// `None` when cancelled or timed out.
   async fn accept(&mut self, tcp: &mut ConnectionListener) -> Option<Result<SocketAddr>> {
      let limit = self.config.accept_timeout();
      let accept = async move {
         match limit {
            Some(limit) => {
               let accepted = time::timeout(limit, tcp.accept_connection()).await;
               if accepted.is_err() {
                  info!("No TCP client within {limit:?}");
               }
               accepted.ok()
            },
            None => Some(tcp.accept_connection().await),
         }
      };

      select! {
         accepted = accept => accepted,
         () = cancelled(&mut self.shutdown) => None,
      }
   }

   /// TCP -> Bluetooth only.
   async fn relay(
      &mut self,
      address: &str,
      tcp: &mut ConnectionListener,
      bt: &mut BoxedStream,
   ) -> SessionEnd {
      loop {
         let data = select! {
            data = tcp.read() => data,
            () = cancelled(&mut self.shutdown) => return SessionEnd::Cancelled,
         };
         let data = match data {
            Ok(data) if data.is_empty() => return SessionEnd::ExternalShutdown,
            Ok(data) => data,
            Err(e) => {
               warn!("TCP read failed: {e}");
               return SessionEnd::ExternalShutdown;
            },
         };

         debug!("→ {address}: {}", hex::encode(&data));
         let written = select! {
            written = bt.write_all(&data) => written,
            () = cancelled(&mut self.shutdown) => return SessionEnd::Cancelled,
         };
         if let Err(e) = written {
            warn!("Failed to send data: {e}");
            return SessionEnd::PeerAbort;
         }
      }
   }

   /// TCP <-> Bluetooth. Writes stay cancellable so a peer that stops
   /// draining cannot hold off shutdown.
   async fn relay_duplex(
      &mut self,
      address: &str,
      tcp: &mut ConnectionListener,
      bt: &mut BoxedStream,
   ) -> SessionEnd {
      let (mut bt_rx, mut bt_tx) = io::split(bt);
      let mut from_bt = vec![0u8; self.config.buffer_size];

      loop {
         select! {
            data = tcp.read() => match data {
               Ok(data) if data.is_empty() => return SessionEnd::ExternalShutdown,
               Ok(data) => {
                  debug!("→ {address}: {}", hex::encode(&data));
                  let written = select! {
                     written = bt_tx.write_all(&data) => written,
                     () = cancelled(&mut self.shutdown) => return SessionEnd::Cancelled,
                  };
                  if let Err(e) = written {
                     warn!("Failed to send data: {e}");
                     return SessionEnd::PeerAbort;
                  }
               },
               Err(e) => {
                  warn!("TCP read failed: {e}");
                  return SessionEnd::ExternalShutdown;
               },
            },
            read = bt_rx.read(&mut from_bt) => match read {
               Ok(0) => {
                  info!("Bluetooth peer {address} closed the channel");
                  return SessionEnd::PeerAbort;
               },
               Ok(n) => {
                  debug!("← {address}: {}", hex::encode(&from_bt[..n]));
                  let written = select! {
                     written = tcp.write(&from_bt[..n]) => written,
                     () = cancelled(&mut self.shutdown) => return SessionEnd::Cancelled,
                  };
                  if let Err(e) = written {
                     warn!("TCP write failed: {e}");
                     return SessionEnd::ExternalShutdown;
                  }
               },
               Err(e) => {
                  warn!("Bluetooth read failed: {e}");
                  return SessionEnd::PeerAbort;
               },
            },
            () = cancelled(&mut self.shutdown) => return SessionEnd::Cancelled,
         }
      }
   }
}
