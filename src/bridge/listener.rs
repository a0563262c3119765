//! Loopback TCP listener for a single local client.

use std::net::{Ipv4Addr, SocketAddr};

use log::{debug, warn};
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   net::{TcpListener, TcpSocket, TcpStream},
};

use crate::error::{BridgeError, Result};

pub const DEFAULT_BACKLOG: u32 = 5;

/// Listens on `127.0.0.1:<port>` and tracks at most one accepted client.
#[derive(Debug)]
pub struct ConnectionListener {
   buffer_size: usize,
   listener: Option<TcpListener>,
   client: Option<TcpStream>,
}

impl ConnectionListener {
   pub const fn new(buffer_size: usize) -> Self {
      Self {
         buffer_size,
         listener: None,
         client: None,
      }
   }

   /// Binds the listening socket, reporting failure as `false`.
   #[cfg_attr(not(test), allow(dead_code))]
   pub fn initialize(&mut self, port: u16, backlog: u32) -> bool {
      match self.bind(port, backlog) {
         Ok(()) => true,
         Err(e) => {
            warn!("{e}");
            false
         },
      }
   }

   /// Binds the listening socket with `SO_REUSEADDR` so a fresh session can
   /// take the port over right after the previous one released it.
   pub fn bind(&mut self, port: u16, backlog: u32) -> Result<()> {
      let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
      let bind = || -> std::io::Result<TcpListener> {
         let socket = TcpSocket::new_v4()?;
         socket.set_reuseaddr(true)?;
         socket.bind(addr)?;
         socket.listen(backlog)
      };
      let listener = bind().map_err(|source| BridgeError::Bind { port, source })?;
      debug!("Listening on {}", listener.local_addr()?);
      self.listener = Some(listener);
      Ok(())
   }

   #[cfg_attr(not(test), allow(dead_code))]
   pub fn local_addr(&self) -> Option<SocketAddr> {
      self.listener.as_ref()?.local_addr().ok()
   }

   /// Waits for a TCP client and returns its address.
   pub async fn accept_connection(&mut self) -> Result<SocketAddr> {
      let listener = self.listener.as_ref().ok_or_else(not_listening)?;
      let (stream, peer) = listener.accept().await?;
      self.client = Some(stream);
      Ok(peer)
   }

   /// Reads up to the buffer size; an empty result means the client closed.
   pub async fn read(&mut self) -> Result<Vec<u8>> {
      let client = self.client.as_mut().ok_or_else(not_connected)?;
      let mut buf = vec![0u8; self.buffer_size];
      let n = client.read(&mut buf).await?;
      buf.truncate(n);
      Ok(buf)
   }

   pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
      let client = self.client.as_mut().ok_or_else(not_connected)?;
      client.write_all(data).await?;
      Ok(data.len())
   }

   /// Closes the client and the listening socket. Repeated calls do nothing.
   pub fn kill_connection(&mut self) {
      if self.client.take().is_some() {
         debug!("Closed TCP client");
      }
      if self.listener.take().is_some() {
         debug!("Closed TCP listener");
      }
   }

   #[cfg_attr(not(test), allow(dead_code))]
   pub const fn is_listening(&self) -> bool {
      self.listener.is_some()
   }
}

fn not_listening() -> BridgeError {
   BridgeError::Io(std::io::Error::new(
      std::io::ErrorKind::NotConnected,
      "listener not initialized",
   ))
}

fn not_connected() -> BridgeError {
   BridgeError::Io(std::io::Error::new(
      std::io::ErrorKind::NotConnected,
      "no TCP client accepted",
   ))
}

#[cfg(test)]
mod tests {
   use super::*;

   async fn bound() -> (ConnectionListener, SocketAddr) {
      let mut listener = ConnectionListener::new(16);
      assert!(listener.initialize(0, DEFAULT_BACKLOG));
      let addr = listener.local_addr().unwrap();
      (listener, addr)
   }

   #[tokio::test]
   async fn test_binds_loopback_only() {
      let (listener, addr) = bound().await;
      assert!(addr.ip().is_loopback());
      assert_ne!(addr.port(), 0);
      assert!(listener.is_listening());
   }

   #[tokio::test]
   async fn test_initialize_fails_when_port_taken() {
      let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      let port = taken.local_addr().unwrap().port();

      let mut listener = ConnectionListener::new(16);
      assert!(!listener.initialize(port, DEFAULT_BACKLOG));
      assert!(matches!(
         listener.bind(port, DEFAULT_BACKLOG),
         Err(BridgeError::Bind { port: p, .. }) if p == port
      ));
   }

   #[tokio::test]
   async fn test_read_write_and_orderly_close() {
      let (mut listener, addr) = bound().await;

      let client = tokio::spawn(async move {
         let mut stream = TcpStream::connect(addr).await.unwrap();
         stream.write_all(b"ping").await.unwrap();
         let mut reply = [0u8; 4];
         stream.read_exact(&mut reply).await.unwrap();
         assert_eq!(&reply, b"pong");
      });

      let peer = listener.accept_connection().await.unwrap();
      assert!(peer.ip().is_loopback());

      let mut received = Vec::new();
      while received.len() < 4 {
         received.extend(listener.read().await.unwrap());
      }
      assert_eq!(received, b"ping");
      assert_eq!(listener.write(b"pong").await.unwrap(), 4);

      client.await.unwrap();
      assert!(listener.read().await.unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_read_caps_at_buffer_size() {
      let (mut listener, addr) = bound().await;
      let client = tokio::spawn(async move {
         let mut stream = TcpStream::connect(addr).await.unwrap();
         stream.write_all(&[7u8; 40]).await.unwrap();
      });
      listener.accept_connection().await.unwrap();
      client.await.unwrap();

      let mut total = 0;
      loop {
         let chunk = listener.read().await.unwrap();
         if chunk.is_empty() {
            break;
         }
         assert!(chunk.len() <= 16);
         total += chunk.len();
      }
      assert_eq!(total, 40);
   }

   #[tokio::test]
   async fn test_io_before_accept_is_an_error() {
      let (mut listener, _) = bound().await;
      assert!(listener.read().await.is_err());
      assert!(listener.write(b"x").await.is_err());
   }

   #[tokio::test]
   async fn test_kill_releases_port_for_next_session() {
      let (mut listener, addr) = bound().await;
      let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
      listener.accept_connection().await.unwrap();
      let _client = client.await.unwrap();

      listener.kill_connection();
      listener.kill_connection();
      assert!(!listener.is_listening());

      let mut next = ConnectionListener::new(16);
      assert!(next.initialize(addr.port(), DEFAULT_BACKLOG));
   }
}
