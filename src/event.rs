//! Connection events handed from the control plane to the bridge.
//!
//! BlueZ calls `NewConnection` on our profile object whenever a peer opens
//! the SPP channel. The control plane turns that call into a
//! [`ConnectionEvent`] and passes it to whatever [`ConnectionSink`] was
//! registered with the profile.

use std::{collections::HashMap, fmt, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream. Closing is dropping.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// An inbound Bluetooth connection.
pub struct ConnectionEvent {
   /// Object path of the remote device, e.g. `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
   pub device_path: String,
   pub stream: BoxedStream,
   /// Connection properties, rendered for logging only.
   pub properties: HashMap<String, String>,
}

impl fmt::Debug for ConnectionEvent {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionEvent")
         .field("device_path", &self.device_path)
         .field("properties", &self.properties)
         .finish_non_exhaustive()
   }
}

/// Receiver of inbound connections.
pub trait ConnectionSink: Send + Sync {
   /// Takes ownership of a freshly accepted connection. Must not block.
   fn on_new_connection(&self, event: ConnectionEvent);
}

/// Type alias for a thread-safe connection handler.
pub type ConnectionHandler = Arc<dyn ConnectionSink>;
