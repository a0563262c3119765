//! BlueZ implementation of the control plane.
//!
//! Exports an `org.bluez.Profile1` object on the system bus and registers
//! it through `org.bluez.ProfileManager1`. BlueZ then hands every inbound
//! RFCOMM connection to `NewConnection` as a file descriptor, which is
//! adopted as a non-blocking socket and forwarded to the bridge.

use std::{collections::HashMap, os::fd::OwnedFd, process::Stdio};

use bluer::Session;
use log::{debug, info, warn};
use tokio::{net::UnixStream, process::Command};
use zbus::{
   Connection, interface, proxy,
   zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   bluetooth::profile::{ControlPlane, ProfileDescriptor},
   error::{BridgeError, Result},
   event::{ConnectionEvent, ConnectionHandler},
};

#[proxy(
   interface = "org.bluez.ProfileManager1",
   default_service = "org.bluez",
   default_path = "/org/bluez"
)]
trait ProfileManager1 {
   fn register_profile(
      &self,
      profile: &ObjectPath<'_>,
      uuid: &str,
      options: HashMap<&str, Value<'_>>,
   ) -> zbus::Result<()>;

   fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// The object BlueZ calls back into.
struct SppProfile {
   handler: ConnectionHandler,
}

#[interface(name = "org.bluez.Profile1")]
impl SppProfile {
   async fn new_connection(
      &self,
      device: OwnedObjectPath,
      fd: zvariant::OwnedFd,
      properties: HashMap<String, OwnedValue>,
   ) -> zbus::fdo::Result<()> {
      let stream = adopt_socket(fd.into()).map_err(|e| {
         warn!("Could not adopt RFCOMM socket for {}: {e}", device.as_str());
         zbus::fdo::Error::Failed(e.to_string())
      })?;

      let properties = properties
         .into_iter()
         .map(|(key, value)| (key, format!("{value:?}")))
         .collect();

      debug!("NewConnection from {}", device.as_str());
      self.handler.on_new_connection(ConnectionEvent {
         device_path: device.as_str().to_string(),
         stream: Box::new(stream),
         properties,
      });
      Ok(())
   }

   fn request_disconnection(&self, device: OwnedObjectPath) {
      info!("BlueZ requested disconnection of {}", device.as_str());
   }

   fn release(&self) {
      info!("Profile released by BlueZ");
   }
}

/// Wraps the descriptor BlueZ passed us as an async stream.
fn adopt_socket(fd: OwnedFd) -> std::io::Result<UnixStream> {
   let socket = std::os::unix::net::UnixStream::from(fd);
   socket.set_nonblocking(true)?;
   UnixStream::from_std(socket)
}

/// Control plane backed by the BlueZ daemon on the system bus.
pub struct BluezControlPlane {
   connection: Connection,
   session: Session,
}

impl BluezControlPlane {
   pub async fn connect() -> Result<Self> {
      let connection = Connection::system().await?;
      let session = Session::new().await?;
      Ok(Self {
         connection,
         session,
      })
   }

   async fn rfkill_unblock() -> Result<()> {
      let status = Command::new("rfkill")
         .args(["unblock", "bluetooth"])
         .stdin(Stdio::null())
         .stdout(Stdio::null())
         .status()
         .await?;
      if !status.success() {
         return Err(BridgeError::ControlPlane(format!("rfkill exited with {status}")));
      }
      Ok(())
   }
}

impl ControlPlane for BluezControlPlane {
   async fn unblock_radio(&self) -> Result<()> {
      if let Err(e) = Self::rfkill_unblock().await {
         warn!("rfkill unblock failed: {e}");
      }

      let adapter = self.session.default_adapter().await?;
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      Ok(())
   }

   async fn register_profile(
      &self,
      profile: &ProfileDescriptor,
      handler: ConnectionHandler,
   ) -> Result<()> {
      let path = ObjectPath::try_from(profile.service_path()).map_err(zbus::Error::from)?;

      let added = self
         .connection
         .object_server()
         .at(path.clone(), SppProfile { handler })
         .await?;
      if !added {
         return Err(BridgeError::ControlPlane(format!(
            "an object is already exported at {path}"
         )));
      }

      let mut options: HashMap<&str, Value<'_>> = HashMap::new();
      options.insert("Name", Value::from(profile.name()));
      options.insert("Channel", Value::U16(u16::from(profile.channel())));
      options.insert("AutoConnect", Value::Bool(profile.auto_connect()));

      let manager = ProfileManager1Proxy::new(&self.connection).await?;
      if let Err(e) = manager
         .register_profile(&path, profile.service_class(), options)
         .await
      {
         let _ = self
            .connection
            .object_server()
            .remove::<SppProfile, _>(path.clone())
            .await;
         return Err(e.into());
      }
      Ok(())
   }

   async fn unregister_profile(&self, service_path: &str) -> Result<()> {
      let path = ObjectPath::try_from(service_path).map_err(zbus::Error::from)?;

      let manager = ProfileManager1Proxy::new(&self.connection).await?;
      let unregistered = manager.unregister_profile(&path).await;

      if let Err(e) = self
         .connection
         .object_server()
         .remove::<SppProfile, _>(path.clone())
         .await
      {
         debug!("Profile object at {path} was not exported: {e}");
      }

      Ok(unregistered?)
   }
}
