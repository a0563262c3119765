//! SPP profile description and registration.
//!
//! [`ProfileRegistrar`] owns the [`ProfileDescriptor`] for the lifetime of
//! the server and talks to the host Bluetooth control plane through the
//! [`ControlPlane`] trait, so the bridge never depends on a specific D-Bus
//! binding.

use std::future::Future;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
   config::{Config, MAX_RFCOMM_CHANNEL},
   error::{BridgeError, Result},
   event::ConnectionHandler,
};

/// Serial Port Profile service class, in the short form BlueZ accepts.
pub const SPP_SERVICE_CLASS: &str = "1101";

/// Bluetooth base UUID, used to expand 16-bit service classes.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Everything BlueZ needs to know to publish the SPP record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDescriptor {
   service_path: String,
   service_class: &'static str,
   name: String,
   channel: u8,
   auto_connect: bool,
}

impl ProfileDescriptor {
   pub fn new(
      service_path: impl Into<String>,
      name: impl Into<String>,
      channel: u8,
      auto_connect: bool,
   ) -> Result<Self> {
      let service_path = service_path.into();
      if channel > MAX_RFCOMM_CHANNEL {
         return Err(BridgeError::InvalidConfig(format!(
            "RFCOMM channel {channel} out of range 0-{MAX_RFCOMM_CHANNEL}"
         )));
      }
      if !is_object_path(&service_path) {
         return Err(BridgeError::InvalidConfig(format!(
            "'{service_path}' is not a D-Bus object path"
         )));
      }
      Ok(Self {
         service_path,
         service_class: SPP_SERVICE_CLASS,
         name: name.into(),
         channel,
         auto_connect,
      })
   }

   pub fn from_config(config: &Config) -> Result<Self> {
      Self::new(
         config.profile_path.as_str(),
         config.profile_name.as_str(),
         config.rfcomm_channel,
         config.auto_connect,
      )
   }

   pub fn service_path(&self) -> &str {
      &self.service_path
   }

   pub const fn service_class(&self) -> &'static str {
      self.service_class
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub const fn channel(&self) -> u8 {
      self.channel
   }

   pub const fn auto_connect(&self) -> bool {
      self.auto_connect
   }

   /// Full 128-bit form of the service class.
   pub fn service_uuid(&self) -> Uuid {
      let short = u128::from_str_radix(self.service_class, 16).unwrap_or_default();
      Uuid::from_u128(BASE_UUID | (short << 96))
   }
}

fn is_object_path(path: &str) -> bool {
   if path == "/" {
      return true;
   }
   let Some(rest) = path.strip_prefix('/') else {
      return false;
   };
   rest.split('/').all(|element| {
      !element.is_empty()
         && element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
   })
}

/// Profile-manager capability of the host Bluetooth control plane.
pub trait ControlPlane: Send + Sync + 'static {
   /// Makes sure the radio is not soft-blocked and the adapter is powered.
   fn unblock_radio(&self) -> impl Future<Output = Result<()>> + Send;

   /// Publishes `profile` and routes its `NewConnection` calls to `handler`.
   fn register_profile(
      &self,
      profile: &ProfileDescriptor,
      handler: ConnectionHandler,
   ) -> impl Future<Output = Result<()>> + Send;

   fn unregister_profile(&self, service_path: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Registers and unregisters the SPP profile.
pub struct ProfileRegistrar<C> {
   control: C,
   profile: ProfileDescriptor,
}

impl<C: ControlPlane> ProfileRegistrar<C> {
   pub const fn new(control: C, profile: ProfileDescriptor) -> Self {
      Self { control, profile }
   }

   pub const fn profile(&self) -> &ProfileDescriptor {
      &self.profile
   }

   /// Registers the profile. Failures are logged and reported as `false`.
   pub async fn initialize(&self, handler: ConnectionHandler) -> bool {
      if let Err(e) = self.control.unblock_radio().await {
         warn!("Could not unblock Bluetooth radio: {e}");
      }

      match self.control.register_profile(&self.profile, handler).await {
         Ok(()) => {
            info!(
               "Registered SPP profile '{}' ({}) at {} on channel {}",
               self.profile.name,
               self.profile.service_uuid(),
               self.profile.service_path,
               self.profile.channel
            );
            true
         },
         Err(e) => {
            error!("Failed to register SPP profile: {e}");
            false
         },
      }
   }

   /// Best-effort unregistration; never fails.
   pub async fn deinitialize(&self) {
      match self
         .control
         .unregister_profile(&self.profile.service_path)
         .await
      {
         Ok(()) => info!("Unregistered SPP profile at {}", self.profile.service_path),
         Err(e) => debug!("Ignoring unregister failure: {e}"),
      }
   }
}

#[cfg(test)]
pub(crate) mod tests {
   use std::sync::Arc;

   use parking_lot::Mutex;

   use super::*;

   /// In-memory control plane recording what the registrar asked for.
   #[derive(Clone, Default)]
   pub(crate) struct FakeControlPlane {
      pub state: Arc<Mutex<FakeState>>,
   }

   #[derive(Default)]
   pub(crate) struct FakeState {
      pub reject_registration: bool,
      pub fail_unblock: bool,
      pub unblocked: usize,
      pub registered: Option<String>,
      pub unregistered: usize,
      pub handler: Option<ConnectionHandler>,
   }

   impl FakeControlPlane {
      pub fn rejecting() -> Self {
         let fake = Self::default();
         fake.state.lock().reject_registration = true;
         fake
      }

      pub fn handler(&self) -> Option<ConnectionHandler> {
         self.state.lock().handler.clone()
      }
   }

   impl ControlPlane for FakeControlPlane {
      async fn unblock_radio(&self) -> Result<()> {
         let mut state = self.state.lock();
         state.unblocked += 1;
         if state.fail_unblock {
            return Err(BridgeError::ControlPlane("rfkill missing".into()));
         }
         Ok(())
      }

      async fn register_profile(
         &self,
         profile: &ProfileDescriptor,
         handler: ConnectionHandler,
      ) -> Result<()> {
         let mut state = self.state.lock();
         if state.reject_registration || state.registered.is_some() {
            return Err(BridgeError::ControlPlane("org.bluez.Error.AlreadyExists".into()));
         }
         state.registered = Some(profile.service_path().to_string());
         state.handler = Some(handler);
         Ok(())
      }

      async fn unregister_profile(&self, service_path: &str) -> Result<()> {
         let mut state = self.state.lock();
         if state.registered.as_deref() != Some(service_path) {
            return Err(BridgeError::ControlPlane("org.bluez.Error.DoesNotExist".into()));
         }
         state.registered = None;
         state.handler = None;
         state.unregistered += 1;
         Ok(())
      }
   }

   struct NullSink;

   impl crate::event::ConnectionSink for NullSink {
      fn on_new_connection(&self, _event: crate::event::ConnectionEvent) {}
   }

   fn descriptor() -> ProfileDescriptor {
      ProfileDescriptor::new("/org/bluez/sppbridge", "Reach SPP", 1, false).unwrap()
   }

   #[test]
   fn test_descriptor_rejects_bad_channel_and_path() {
      assert!(ProfileDescriptor::new("/org/bluez/spp", "x", 31, false).is_err());
      assert!(ProfileDescriptor::new("org/bluez/spp", "x", 1, false).is_err());
      assert!(ProfileDescriptor::new("/org/bluez/", "x", 1, false).is_err());
      assert!(ProfileDescriptor::new("/org/bluez/my-profile", "x", 1, false).is_err());
      assert!(ProfileDescriptor::new("/org/bluez/spp_1", "x", 0, true).is_ok());
   }

   #[test]
   fn test_descriptor_expands_spp_uuid() {
      let profile = descriptor();
      assert_eq!(profile.service_class(), "1101");
      assert_eq!(
         profile.service_uuid().to_string(),
         "00001101-0000-1000-8000-00805f9b34fb"
      );
   }

   #[tokio::test]
   async fn test_initialize_registers_after_unblocking() {
      let fake = FakeControlPlane::default();
      let registrar = ProfileRegistrar::new(fake.clone(), descriptor());

      assert!(registrar.initialize(Arc::new(NullSink)).await);

      let state = fake.state.lock();
      assert_eq!(state.unblocked, 1);
      assert_eq!(state.registered.as_deref(), Some("/org/bluez/sppbridge"));
   }

   #[tokio::test]
   async fn test_initialize_reports_rejection_as_false() {
      let fake = FakeControlPlane::rejecting();
      let registrar = ProfileRegistrar::new(fake.clone(), descriptor());

      assert!(!registrar.initialize(Arc::new(NullSink)).await);
      assert!(fake.state.lock().registered.is_none());
   }

   #[tokio::test]
   async fn test_initialize_survives_unblock_failure() {
      let fake = FakeControlPlane::default();
      fake.state.lock().fail_unblock = true;
      let registrar = ProfileRegistrar::new(fake.clone(), descriptor());

      assert!(registrar.initialize(Arc::new(NullSink)).await);
   }

   #[tokio::test]
   async fn test_duplicate_registration_fails() {
      let fake = FakeControlPlane::default();
      let registrar = ProfileRegistrar::new(fake.clone(), descriptor());

      assert!(registrar.initialize(Arc::new(NullSink)).await);
      assert!(!registrar.initialize(Arc::new(NullSink)).await);
   }

   #[tokio::test]
   async fn test_deinitialize_swallows_errors() {
      let fake = FakeControlPlane::default();
      let registrar = ProfileRegistrar::new(fake.clone(), descriptor());

      // Nothing registered yet: the control plane errors, teardown doesn't.
      registrar.deinitialize().await;
      assert_eq!(fake.state.lock().unregistered, 0);

      assert!(registrar.initialize(Arc::new(NullSink)).await);
      registrar.deinitialize().await;
      let state = fake.state.lock();
      assert_eq!(state.unregistered, 1);
      assert!(state.registered.is_none());
   }
}
