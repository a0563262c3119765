//! Server lifecycle: profile registration plus the bridge worker.
//!
//! [`ServerLifecycle::run`] registers the SPP profile and spawns a worker
//! task that turns inbound connections into bridge sessions, one at a time.
//! [`ServerLifecycle::quit`] signals the worker, waits for the active
//! session to unwind and unregisters the profile.

use std::{sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use tokio::{
   select,
   sync::{
      mpsc::{self, error::TrySendError},
      watch,
   },
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      device::DeviceLink,
      profile::{ControlPlane, ProfileDescriptor, ProfileRegistrar},
   },
   bridge::session::{BridgeSession, cancelled},
   config::Config,
   error::Result,
   event::{ConnectionEvent, ConnectionSink},
};

/// Pending connections BlueZ may hand us before the worker picks them up.
const EVENT_QUEUE_SIZE: usize = 4;
/// How long `quit` waits for the worker before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum LifecycleState {
   Stopped,
   Starting,
   Running,
   Stopping,
}

struct Worker {
   shutdown: watch::Sender<bool>,
   handle: JoinHandle<()>,
}

/// Hands control-plane callbacks over to the worker without blocking.
struct EventQueue {
   tx: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionSink for EventQueue {
   fn on_new_connection(&self, event: ConnectionEvent) {
      match self.tx.try_send(event) {
         Ok(()) => {},
         Err(TrySendError::Full(event)) => {
            warn!("Rejecting connection from {}: too many pending", event.device_path);
         },
         Err(TrySendError::Closed(event)) => {
            warn!("Rejecting connection from {}: server stopped", event.device_path);
         },
      }
   }
}

pub struct ServerLifecycle<C, L> {
   registrar: ProfileRegistrar<C>,
   config: Arc<Config>,
   link: Arc<L>,
   state: LifecycleState,
   worker: Option<Worker>,
}

impl<C: ControlPlane, L: DeviceLink> ServerLifecycle<C, L> {
   pub fn new(config: Config, control: C, link: L) -> Result<Self> {
      let profile = ProfileDescriptor::from_config(&config)?;
      Ok(Self {
         registrar: ProfileRegistrar::new(control, profile),
         config: Arc::new(config),
         link: Arc::new(link),
         state: LifecycleState::Stopped,
         worker: None,
      })
   }

   pub const fn state(&self) -> LifecycleState {
      self.state
   }

   /// Registers the profile and starts the worker.
   ///
   /// Returns `false` if registration failed or the server is not stopped.
   pub async fn run(&mut self) -> bool {
      if self.state != LifecycleState::Stopped {
         warn!("Ignoring run request, server is {}", self.state);
         return false;
      }
      self.state = LifecycleState::Starting;

      let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
      if !self.registrar.initialize(Arc::new(EventQueue { tx })).await {
         self.state = LifecycleState::Stopped;
         return false;
      }

      let (shutdown, shutdown_rx) = watch::channel(false);
      let handle = tokio::spawn(worker_loop(
         self.config.clone(),
         self.link.clone(),
         rx,
         shutdown_rx,
      ));
      self.worker = Some(Worker { shutdown, handle });
      self.state = LifecycleState::Running;

      info!(
         "Bridging {} to 127.0.0.1:{}",
         self.registrar.profile().name(),
         self.config.tcp_port
      );
      true
   }

   /// Stops the worker and unregisters the profile. No-op unless running.
   pub async fn quit(&mut self) {
      if self.state != LifecycleState::Running {
         debug!("Ignoring quit request, server is {}", self.state);
         return;
      }
      self.state = LifecycleState::Stopping;

      if let Some(Worker { shutdown, mut handle }) = self.worker.take() {
         let _ = shutdown.send(true);
         match time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => error!("Bridge worker panicked: {e}"),
            Err(_) => {
               warn!("Bridge worker did not stop within {SHUTDOWN_GRACE:?}, aborting");
               handle.abort();
            },
         }
      }

      self.registrar.deinitialize().await;
      self.state = LifecycleState::Stopped;
   }
}

async fn worker_loop<L: DeviceLink>(
   config: Arc<Config>,
   link: Arc<L>,
   mut events: mpsc::Receiver<ConnectionEvent>,
   mut shutdown: watch::Receiver<bool>,
) {
   debug!("Bridge worker starting");

   loop {
      let event = select! {
         event = events.recv() => match event {
            Some(event) => event,
            None => break,
         },
         () = cancelled(&mut shutdown) => break,
      };

      let mut session = BridgeSession::new(&config, &*link, shutdown.clone());
      let run = session.handle(event);
      tokio::pin!(run);

      // Single session at a time: anything arriving meanwhile is refused,
      // which closes its RFCOMM socket.
      let result = loop {
         select! {
            result = &mut run => break result,
            Some(extra) = events.recv() => {
               warn!(
                  "Rejecting connection from {}: a session is already active",
                  extra.device_path
               );
            },
         }
      };

      match result {
         Ok(end) => debug!("Session finished: {end}"),
         Err(e) => error!("Session failed: {e}"),
      }

      if *shutdown.borrow() {
         break;
      }
   }

   debug!("Bridge worker stopped");
}
