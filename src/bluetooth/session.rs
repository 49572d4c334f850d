//! Transport session: owns the single physical link to the peripheral.
//!
//! Every connect discards the previous link and builds a fresh one:
//! scan, establish, settle, verify, then a best-effort handshake.

use std::{
   future::Future,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
};

use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use tokio::{
   sync::{RwLock, mpsc},
   time,
};

use crate::{
   bluetooth::{
      supervisor::StopSignal,
      transport::{DisconnectNotice, DisconnectNotifier, Link, Transport},
   },
   error::{PavlokError, Result},
   pavlok::protocol::{CommandRequest, DeviceIdentity, MAX_INTENSITY, RetryPolicy},
};

/// Lifecycle of the connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum LinkState {
   #[default]
   #[strum(serialize = "idle")]
   Idle,
   #[strum(serialize = "scanning")]
   Scanning,
   #[strum(serialize = "connecting")]
   Connecting,
   #[strum(serialize = "settling")]
   Settling,
   #[strum(serialize = "connected")]
   Connected,
   #[strum(serialize = "closing")]
   Closing,
   #[strum(serialize = "failed")]
   Failed,
}

/// Session status readable from any thread without locking.
///
/// Only the owning context writes it. The connected flag is a hint: a
/// write outcome always overrides it.
#[derive(Debug, Default)]
pub struct LinkStatus {
   connected: AtomicBool,
   state: AtomicCell<LinkState>,
}

impl LinkStatus {
   pub fn is_connected(&self) -> bool {
      self.connected.load(Ordering::Relaxed)
   }

   pub fn state(&self) -> LinkState {
      self.state.load()
   }
}

/// Clears the `reconnecting` flag even if the connect future is dropped.
struct ReconnectingScope<'a>(&'a AtomicBool);

impl<'a> ReconnectingScope<'a> {
   fn enter(flag: &'a AtomicBool) -> Self {
      flag.store(true, Ordering::Relaxed);
      Self(flag)
   }
}

impl Drop for ReconnectingScope<'_> {
   fn drop(&mut self) {
      self.0.store(false, Ordering::Relaxed);
   }
}

pub struct TransportSession<T: Transport> {
   transport: T,
   identity: DeviceIdentity,
   policy: RetryPolicy,
   stop: Arc<StopSignal>,
   status: Arc<LinkStatus>,
   link: RwLock<Option<T::Link>>,
   reconnecting: AtomicBool,
   generation: AtomicU64,
   notices: mpsc::UnboundedSender<DisconnectNotice>,
}

impl<T: Transport> TransportSession<T> {
   pub fn new(
      transport: T,
      identity: DeviceIdentity,
      policy: RetryPolicy,
      stop: Arc<StopSignal>,
      status: Arc<LinkStatus>,
      notices: mpsc::UnboundedSender<DisconnectNotice>,
   ) -> Self {
      Self {
         transport,
         identity,
         policy,
         stop,
         status,
         link: RwLock::new(None),
         reconnecting: AtomicBool::new(false),
         generation: AtomicU64::new(0),
         notices,
      }
   }

   pub const fn policy(&self) -> &RetryPolicy {
      &self.policy
   }

   pub fn stop(&self) -> &StopSignal {
      &self.stop
   }

   pub fn state(&self) -> LinkState {
      self.status.state()
   }

   /// Cached connected flag. Never proof of a usable link.
   pub fn connected_hint(&self) -> bool {
      self.status.is_connected()
   }

   /// True only while this session's own `connect()` runs.
   pub fn is_reconnecting(&self) -> bool {
      self.reconnecting.load(Ordering::Relaxed)
   }

   /// Generation of the most recently established link.
   pub fn generation(&self) -> u64 {
      self.generation.load(Ordering::Relaxed)
   }

   fn set_state(&self, state: LinkState) {
      let prev = self.status.state.swap(state);
      if prev != state {
         debug!("{}: link {prev} -> {state}", self.identity.address);
      }
   }

   /// Records that the link was reported gone.
   pub fn mark_disconnected(&self) {
      self.status.connected.store(false, Ordering::Relaxed);
      self.leave_connected();
   }

   /// Moves a `Connected` state back to `Idle` once the link is dead.
   fn leave_connected(&self) {
      if self.state() == LinkState::Connected {
         self.set_state(LinkState::Failed);
         self.set_state(LinkState::Idle);
      }
   }

   async fn take_link(&self) -> Option<T::Link> {
      self.status.connected.store(false, Ordering::Relaxed);
      self.link.write().await.take()
   }

   /// Builds a fresh link, tearing down any previous one first.
   ///
   /// Returns true only once the link has survived the settle delay.
   pub async fn connect(&self) -> bool {
      let _scope = ReconnectingScope::enter(&self.reconnecting);

      match self.try_connect().await {
         Ok(()) => true,
         Err(PavlokError::ShutdownRequested) => {
            debug!("{}: connect aborted, shutdown requested", self.identity.address);
            self.set_state(LinkState::Idle);
            false
         },
         Err(e) => {
            error!("{}: connect failed: {e}", self.identity.address);
            self.set_state(LinkState::Failed);
            self.set_state(LinkState::Idle);
            false
         },
      }
   }

   async fn try_connect(&self) -> Result<()> {
      let address = self.identity.address;
      if self.stop.is_stopped() {
         return Err(PavlokError::ShutdownRequested);
      }

      if let Some(old) = self.take_link().await {
         self.set_state(LinkState::Closing);
         if let Err(e) = old.close().await {
            debug!("{address}: closing previous link failed (ignored): {e}");
         }
         drop(old);
         self.stop.sleep(self.policy.release_delay).await?;
      }

      self.set_state(LinkState::Scanning);
      let scan_timeout = self.policy.scan_timeout;
      info!("Scanning for {address} (timeout={scan_timeout:?})...");
      let peer = self
         .stop
         .run(time::timeout(
            scan_timeout,
            self.transport.discover(address, scan_timeout),
         ))
         .await?
         .unwrap_or(Ok(None))?
         .ok_or(PavlokError::DeviceNotFound(address))?;

      info!("Found {address}, connecting...");
      self.stop.sleep(self.policy.discovery_grace).await?;

      self.set_state(LinkState::Connecting);
      let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
      let notifier = DisconnectNotifier::new(self.notices.clone(), generation);
      let link = self
         .stop
         .run(time::timeout(
            self.policy.connect_timeout,
            self.transport.establish(peer, notifier),
         ))
         .await?
         .map_err(|_| PavlokError::RequestTimeout)??;

      self.set_state(LinkState::Settling);
      if let Err(e) = self.settle(&link).await {
         if let Err(close_err) = link.close().await {
            debug!("{address}: closing unsettled link failed (ignored): {close_err}");
         }
         return Err(e);
      }

      *self.link.write().await = Some(link);
      self.status.connected.store(true, Ordering::Relaxed);
      self.set_state(LinkState::Connected);
      info!("Connected to {address} (link #{generation})");

      self.handshake().await;
      Ok(())
   }

   /// Waits out the settle delay, then re-checks liveness: establishment can
   /// report success before the peripheral is ready.
   async fn settle(&self, link: &T::Link) -> Result<()> {
      self.stop.sleep(self.policy.settle_delay).await?;
      if link.is_alive().await {
         Ok(())
      } else {
         Err(PavlokError::LinkNotReady)
      }
   }

   /// Clears the peripheral's idle-supervision timer. Failure is not fatal.
   async fn handshake(&self) {
      match self.write(&CommandRequest::keepalive()).await {
         Ok(()) => debug!("{}: handshake written", self.identity.address),
         Err(e) => debug!("{}: handshake write skipped: {e}", self.identity.address),
      }
   }

   /// Closes the link if there is one. Never fails.
   pub async fn disconnect(&self) {
      let address = self.identity.address;
      let Some(link) = self.take_link().await else {
         debug!("{address}: disconnect requested with no active link");
         self.set_state(LinkState::Idle);
         return;
      };

      self.set_state(LinkState::Closing);
      match link.close().await {
         Ok(()) => info!("Disconnected from {address}"),
         Err(e) => warn!("{address}: disconnect error (ignored): {e}"),
      }
      self.set_state(LinkState::Idle);
   }

   /// Whether a link exists and the backend still reports it live.
   pub async fn is_connected(&self) -> bool {
      let alive = match self.link.read().await.as_ref() {
         Some(link) => link.is_alive().await,
         None => false,
      };
      self.status.connected.store(alive, Ordering::Relaxed);
      if !alive {
         self.leave_connected();
      }
      alive
   }

   /// Writes one command on the current link.
   pub async fn write(&self, request: &CommandRequest) -> Result<()> {
      let link = self.link.read().await;
      let link = link.as_ref().ok_or(PavlokError::DeviceNotConnected)?;
      let uuid = self.identity.uuid(request.characteristic);
      self
         .bounded(link.write(uuid, &request.payload, request.with_response))
         .await?
   }

   /// Battery level in percent. Any failure, including no link, is `None`.
   pub async fn read_battery(&self) -> Option<u8> {
      if !self.is_connected().await {
         return None;
      }

      let link = self.link.read().await;
      let link = link.as_ref()?;
      match self.bounded(link.read(self.identity.battery)).await {
         Ok(Ok(data)) => match data.first() {
            Some(&level) => Some(level.min(MAX_INTENSITY)),
            None => {
               debug!("{}: empty battery read", self.identity.address);
               None
            },
         },
         Ok(Err(e)) | Err(e) => {
            debug!("{}: battery read failed: {e}", self.identity.address);
            None
         },
      }
   }

   /// Applies the write timeout and the shutdown signal to a link operation.
   async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output> {
      self
         .stop
         .run(time::timeout(self.policy.write_timeout, fut))
         .await?
         .map_err(|_| PavlokError::RequestTimeout)
   }
}
