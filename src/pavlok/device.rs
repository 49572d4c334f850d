//! Synchronous device facade.
//!
//! All engine state lives on one dedicated thread running a single-threaded
//! runtime. Callers on any thread submit requests to it and block on the
//! reply with a timeout.

use std::{
   mem,
   rc::Rc,
   sync::Arc,
   thread,
   time::{Duration, Instant},
};

use bluer::Address;
use crossbeam::channel::{self, RecvTimeoutError};
use log::{debug, error, info, warn};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   runtime, select,
   sync::mpsc,
   task::{self, JoinHandle, LocalSet},
   time,
};

use crate::{
   bluetooth::{
      session::{LinkState, LinkStatus, TransportSession},
      supervisor::{ReconnectSupervisor, StopSignal},
      transport::{Connector, DisconnectNotice, Transport},
   },
   config::Config,
   error::{PavlokError, Result},
   pavlok::{
      dispatcher::CommandDispatcher,
      loops::{keepalive_loop, monitor_loop},
      protocol::{CommandRequest, DeviceIdentity, RetryPolicy},
   },
};

/// Facade-level connect attempts, each a full supervisor-guarded connect.
const CONNECT_ATTEMPTS: u32 = 3;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const BATTERY_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long shutdown waits for each background loop to unwind.
const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const CONTEXT_THREAD_NAME: &str = "pavlok-ble";

type Reply<T> = channel::Sender<T>;

enum Request {
   Connect {
      /// Answer from a live link instead of rebuilding it.
      reuse_live: bool,
      deadline: Instant,
      reply: Reply<bool>,
   },
   Send {
      command: CommandRequest,
      /// The caller stops waiting after this; a stale command is never written.
      deadline: Instant,
      reply: Reply<bool>,
   },
   ReadBattery(Reply<Option<u8>>),
   Shutdown(Reply<()>),
}

impl Request {
   /// Answers with the failure value. Hands back the reply of a shutdown.
   fn reject(self) -> Option<Reply<()>> {
      match self {
         Self::Connect { reply, .. } | Self::Send { reply, .. } => {
            let _ = reply.send(false);
         },
         Self::ReadBattery(reply) => {
            let _ = reply.send(None);
         },
         Self::Shutdown(reply) => return Some(reply),
      }
      None
   }
}

type Launch = Box<dyn FnOnce(mpsc::UnboundedReceiver<Request>) + Send>;

enum Context {
   /// Not started yet; holds everything the context thread needs.
   Idle(Launch),
   Running {
      inbox: mpsc::UnboundedSender<Request>,
      thread: thread::JoinHandle<()>,
   },
   Stopped,
}

struct DeviceInner {
   address: Option<Address>,
   address_str: SmolStr,
   policy: RetryPolicy,
   status: Arc<LinkStatus>,
   stop: Arc<StopSignal>,
   context: parking_lot::Mutex<Context>,
}

impl Drop for DeviceInner {
   fn drop(&mut self) {
      // The context thread winds down once its inbox closes.
      self.stop.stop();
   }
}

/// Handle to one Pavlok peripheral.
///
/// Cheaply cloneable; every clone drives the same context.
#[derive(Clone)]
pub struct PavlokDevice(Arc<DeviceInner>);

impl PavlokDevice {
   pub fn new<C: Connector>(config: &Config, connector: C) -> Self {
      let identity = match config.identity() {
         Ok(identity) => Some(identity),
         Err(e) => {
            warn!("No usable device address: {e}");
            None
         },
      };
      Self::with_policy(identity, config.retry_policy(), connector)
   }

   pub fn with_policy<C: Connector>(
      identity: Option<DeviceIdentity>,
      policy: RetryPolicy,
      connector: C,
   ) -> Self {
      let status = Arc::new(LinkStatus::default());
      let stop = Arc::new(StopSignal::new());

      let context = match identity {
         Some(identity) => {
            let status = status.clone();
            let stop = stop.clone();
            Context::Idle(Box::new(move |inbox: mpsc::UnboundedReceiver<Request>| {
               run_context(connector, identity, policy, stop, status, inbox);
            }))
         },
         None => Context::Stopped,
      };

      let address = identity.map(|identity| identity.address);
      Self(Arc::new(DeviceInner {
         address,
         address_str: address.map(|a| a.to_smolstr()).unwrap_or_default(),
         policy,
         status,
         stop,
         context: parking_lot::Mutex::new(context),
      }))
   }

   pub fn address(&self) -> Option<Address> {
      self.0.address
   }

   /// Whether [`disconnect`](Self::disconnect) has been called.
   pub fn is_shut_down(&self) -> bool {
      self.0.stop.is_stopped()
   }

   /// Cached connected flag; never blocks.
   pub fn is_connected(&self) -> bool {
      self.0.status.is_connected()
   }

   pub fn link_state(&self) -> LinkState {
      self.0.status.state()
   }

   /// Connects, retrying a few times, and starts the background loops.
   pub fn connect(&self) -> bool {
      let Some(address) = self.0.address else {
         error!("Cannot connect: no device address configured");
         return false;
      };

      let timeout = self.connect_timeout();
      for attempt in 1..=CONNECT_ATTEMPTS {
         if self.0.stop.is_stopped() {
            warn!("Connect to {address} ignored: device was shut down");
            return false;
         }

         info!("Connecting to {address} (attempt {attempt}/{CONNECT_ATTEMPTS})...");
         let deadline = Instant::now() + timeout;
         let request = |reply| Request::Connect {
            reuse_live: attempt > 1,
            deadline,
            reply,
         };
         match self.call(request, timeout) {
            Ok(true) => return true,
            Ok(false) => {},
            Err(e) => warn!("Connect request failed: {e}"),
         }

         if attempt < CONNECT_ATTEMPTS && !self.0.stop.is_stopped() {
            thread::sleep(self.0.policy.reconnect_interval);
         }
      }

      error!("Could not connect to {address} after {CONNECT_ATTEMPTS} attempts");
      false
   }

   /// Stops everything for good. Safe to call repeatedly.
   pub fn disconnect(&self) {
      let first = self.0.stop.stop();
      let context = mem::replace(&mut *self.0.context.lock(), Context::Stopped);
      let Context::Running { inbox, thread } = context else {
         if first {
            info!("Device shut down");
         }
         return;
      };

      let (tx, rx) = channel::bounded(1);
      if inbox.send(Request::Shutdown(tx)).is_err() {
         debug!("Device context already gone");
      }
      drop(inbox);

      match rx.recv_timeout(SHUTDOWN_TIMEOUT) {
         Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if thread.join().is_err() {
               error!("Device context thread panicked");
            }
         },
         Err(RecvTimeoutError::Timeout) => {
            warn!("Device context did not stop within {SHUTDOWN_TIMEOUT:?}, detaching");
         },
      }
      info!("Device shut down");
   }

   pub fn send_zap(&self, intensity: u8) -> bool {
      self.send(CommandRequest::zap(intensity))
   }

   pub fn send_vibration(&self, intensity: u8, count: u8, ton: u8, toff: u8) -> bool {
      self.send(CommandRequest::vibration(intensity, count, ton, toff))
   }

   /// Writes `bytes` verbatim to the vibration characteristic.
   pub fn send_raw(&self, bytes: &[u8]) -> bool {
      if bytes.is_empty() {
         warn!("Raw write rejected: empty payload");
         return false;
      }
      self.send(CommandRequest::raw(bytes))
   }

   pub fn read_battery(&self) -> Option<u8> {
      match self.call(Request::ReadBattery, BATTERY_TIMEOUT) {
         Ok(level) => level,
         Err(e) => {
            debug!("Battery read unavailable: {e}");
            None
         },
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.0.address_str.as_str(),
         "connected": self.is_connected(),
         "state": self.link_state().to_string(),
      })
   }

   fn send(&self, command: CommandRequest) -> bool {
      let label = command.label;
      let deadline = Instant::now() + COMMAND_TIMEOUT;
      let result = self.call(
         |reply| Request::Send {
            command,
            deadline,
            reply,
         },
         COMMAND_TIMEOUT,
      );
      match result {
         Ok(sent) => sent,
         Err(e) => {
            warn!("{label} not sent: {e}");
            false
         },
      }
   }

   /// Worst case for one guarded connect, plus slack for queueing.
   fn connect_timeout(&self) -> Duration {
      let p = &self.0.policy;
      p.release_delay
         + p.scan_timeout
         + p.discovery_grace
         + p.connect_timeout
         + p.settle_delay
         + p.write_timeout
         + Duration::from_secs(1)
   }

   /// Starts the context on first use and returns its inbox.
   fn inbox(&self) -> Result<mpsc::UnboundedSender<Request>> {
      if self.0.stop.is_stopped() {
         return Err(PavlokError::ShutdownRequested);
      }

      let mut context = self.0.context.lock();
      if let Context::Running { inbox, .. } = &*context {
         return Ok(inbox.clone());
      }
      let Context::Idle(launch) = mem::replace(&mut *context, Context::Stopped) else {
         return Err(PavlokError::ContextUnavailable);
      };

      let (tx, rx) = mpsc::unbounded_channel();
      let thread = thread::Builder::new()
         .name(CONTEXT_THREAD_NAME.into())
         .spawn(move || launch(rx))?;
      *context = Context::Running {
         inbox: tx.clone(),
         thread,
      };
      Ok(tx)
   }

   fn call<R>(&self, make: impl FnOnce(Reply<R>) -> Request, timeout: Duration) -> Result<R> {
      let inbox = self.inbox()?;
      let (tx, rx) = channel::bounded(1);
      inbox
         .send(make(tx))
         .map_err(|_| PavlokError::ContextUnavailable)?;
      rx.recv_timeout(timeout).map_err(|e| match e {
         RecvTimeoutError::Timeout => PavlokError::RequestTimeout,
         RecvTimeoutError::Disconnected => PavlokError::ContextUnavailable,
      })
   }
}

type DeviceFactory = Box<dyn Fn() -> PavlokDevice + Send + Sync>;

struct SlotInner {
   current: parking_lot::Mutex<PavlokDevice>,
   factory: DeviceFactory,
}

/// The daemon's current device. A shut-down device is replaced on demand.
#[derive(Clone)]
pub struct DeviceSlot(Arc<SlotInner>);

impl DeviceSlot {
   pub fn new(factory: impl Fn() -> PavlokDevice + Send + Sync + 'static) -> Self {
      Self(Arc::new(SlotInner {
         current: parking_lot::Mutex::new(factory()),
         factory: Box::new(factory),
      }))
   }

   pub fn current(&self) -> PavlokDevice {
      self.0.current.lock().clone()
   }

   /// The current device, rebuilt first if it was shut down.
   pub fn revive(&self) -> PavlokDevice {
      let mut current = self.0.current.lock();
      if current.is_shut_down() {
         info!("Starting a new device context");
         *current = (self.0.factory)();
      }
      current.clone()
   }
}

/// Body of the context thread.
fn run_context<C: Connector>(
   connector: C,
   identity: DeviceIdentity,
   policy: RetryPolicy,
   stop: Arc<StopSignal>,
   status: Arc<LinkStatus>,
   inbox: mpsc::UnboundedReceiver<Request>,
) {
   let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
      Ok(runtime) => runtime,
      Err(e) => {
         error!("Failed to start device runtime: {e}");
         return;
      },
   };

   LocalSet::new().block_on(&runtime, async move {
      let mut inbox = inbox;
      // Opened on the first request; a failed open is retried by the next one.
      let (transport, first) = loop {
         let Some(request) = inbox.recv().await else {
            debug!("All device handles dropped");
            return;
         };
         match stop.run(connector.open()).await {
            Ok(Ok(transport)) => break (transport, request),
            Ok(Err(e)) | Err(e) => {
               error!("Bluetooth transport unavailable: {e}");
               if let Some(reply) = request.reject() {
                  let _ = reply.send(());
                  return;
               }
            },
         }
      };
      let (notice_tx, notices) = mpsc::unbounded_channel();
      let session = TransportSession::new(transport, identity, policy, stop, status, notice_tx);
      DeviceContext::new(session, inbox, notices).run(first).await;
   });
   debug!("Device context exited");
}

/// The actor owning the engine. Requests are handled one at a time.
struct DeviceContext<T: Transport> {
   supervisor: Rc<ReconnectSupervisor<T>>,
   dispatcher: CommandDispatcher<T>,
   inbox: mpsc::UnboundedReceiver<Request>,
   notices: mpsc::UnboundedReceiver<DisconnectNotice>,
   monitor: Option<JoinHandle<()>>,
   keepalive: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> DeviceContext<T> {
   fn new(
      session: TransportSession<T>,
      inbox: mpsc::UnboundedReceiver<Request>,
      notices: mpsc::UnboundedReceiver<DisconnectNotice>,
   ) -> Self {
      let supervisor = Rc::new(ReconnectSupervisor::new(session));
      Self {
         dispatcher: CommandDispatcher::new(supervisor.clone()),
         supervisor,
         inbox,
         notices,
         monitor: None,
         keepalive: None,
      }
   }

   async fn run(mut self, first: Request) {
      let shutdown_reply = match self.handle(first).await {
         Some(reply) => Some(reply),
         None => self.serve().await,
      };

      self.shutdown().await;
      if let Some(reply) = shutdown_reply {
         let _ = reply.send(());
      }
   }

   async fn serve(&mut self) -> Option<Reply<()>> {
      loop {
         select! {
            request = self.inbox.recv() => match request {
               None => {
                  debug!("All device handles dropped");
                  return None;
               },
               Some(request) => {
                  if let Some(reply) = self.handle(request).await {
                     return Some(reply);
                  }
               },
            },
            Some(notice) = self.notices.recv() => {
               let supervisor = self.supervisor.clone();
               task::spawn_local(async move { supervisor.on_disconnect_notice(notice).await });
            },
         }
      }
   }

   /// Returns the shutdown reply once shutdown is requested.
   async fn handle(&mut self, request: Request) -> Option<Reply<()>> {
      match request {
         Request::Connect {
            reuse_live,
            deadline,
            reply,
         } => {
            if Instant::now() >= deadline {
               warn!("Connect request expired before it could run");
               return None;
            }
            let connected = if reuse_live && self.supervisor.session().is_connected().await {
               debug!("Link already up, keeping it");
               true
            } else {
               self.supervisor.connect_once().await
            };
            if connected {
               self.start_loops();
            }
            let _ = reply.send(connected);
         },
         Request::Send {
            command,
            deadline,
            reply,
         } => {
            if Instant::now() >= deadline {
               warn!("{} expired before it could be sent", command.label);
               return None;
            }
            let sent = self.dispatcher.write_with_retry(&command).await;
            let _ = reply.send(sent);
         },
         Request::ReadBattery(reply) => {
            let _ = reply.send(self.supervisor.session().read_battery().await);
         },
         Request::Shutdown(reply) => return Some(reply),
      }
      None
   }

   fn start_loops(&mut self) {
      if self.monitor.as_ref().is_none_or(JoinHandle::is_finished) {
         debug!("Starting monitor loop");
         self.monitor = Some(task::spawn_local(monitor_loop(self.supervisor.clone())));
      }
      if self.keepalive.as_ref().is_none_or(JoinHandle::is_finished) {
         debug!("Starting keepalive loop");
         self.keepalive = Some(task::spawn_local(keepalive_loop(self.supervisor.clone())));
      }
   }

   async fn shutdown(&mut self) {
      let session = self.supervisor.session();
      session.stop().stop();

      for handle in [self.monitor.take(), self.keepalive.take()].into_iter().flatten() {
         handle.abort();
         if time::timeout(LOOP_JOIN_TIMEOUT, handle).await.is_err() {
            warn!("Background loop did not stop within {LOOP_JOIN_TIMEOUT:?}");
         }
      }
      session.disconnect().await;
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      pavlok::protocol::{DEFAULT_VIBE_UUID, DEFAULT_ZAP_UUID},
      testing::{FakeTransport, fast_policy, identity},
   };

   fn device(fake: &FakeTransport, policy: RetryPolicy) -> PavlokDevice {
      PavlokDevice::with_policy(Some(identity()), policy, fake.clone())
   }

   /// Long loop periods so only the behaviour under test touches the link.
   fn quiet_policy() -> RetryPolicy {
      RetryPolicy {
         keepalive_interval: Duration::from_secs(3600),
         monitor_interval: Duration::from_secs(3600),
         ..fast_policy()
      }
   }

   #[test]
   fn test_connect_and_send() {
      let fake = FakeTransport::new();
      let device = device(&fake, quiet_policy());

      assert!(device.connect());
      assert!(device.is_connected());
      assert_eq!(device.link_state(), LinkState::Connected);

      assert!(device.send_zap(42));
      assert!(device.send_vibration(50, 3, 10, 20));
      assert!(device.send_raw(&[0x81, 0x02, 33, 5, 5]));
      {
         let state = fake.state();
         assert_eq!(state.writes_to(DEFAULT_ZAP_UUID), vec![vec![0x89, 42]]);
         assert_eq!(state.writes_to(DEFAULT_VIBE_UUID), vec![
            vec![0x83, 0x02, 50, 10, 20],
            vec![0x81, 0x02, 33, 5, 5],
         ]);
      }

      let status = device.to_json();
      assert_eq!(status["address"], "AA:BB:CC:DD:EE:FF");
      assert_eq!(status["connected"], true);
      assert_eq!(status["state"], "connected");

      device.disconnect();
      assert!(!device.is_connected());
      assert_eq!(fake.state().open_links, 0);
   }

   #[test]
   fn test_connect_retries_then_gives_up() {
      let fake = FakeTransport::new();
      fake.state().reachable = false;
      let device = device(&fake, quiet_policy());

      assert!(!device.connect());
      // One session connect per facade attempt.
      assert_eq!(fake.state().discovers, CONNECT_ATTEMPTS);
      device.disconnect();
   }

   #[test]
   fn test_failed_transport_open_is_retried() {
      let fake = FakeTransport::new();
      fake.state().open_failures = 1;
      let device = device(&fake, quiet_policy());

      assert!(device.connect());
      assert!(device.is_connected());
      {
         let state = fake.state();
         assert_eq!(state.opens, 2);
         assert_eq!(state.establishes, 1);
      }
      assert!(device.send_zap(5));
      device.disconnect();
   }

   #[test]
   fn test_request_after_failed_open_reopens() {
      let fake = FakeTransport::new();
      fake.state().open_failures = 1;
      let device = device(&fake, quiet_policy());

      assert!(!device.send_zap(5));
      assert_eq!(fake.state().discovers, 0);
      assert!(device.send_zap(5));
      assert_eq!(fake.state().opens, 2);
      assert_eq!(fake.state().writes_to(DEFAULT_ZAP_UUID), vec![vec![0x89, 5]]);
      device.disconnect();
   }

   #[test]
   fn test_expired_connect_does_not_rebuild_link() {
      let fake = FakeTransport::new();
      fake.state().reachable = false;
      let policy = RetryPolicy {
         connect_timeout: Duration::from_millis(200),
         reconnect_interval: Duration::from_millis(1200),
         ..quiet_policy()
      };
      let device = device(&fake, policy);

      // Holds the context in reconnect backoff past the first connect timeout.
      let busy = thread::spawn({
         let device = device.clone();
         move || device.send_zap(10)
      });
      thread::sleep(Duration::from_millis(100));
      let connecting = thread::spawn({
         let device = device.clone();
         move || device.connect()
      });

      assert!(!busy.join().unwrap());
      fake.state().reachable = true;
      assert!(connecting.join().unwrap());
      {
         let state = fake.state();
         assert_eq!(state.establishes, 1);
         assert_eq!(state.open_links, 1);
      }
      device.disconnect();
   }

   #[test]
   fn test_missing_address_never_starts() {
      let fake = FakeTransport::new();
      let device = PavlokDevice::with_policy(None, fast_policy(), fake.clone());

      assert!(!device.connect());
      assert!(!device.send_zap(10));
      assert_eq!(device.read_battery(), None);
      assert_eq!(fake.state().discovers, 0);
      device.disconnect();
   }

   #[test]
   fn test_disconnect_is_final_and_idempotent() {
      let fake = FakeTransport::new();
      let device = device(&fake, quiet_policy());

      assert!(device.connect());
      device.disconnect();
      device.disconnect();

      assert!(!device.connect());
      assert!(!device.send_zap(10));
      let state = fake.state();
      assert_eq!(state.establishes, 1);
      assert_eq!(state.closes, 1);
   }

   #[test]
   fn test_slot_replaces_shut_down_device() {
      let fake = FakeTransport::new();
      let devices = DeviceSlot::new({
         let fake = fake.clone();
         move || device(&fake, quiet_policy())
      });

      let first = devices.current();
      assert!(first.connect());
      assert!(devices.revive().is_connected());
      assert_eq!(fake.state().establishes, 1);

      first.disconnect();
      assert!(!devices.current().connect());

      let second = devices.revive();
      assert!(!second.is_shut_down());
      assert!(second.connect());
      assert!(devices.current().is_connected());
      {
         let state = fake.state();
         assert_eq!(state.establishes, 2);
         assert_eq!(state.open_links, 1);
      }
      second.disconnect();
   }

   #[test]
   fn test_empty_raw_payload_is_rejected() {
      let fake = FakeTransport::new();
      let device = device(&fake, quiet_policy());

      assert!(!device.send_raw(&[]));
      assert_eq!(fake.state().discovers, 0);
      device.disconnect();
   }

   #[test]
   fn test_battery() {
      let fake = FakeTransport::new();
      let device = device(&fake, quiet_policy());

      assert_eq!(device.read_battery(), None);
      assert!(device.connect());
      fake.state().battery = Some(vec![64]);
      assert_eq!(device.read_battery(), Some(64));
      device.disconnect();
   }

   #[test]
   fn test_disconnect_notice_reconnects() {
      let fake = FakeTransport::new();
      let device = device(&fake, quiet_policy());

      assert!(device.connect());
      fake.drop_link();
      thread::sleep(Duration::from_millis(500));

      assert!(device.is_connected());
      assert_eq!(fake.state().establishes, 2);
      device.disconnect();
   }

   #[test]
   fn test_monitor_runs_after_connect() {
      let fake = FakeTransport::new();
      let policy = RetryPolicy {
         monitor_interval: Duration::from_millis(100),
         ..quiet_policy()
      };
      let device = device(&fake, policy);

      assert!(device.connect());
      fake.kill_link();
      thread::sleep(Duration::from_millis(600));

      assert_eq!(fake.state().establishes, 2);
      assert!(device.is_connected());
      device.disconnect();
   }
}
