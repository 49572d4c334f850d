//! Scripted in-memory transport used by the engine tests.

use std::{
   collections::VecDeque,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use parking_lot::{Mutex, MutexGuard};
use tokio::{
   sync::mpsc,
   time::{self, Instant},
};
use uuid::Uuid;

use crate::{
   bluetooth::{
      session::{LinkStatus, TransportSession},
      supervisor::{ReconnectSupervisor, StopSignal},
      transport::{Connector, DisconnectNotice, DisconnectNotifier, Link, Transport},
   },
   error::{PavlokError, Result},
   pavlok::protocol::{DEFAULT_HANDSHAKE_UUID, DeviceIdentity, RetryPolicy},
};

pub const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

#[derive(Debug)]
pub struct FakeState {
   /// Whether discovery finds the peripheral.
   pub reachable: bool,
   /// Liveness a fresh link starts with.
   pub alive_on_establish: bool,
   pub handshake_ok: bool,
   /// Scripted establish outcomes; `true` once exhausted.
   pub connect_results: VecDeque<bool>,
   /// Scripted outcomes for non-handshake writes; `write_default` once exhausted.
   pub command_results: VecDeque<bool>,
   pub write_default: bool,
   pub connect_latency: Duration,
   pub battery: Option<Vec<u8>>,
   /// Number of `open` calls that fail before one succeeds.
   pub open_failures: u32,

   pub opens: u32,
   pub discovers: u32,
   pub establishes: u32,
   pub closes: u32,
   pub open_links: u32,
   pub in_flight: u32,
   pub max_in_flight: u32,
   pub connect_spans: Vec<(Instant, Instant)>,
   pub writes: Vec<(Uuid, Vec<u8>)>,
   pub reads: Vec<Uuid>,

   notifier: Option<DisconnectNotifier>,
   current_alive: Option<Arc<AtomicBool>>,
}

impl Default for FakeState {
   fn default() -> Self {
      Self {
         reachable: true,
         alive_on_establish: true,
         handshake_ok: true,
         connect_results: VecDeque::new(),
         command_results: VecDeque::new(),
         write_default: true,
         connect_latency: Duration::ZERO,
         battery: None,
         open_failures: 0,
         opens: 0,
         discovers: 0,
         establishes: 0,
         closes: 0,
         open_links: 0,
         in_flight: 0,
         max_in_flight: 0,
         connect_spans: Vec::new(),
         writes: Vec::new(),
         reads: Vec::new(),
         notifier: None,
         current_alive: None,
      }
   }
}

impl FakeState {
   pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
      self
         .writes
         .iter()
         .filter(|(target, _)| *target == uuid)
         .map(|(_, data)| data.clone())
         .collect()
   }

   pub fn reads_from(&self, uuid: Uuid) -> usize {
      self.reads.iter().filter(|target| **target == uuid).count()
   }
}

#[derive(Debug, Clone, Default)]
pub struct FakeTransport(Arc<Mutex<FakeState>>);

impl FakeTransport {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn state(&self) -> MutexGuard<'_, FakeState> {
      self.0.lock()
   }

   /// The current link silently goes dead.
   pub fn kill_link(&self) {
      if let Some(alive) = &self.state().current_alive {
         alive.store(false, Ordering::Relaxed);
      }
   }

   /// The current link goes dead and reports it. Returns the notifier used.
   pub fn drop_link(&self) -> DisconnectNotifier {
      self.kill_link();
      let notifier = self
         .state()
         .notifier
         .clone()
         .expect("no link has been established");
      notifier.notify();
      notifier
   }
}

struct InFlight(Arc<Mutex<FakeState>>);

impl InFlight {
   fn enter(state: &Arc<Mutex<FakeState>>) -> Self {
      let mut s = state.lock();
      s.in_flight += 1;
      s.max_in_flight = s.max_in_flight.max(s.in_flight);
      Self(state.clone())
   }
}

impl Drop for InFlight {
   fn drop(&mut self) {
      self.0.lock().in_flight -= 1;
   }
}

impl Connector for FakeTransport {
   type Transport = Self;

   async fn open(&self) -> Result<Self> {
      let mut state = self.state();
      state.opens += 1;
      if state.open_failures > 0 {
         state.open_failures -= 1;
         return Err(PavlokError::Io(std::io::Error::other("adapter unavailable")));
      }
      Ok(self.clone())
   }
}

impl Transport for FakeTransport {
   type Peer = Address;
   type Link = FakeLink;

   async fn discover(&self, address: Address, _timeout: Duration) -> Result<Option<Address>> {
      let mut state = self.state();
      state.discovers += 1;
      Ok(state.reachable.then_some(address))
   }

   async fn establish(&self, _peer: Address, notifier: DisconnectNotifier) -> Result<FakeLink> {
      let (ok, latency) = {
         let mut state = self.state();
         state.establishes += 1;
         let ok = state.connect_results.pop_front().unwrap_or(true);
         (ok, state.connect_latency)
      };

      let started = Instant::now();
      let _in_flight = InFlight::enter(&self.0);
      time::sleep(latency).await;

      let mut state = self.state();
      state.connect_spans.push((started, Instant::now()));
      if !ok {
         return Err(PavlokError::Io(std::io::Error::other("connection refused")));
      }

      let alive = Arc::new(AtomicBool::new(state.alive_on_establish));
      state.current_alive = Some(alive.clone());
      state.notifier = Some(notifier);
      state.open_links += 1;
      Ok(FakeLink {
         state: self.0.clone(),
         alive,
         closed: AtomicBool::new(false),
      })
   }
}

pub struct FakeLink {
   state: Arc<Mutex<FakeState>>,
   alive: Arc<AtomicBool>,
   closed: AtomicBool,
}

impl FakeLink {
   fn alive(&self) -> bool {
      self.alive.load(Ordering::Relaxed)
   }
}

impl Link for FakeLink {
   async fn is_alive(&self) -> bool {
      self.alive()
   }

   async fn write(&self, characteristic: Uuid, data: &[u8], _with_response: bool) -> Result<()> {
      let mut state = self.state.lock();
      state.writes.push((characteristic, data.to_vec()));

      let ok = self.alive()
         && if characteristic == DEFAULT_HANDSHAKE_UUID {
            state.handshake_ok
         } else {
            let fallback = state.write_default;
            state.command_results.pop_front().unwrap_or(fallback)
         };
      if ok {
         Ok(())
      } else {
         Err(PavlokError::Io(std::io::Error::other("write rejected")))
      }
   }

   async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
      let mut state = self.state.lock();
      state.reads.push(characteristic);
      if !self.alive() {
         return Err(PavlokError::DeviceNotConnected);
      }
      state
         .battery
         .clone()
         .ok_or_else(|| PavlokError::Io(std::io::Error::other("read rejected")))
   }

   async fn close(&self) -> Result<()> {
      self.alive.store(false, Ordering::Relaxed);
      if !self.closed.swap(true, Ordering::Relaxed) {
         let mut state = self.state.lock();
         state.closes += 1;
         state.open_links -= 1;
      }
      Ok(())
   }
}

/// Millisecond-scale policy so paused-clock tests finish instantly.
pub fn fast_policy() -> RetryPolicy {
   RetryPolicy {
      max_reconnect_attempts: 3,
      reconnect_interval: Duration::from_millis(100),
      write_retries: 2,
      scan_timeout: Duration::from_millis(200),
      connect_timeout: Duration::from_secs(1),
      settle_delay: Duration::from_millis(20),
      release_delay: Duration::from_millis(10),
      discovery_grace: Duration::from_millis(5),
      notice_grace: Duration::from_millis(20),
      write_timeout: Duration::from_millis(200),
      keepalive_interval: Duration::from_millis(500),
      monitor_interval: Duration::from_millis(500),
   }
}

pub const fn identity() -> DeviceIdentity {
   DeviceIdentity::new(TEST_ADDRESS)
}

pub fn session(
   fake: &FakeTransport,
   policy: RetryPolicy,
) -> (TransportSession<FakeTransport>, mpsc::UnboundedReceiver<DisconnectNotice>) {
   let (tx, rx) = mpsc::unbounded_channel();
   let session = TransportSession::new(
      fake.clone(),
      identity(),
      policy,
      Arc::new(StopSignal::new()),
      Arc::new(LinkStatus::default()),
      tx,
   );
   (session, rx)
}

pub fn supervisor(
   fake: &FakeTransport,
   policy: RetryPolicy,
) -> (ReconnectSupervisor<FakeTransport>, mpsc::UnboundedReceiver<DisconnectNotice>) {
   let (session, rx) = session(fake, policy);
   (ReconnectSupervisor::new(session), rx)
}
