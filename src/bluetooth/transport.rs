//! Transport seam between the session engine and the Bluetooth stack.
//!
//! The engine only ever talks to a [`Transport`] (discovery + link
//! establishment) and the [`Link`] it hands back. The BlueZ implementation
//! lives here as well; tests substitute a scripted fake.

use std::{collections::HashMap, future::Future, pin::pin, time::Duration};

use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session,
   gatt::{
      WriteOp,
      remote::{Characteristic as GattCharacteristic, CharacteristicWriteRequest},
   },
};
use futures::stream::StreamExt;
use log::{debug, info};
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle, time};
use uuid::Uuid;

use crate::error::{PavlokError, Result};

/// Raised when a link drops without the session asking for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectNotice {
   /// Generation of the link the notice was raised for.
   pub generation: u64,
}

/// Handle given to a link so it can report an unexpected disconnect.
///
/// Notices are queued onto the owning context instead of touching session
/// state from whatever thread the stack delivers them on.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
   tx: mpsc::UnboundedSender<DisconnectNotice>,
   generation: u64,
}

impl DisconnectNotifier {
   pub const fn new(tx: mpsc::UnboundedSender<DisconnectNotice>, generation: u64) -> Self {
      Self { tx, generation }
   }

   pub const fn generation(&self) -> u64 {
      self.generation
   }

   pub fn notify(&self) {
      let notice = DisconnectNotice {
         generation: self.generation,
      };
      if self.tx.send(notice).is_err() {
         debug!("Disconnect notice dropped: context is gone");
      }
   }
}

/// Opens a [`Transport`] on the owning context.
///
/// The connector is moved onto the context thread, the transport it
/// produces never leaves it. `open` may be called again after a failure.
pub trait Connector: Send + 'static {
   type Transport: Transport + 'static;

   fn open(&self) -> impl Future<Output = Result<Self::Transport>>;
}

/// Discovery and link establishment.
pub trait Transport {
   type Peer;
   type Link: Link + 'static;

   /// Scans for `address`. `Ok(None)` means the scan ran to `timeout` without a hit.
   fn discover(
      &self,
      address: Address,
      timeout: Duration,
   ) -> impl Future<Output = Result<Option<Self::Peer>>>;

   /// Brings up a link to a discovered peer.
   fn establish(
      &self,
      peer: Self::Peer,
      notifier: DisconnectNotifier,
   ) -> impl Future<Output = Result<Self::Link>>;
}

/// One physical connection. Never reused once closed.
pub trait Link {
   /// What the backend currently reports; racy by nature.
   fn is_alive(&self) -> impl Future<Output = bool>;

   fn write(
      &self,
      characteristic: Uuid,
      data: &[u8],
      with_response: bool,
   ) -> impl Future<Output = Result<()>>;

   fn read(&self, characteristic: Uuid) -> impl Future<Output = Result<Vec<u8>>>;

   fn close(&self) -> impl Future<Output = Result<()>>;
}

// === BlueZ backend ===

/// Opens a BlueZ session on the named (or default) adapter.
pub struct BluerConnector {
   adapter: Option<SmolStr>,
}

impl BluerConnector {
   pub const fn new(adapter: Option<SmolStr>) -> Self {
      Self { adapter }
   }
}

impl Connector for BluerConnector {
   type Transport = BluerTransport;

   async fn open(&self) -> Result<BluerTransport> {
      let session = Session::new().await?;
      let adapter = match &self.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      info!("Using adapter: {}", adapter.name());

      Ok(BluerTransport {
         _session: session,
         adapter,
      })
   }
}

pub struct BluerTransport {
   _session: Session,
   adapter: Adapter,
}

impl Transport for BluerTransport {
   type Peer = Device;
   type Link = BluerLink;

   async fn discover(&self, address: Address, timeout: Duration) -> Result<Option<Device>> {
      // Already-known devices are replayed as `DeviceAdded` when discovery starts.
      let mut events = pin!(self.adapter.discover_devices().await?);
      let found = time::timeout(timeout, async {
         while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event
               && addr == address
            {
               return true;
            }
         }
         false
      })
      .await
      .unwrap_or(false);

      if !found {
         return Ok(None);
      }
      Ok(Some(self.adapter.device(address)?))
   }

   async fn establish(&self, device: Device, notifier: DisconnectNotifier) -> Result<BluerLink> {
      // Subscribe before connecting so a drop right after connect is not missed.
      let events = device.events().await?;

      if !device.is_connected().await? {
         device.connect().await?;
      }

      let address = device.address();
      let watcher = tokio::task::spawn_local(async move {
         let mut events = pin!(events);
         while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
               debug!("{address}: link reported disconnected");
               notifier.notify();
               break;
            }
         }
      });

      Ok(BluerLink {
         device,
         characteristics: parking_lot::Mutex::new(HashMap::new()),
         watcher,
      })
   }
}

pub struct BluerLink {
   device: Device,
   characteristics: parking_lot::Mutex<HashMap<Uuid, GattCharacteristic>>,
   watcher: JoinHandle<()>,
}

impl Drop for BluerLink {
   fn drop(&mut self) {
      self.watcher.abort();
   }
}

impl BluerLink {
   async fn characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic> {
      if let Some(ch) = self.characteristics.lock().get(&uuid) {
         return Ok(ch.clone());
      }

      for service in self.device.services().await? {
         for ch in service.characteristics().await? {
            if ch.uuid().await? == uuid {
               self.characteristics.lock().insert(uuid, ch.clone());
               return Ok(ch);
            }
         }
      }
      Err(PavlokError::CharacteristicNotFound(uuid))
   }
}

impl Link for BluerLink {
   async fn is_alive(&self) -> bool {
      self.device.is_connected().await.unwrap_or(false)
   }

   async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
      let ch = self.characteristic(characteristic).await?;
      let request = CharacteristicWriteRequest {
         op_type: if with_response {
            WriteOp::Request
         } else {
            WriteOp::Command
         },
         ..Default::default()
      };
      debug!("→ {}/{characteristic}: {}", self.device.address(), hex::encode(data));
      ch.write_ext(data, &request).await?;
      Ok(())
   }

   async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
      let ch = self.characteristic(characteristic).await?;
      let data = ch.read().await?;
      debug!("← {}/{characteristic}: {}", self.device.address(), hex::encode(&data));
      Ok(data)
   }

   async fn close(&self) -> Result<()> {
      // Our own close must not come back as an unexpected-disconnect notice.
      self.watcher.abort();
      if self.device.is_connected().await.unwrap_or(false) {
         self.device.disconnect().await?;
      }
      Ok(())
   }
}
