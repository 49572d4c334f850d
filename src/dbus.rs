use log::info;
use tokio::task;
use zbus::interface;

use crate::pavlok::device::{DeviceSlot, PavlokDevice};

pub struct PavlokService {
   devices: DeviceSlot,
}

/// Runs a blocking facade call off the bus executor.
async fn run_blocking<R, F>(device: PavlokDevice, f: F) -> zbus::fdo::Result<R>
where
   R: Send + 'static,
   F: FnOnce(PavlokDevice) -> R + Send + 'static,
{
   task::spawn_blocking(move || f(device))
      .await
      .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

impl PavlokService {
   pub const fn new(devices: DeviceSlot) -> Self {
      Self { devices }
   }

   async fn blocking<R, F>(&self, f: F) -> zbus::fdo::Result<R>
   where
      R: Send + 'static,
      F: FnOnce(PavlokDevice) -> R + Send + 'static,
   {
      run_blocking(self.devices.current(), f).await
   }
}

#[interface(name = "org.pavlok.Device")]
impl PavlokService {
   /// Starts a fresh device context if an earlier `Disconnect` stopped it.
   async fn connect(&self) -> zbus::fdo::Result<bool> {
      run_blocking(self.devices.revive(), |device| device.connect()).await
   }

   /// Stops the device context. Commands fail until the next `Connect`.
   async fn disconnect(&self) -> zbus::fdo::Result<()> {
      self.blocking(|device| device.disconnect()).await?;
      info!("Device disconnected over D-Bus");
      Ok(())
   }

   async fn send_zap(&self, intensity: u8) -> zbus::fdo::Result<bool> {
      self.blocking(move |device| device.send_zap(intensity)).await
   }

   async fn send_vibration(
      &self,
      intensity: u8,
      count: u8,
      ton: u8,
      toff: u8,
   ) -> zbus::fdo::Result<bool> {
      self
         .blocking(move |device| device.send_vibration(intensity, count, ton, toff))
         .await
   }

   async fn send_raw(&self, packet: String) -> zbus::fdo::Result<bool> {
      let packet = hex::decode(packet.trim())
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      if packet.is_empty() {
         return Err(zbus::fdo::Error::InvalidArgs("Empty packet".into()));
      }
      self.blocking(move |device| device.send_raw(&packet)).await
   }

   /// Battery percentage, or -1 when it cannot be read.
   async fn read_battery(&self) -> zbus::fdo::Result<i16> {
      let level = self.blocking(|device| device.read_battery()).await?;
      Ok(level.map_or(-1, i16::from))
   }

   #[zbus(property)]
   async fn connected(&self) -> bool {
      self.devices.current().is_connected()
   }

   #[zbus(property)]
   async fn status(&self) -> String {
      self.devices.current().to_json().to_string()
   }
}
