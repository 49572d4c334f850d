//! Pavlok D-Bus Service
//!
//! This service keeps a BLE link to a Pavlok stimulus device alive and
//! exposes its commands (zap, vibration, raw writes, battery) on the
//! session bus.

use log::{info, warn};
use tokio::{signal, task};
use zbus::connection;

use bluetooth::transport::BluerConnector;
use dbus::PavlokService;
use pavlok::device::{DeviceSlot, PavlokDevice};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod pavlok;
#[cfg(test)]
mod testing;

use crate::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting Pavlok D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   let auto_connect = config.auto_connect;
   let devices = DeviceSlot::new(move || {
      PavlokDevice::new(&config, BluerConnector::new(config.adapter.clone()))
   });
   match devices.current().address() {
      Some(address) => info!("Configured device: {address}"),
      None => warn!(
         "No device address configured; set device_mac or {}",
         config::DEVICE_MAC_ENV
      ),
   }

   // Build D-Bus connection
   let _connection = connection::Builder::session()?
      .name("org.pavlok")?
      .serve_at("/org/pavlok/device", PavlokService::new(devices.clone()))?
      .build()
      .await?;

   info!("Pavlok D-Bus service started at org.pavlok");

   if auto_connect {
      let device = devices.current();
      task::spawn_blocking(move || {
         if !device.connect() {
            warn!("Auto-connect failed; waiting for a Connect call");
         }
      });
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down Pavlok service...");

   let device = devices.current();
   if task::spawn_blocking(move || device.disconnect()).await.is_err() {
      warn!("Device shutdown task panicked");
   }

   Ok(())
}
