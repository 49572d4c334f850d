//! Configuration management for the Pavlok service.
//!
//! Settings live in a TOML file; every field has a default so partial
//! files load. The device address may also come from the environment.

use std::{
   env, fs,
   path::{Path, PathBuf},
   str::FromStr,
   time::Duration,
};

use bluer::Address;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   error::{PavlokError, Result},
   pavlok::protocol::{
      DEFAULT_BATTERY_UUID, DEFAULT_HANDSHAKE_UUID, DEFAULT_VIBE_UUID, DEFAULT_ZAP_UUID,
      DeviceIdentity, RetryPolicy,
   },
};

/// Overrides `device_mac` when set and non-empty.
pub const DEVICE_MAC_ENV: &str = "PAVLOK_DEVICE_MAC";

const MAX_SCAN_TIMEOUT: Duration = Duration::from_secs(20);
const SCAN_TIMEOUT_SHARE: f64 = 0.6;
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_LOOP_PERIOD: Duration = Duration::from_millis(100);

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Peripheral address, `AA:BB:CC:DD:EE:FF`.
   #[serde(default)]
   pub device_mac: String,

   /// BlueZ adapter name such as `hci0`; the default adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<SmolStr>,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: f64,

   #[serde(default = "default_reconnect_interval")]
   pub reconnect_interval_sec: f64,

   #[serde(default = "default_keepalive_interval")]
   pub keepalive_interval_sec: f64,

   #[serde(default = "default_monitor_interval")]
   pub monitor_interval_sec: f64,

   #[serde(default = "default_write_retry_count")]
   pub write_retry_count: u32,

   #[serde(default = "default_max_reconnect_attempts")]
   pub max_reconnect_attempts: u32,

   /// Connect as soon as the service starts.
   #[serde(default)]
   pub auto_connect: bool,

   #[serde(default = "default_zap_uuid")]
   pub zap_uuid: Uuid,

   #[serde(default = "default_vibe_uuid")]
   pub vibe_uuid: Uuid,

   #[serde(default = "default_handshake_uuid")]
   pub handshake_uuid: Uuid,

   #[serde(default = "default_battery_uuid")]
   pub battery_uuid: Uuid,
}

const fn default_connect_timeout() -> f64 {
   30.0
}

const fn default_reconnect_interval() -> f64 {
   5.0
}

const fn default_keepalive_interval() -> f64 {
   5.5
}

const fn default_monitor_interval() -> f64 {
   5.0
}

const fn default_write_retry_count() -> u32 {
   2
}

const fn default_max_reconnect_attempts() -> u32 {
   3
}

const fn default_zap_uuid() -> Uuid {
   DEFAULT_ZAP_UUID
}

const fn default_vibe_uuid() -> Uuid {
   DEFAULT_VIBE_UUID
}

const fn default_handshake_uuid() -> Uuid {
   DEFAULT_HANDSHAKE_UUID
}

const fn default_battery_uuid() -> Uuid {
   DEFAULT_BATTERY_UUID
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device_mac: String::new(),
         adapter: None,
         connect_timeout_sec: default_connect_timeout(),
         reconnect_interval_sec: default_reconnect_interval(),
         keepalive_interval_sec: default_keepalive_interval(),
         monitor_interval_sec: default_monitor_interval(),
         write_retry_count: default_write_retry_count(),
         max_reconnect_attempts: default_max_reconnect_attempts(),
         auto_connect: false,
         zap_uuid: default_zap_uuid(),
         vibe_uuid: default_vibe_uuid(),
         handshake_uuid: default_handshake_uuid(),
         battery_uuid: default_battery_uuid(),
      }
   }
}

/// Seconds to a duration; negative, non-finite or overflowing values fall back.
fn secs(value: f64, fallback: f64) -> Duration {
   Duration::try_from_secs_f64(value)
      .or_else(|_| Duration::try_from_secs_f64(fallback))
      .unwrap_or_default()
}

impl Config {
   /// Loads configuration from disk or creates default if not exists,
   /// then applies environment overrides.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;
      let config = Self::load_from(&config_path)?;
      Ok(config.with_env_overrides(|key| env::var(key).ok()))
   }

   pub fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   /// Writes the configuration to `config_path`, creating parent directories.
   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(pavlok_home) = env::var("PAVLOK_HOME") {
         PathBuf::from(pavlok_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(PavlokError::ConfigDirNotFound);
      };

      Ok(config_dir.join("pavlokd").join("config.toml"))
   }

   #[must_use]
   pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
      if let Some(mac) = lookup(DEVICE_MAC_ENV)
         && !mac.trim().is_empty()
      {
         self.device_mac = mac.trim().to_owned();
      }
      self
   }

   pub fn device_address(&self) -> Result<Address> {
      let mac = self.device_mac.trim();
      if mac.is_empty() {
         return Err(PavlokError::InvalidAddress(String::new()));
      }
      Address::from_str(mac).map_err(|_| PavlokError::InvalidAddress(mac.to_owned()))
   }

   pub fn identity(&self) -> Result<DeviceIdentity> {
      let mut identity = DeviceIdentity::new(self.device_address()?);
      identity.zap = self.zap_uuid;
      identity.vibration = self.vibe_uuid;
      identity.handshake = self.handshake_uuid;
      identity.battery = self.battery_uuid;
      Ok(identity)
   }

   pub fn retry_policy(&self) -> RetryPolicy {
      let base = RetryPolicy::default();
      let connect_timeout =
         secs(self.connect_timeout_sec, default_connect_timeout()).max(MIN_CONNECT_TIMEOUT);

      RetryPolicy {
         max_reconnect_attempts: self.max_reconnect_attempts.max(1),
         reconnect_interval: secs(self.reconnect_interval_sec, default_reconnect_interval()),
         write_retries: self.write_retry_count.max(1),
         scan_timeout: connect_timeout
            .mul_f64(SCAN_TIMEOUT_SHARE)
            .min(MAX_SCAN_TIMEOUT),
         connect_timeout,
         keepalive_interval: secs(self.keepalive_interval_sec, default_keepalive_interval())
            .max(MIN_LOOP_PERIOD),
         monitor_interval: secs(self.monitor_interval_sec, default_monitor_interval())
            .max(MIN_LOOP_PERIOD),
         ..base
      }
   }
}
