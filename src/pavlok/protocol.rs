//! Pavlok wire protocol definitions.
//!
//! The peripheral exposes a handful of GATT characteristics. Stimulus
//! commands are short fixed-layout byte strings; their meaning beyond the
//! layout is owned by the caller.

use std::time::Duration;

use bluer::Address;
use smallvec::SmallVec;
use uuid::Uuid;

/// Inline buffer for command payloads; every fixed command fits without allocating.
pub type Payload = SmallVec<[u8; 8]>;

/// Opcode of the zap command.
pub const OP_ZAP: u8 = 0x89;
/// High bit set on the first vibration byte; the low 7 bits carry the repeat count.
pub const OP_VIBRATION: u8 = 0x80;
/// Second vibration byte, fixed by the firmware.
pub const VIBRATION_MODE: u8 = 0x02;
/// Payload written to the handshake characteristic on connect and as keepalive.
pub const PKT_HANDSHAKE: &[u8] = &[87, 84];

pub const MAX_INTENSITY: u8 = 100;
pub const MAX_REPEAT_COUNT: u8 = 127;

pub const DEFAULT_ZAP_UUID: Uuid = Uuid::from_u128(0x00001003_0000_1000_8000_00805f9b34fb);
pub const DEFAULT_VIBE_UUID: Uuid = Uuid::from_u128(0x00001001_0000_1000_8000_00805f9b34fb);
pub const DEFAULT_HANDSHAKE_UUID: Uuid = Uuid::from_u128(0x00007999_0000_1000_8000_00805f9b34fb);
/// Standard GATT Battery Level characteristic.
pub const DEFAULT_BATTERY_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Characteristics the service talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Characteristic {
   #[strum(serialize = "zap")]
   Zap,
   #[strum(serialize = "vibration")]
   Vibration,
   #[strum(serialize = "handshake")]
   Handshake,
   #[strum(serialize = "battery")]
   Battery,
}

/// Peripheral address plus the characteristic ids used for each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
   pub address: Address,
   pub zap: Uuid,
   pub vibration: Uuid,
   pub handshake: Uuid,
   pub battery: Uuid,
}

impl DeviceIdentity {
   /// Identity using the stock Pavlok 3 characteristic layout.
   pub const fn new(address: Address) -> Self {
      Self {
         address,
         zap: DEFAULT_ZAP_UUID,
         vibration: DEFAULT_VIBE_UUID,
         handshake: DEFAULT_HANDSHAKE_UUID,
         battery: DEFAULT_BATTERY_UUID,
      }
   }

   pub const fn uuid(&self, characteristic: Characteristic) -> Uuid {
      match characteristic {
         Characteristic::Zap => self.zap,
         Characteristic::Vibration => self.vibration,
         Characteristic::Handshake => self.handshake,
         Characteristic::Battery => self.battery,
      }
   }
}

/// Retry budgets, backoff and per-phase timing used by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
   /// Attempts per reconnect sequence.
   pub max_reconnect_attempts: u32,
   /// Fixed backoff between reconnect attempts, and between facade connect attempts.
   pub reconnect_interval: Duration,
   /// Write attempts per command, including the first.
   pub write_retries: u32,
   pub scan_timeout: Duration,
   pub connect_timeout: Duration,
   /// Pause after link establishment before the link is trusted.
   pub settle_delay: Duration,
   /// Wait after closing a previous handle so the stack can release it.
   pub release_delay: Duration,
   /// Wait between discovery and connection establishment.
   pub discovery_grace: Duration,
   /// Wait after an unexpected disconnect before reconnecting.
   pub notice_grace: Duration,
   pub write_timeout: Duration,
   pub keepalive_interval: Duration,
   pub monitor_interval: Duration,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_reconnect_attempts: 3,
         reconnect_interval: Duration::from_secs(5),
         write_retries: 2,
         scan_timeout: Duration::from_secs(18),
         connect_timeout: Duration::from_secs(30),
         settle_delay: Duration::from_secs(1),
         release_delay: Duration::from_secs(2),
         discovery_grace: Duration::from_secs(1),
         notice_grace: Duration::from_secs(1),
         write_timeout: Duration::from_secs(10),
         keepalive_interval: Duration::from_millis(5500),
         monitor_interval: Duration::from_secs(5),
      }
   }
}

/// A single outward write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
   pub characteristic: Characteristic,
   pub payload: Payload,
   /// Only used in log lines.
   pub label: &'static str,
   /// Whether the write waits for the peripheral's acknowledgment.
   pub with_response: bool,
}

impl CommandRequest {
   pub fn new(characteristic: Characteristic, payload: &[u8], label: &'static str) -> Self {
      Self {
         characteristic,
         payload: Payload::from_slice(payload),
         label,
         with_response: true,
      }
   }

   /// Zap at `intensity` percent.
   pub fn zap(intensity: u8) -> Self {
      Self::new(Characteristic::Zap, &encode_zap(intensity), "Zap")
   }

   /// Vibration pattern: `count` repeats of `ton` on / `toff` off.
   pub fn vibration(intensity: u8, count: u8, ton: u8, toff: u8) -> Self {
      Self::new(
         Characteristic::Vibration,
         &encode_vibration(intensity, count, ton, toff),
         "Vibration",
      )
   }

   /// Caller-supplied bytes written verbatim to the vibration characteristic.
   pub fn raw(bytes: &[u8]) -> Self {
      Self::new(Characteristic::Vibration, bytes, "RawVibe")
   }

   pub fn keepalive() -> Self {
      Self::new(Characteristic::Handshake, PKT_HANDSHAKE, "Keepalive")
   }

   /// Intensity byte for logging, when the layout carries one.
   pub fn intensity(&self) -> Option<u8> {
      match self.characteristic {
         Characteristic::Zap => self.payload.get(1).copied(),
         Characteristic::Vibration => self.payload.get(2).copied(),
         _ => None,
      }
   }
}

pub fn encode_zap(intensity: u8) -> [u8; 2] {
   [OP_ZAP, intensity.min(MAX_INTENSITY)]
}

pub fn encode_vibration(intensity: u8, count: u8, ton: u8, toff: u8) -> [u8; 5] {
   let count = count.clamp(1, MAX_REPEAT_COUNT);
   [
      OP_VIBRATION | count,
      VIBRATION_MODE,
      intensity.min(MAX_INTENSITY),
      ton,
      toff,
   ]
}
