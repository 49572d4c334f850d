//! Reconnection supervisor.
//!
//! A single guard decides who may rebuild the link. Three independent
//! triggers feed it: the periodic monitor, the command path after a failed
//! write, and unexpected-disconnect notices from the link itself.

use std::{future::Future, time::Duration};

use log::{debug, error, info, warn};
use tokio::{
   select,
   sync::{Mutex, MutexGuard, watch},
   time,
};

use crate::{
   bluetooth::{
      session::TransportSession,
      transport::{DisconnectNotice, Transport},
   },
   error::{PavlokError, Result},
};

/// One-way shutdown flag, awaitable from every suspension point.
#[derive(Debug)]
pub struct StopSignal {
   tx: watch::Sender<bool>,
}

impl Default for StopSignal {
   fn default() -> Self {
      Self::new()
   }
}

impl StopSignal {
   pub fn new() -> Self {
      let (tx, _) = watch::channel(false);
      Self { tx }
   }

   /// Sets the flag. Returns true for the call that flipped it.
   pub fn stop(&self) -> bool {
      !self.tx.send_replace(true)
   }

   pub fn is_stopped(&self) -> bool {
      *self.tx.borrow()
   }

   /// Resolves once the flag is set.
   pub async fn stopped(&self) {
      let mut rx = self.tx.subscribe();
      let _ = rx.wait_for(|stopped| *stopped).await;
   }

   /// Drives `fut` unless shutdown is requested first.
   pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
      if self.is_stopped() {
         return Err(PavlokError::ShutdownRequested);
      }
      select! {
         biased;
         () = self.stopped() => Err(PavlokError::ShutdownRequested),
         out = fut => Ok(out),
      }
   }

   /// Sleep that ends early with `ShutdownRequested`.
   pub async fn sleep(&self, duration: Duration) -> Result<()> {
      self.run(time::sleep(duration)).await
   }
}

/// Who asked for a reconnect; only used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ReconnectTrigger {
   #[strum(serialize = "connect")]
   Connect,
   #[strum(serialize = "ensure")]
   Ensure,
   #[strum(serialize = "monitor")]
   Monitor,
   #[strum(serialize = "write-retry")]
   WriteRetry,
   #[strum(serialize = "disconnect-cb")]
   DisconnectNotice,
}

/// Proof that the caller holds the reconnect guard.
pub type ReconnectGuard<'a> = MutexGuard<'a, ()>;

pub struct ReconnectSupervisor<T: Transport> {
   session: TransportSession<T>,
   guard: Mutex<()>,
}

impl<T: Transport> ReconnectSupervisor<T> {
   pub fn new(session: TransportSession<T>) -> Self {
      Self {
         session,
         guard: Mutex::new(()),
      }
   }

   pub const fn session(&self) -> &TransportSession<T> {
      &self.session
   }

   /// Whether some reconnect sequence currently holds the guard.
   pub fn is_reconnecting(&self) -> bool {
      self.guard.try_lock().is_err()
   }

   /// Returns true when the link is usable.
   ///
   /// If another sequence holds the guard this returns false at once; the
   /// caller should try again later rather than escalate.
   pub async fn ensure_connected(&self, trigger: ReconnectTrigger) -> bool {
      if self.session.is_connected().await {
         return true;
      }

      let Ok(guard) = self.guard.try_lock() else {
         warn!("Reconnect in progress, skipping [{trigger}]");
         return false;
      };

      // The previous holder may have just succeeded.
      if self.session.is_connected().await {
         return true;
      }
      warn!("Not connected, reconnecting [{trigger}]...");
      self.do_reconnect(&guard, trigger).await
   }

   /// Rebuilds the link regardless of what the connected flag claims.
   ///
   /// Waits for the guard if another sequence holds it.
   pub async fn force_reconnect(&self, trigger: ReconnectTrigger) -> bool {
      let Ok(guard) = self.session.stop().run(self.guard.lock()).await else {
         return false;
      };
      info!("Forcing reconnect [{trigger}]...");
      self.do_reconnect(&guard, trigger).await
   }

   /// A single guarded connect attempt, used by the facade's own retry loop.
   pub async fn connect_once(&self) -> bool {
      let Ok(_guard) = self.guard.try_lock() else {
         warn!("Reconnect in progress, skipping [{}]", ReconnectTrigger::Connect);
         return false;
      };
      self.session.connect().await
   }

   /// Drops the current link unless a reconnect is already replacing it.
   pub async fn discard_link(&self) {
      match self.guard.try_lock() {
         Ok(_guard) => self.session.disconnect().await,
         Err(_) => debug!("Reconnect in progress, link left to it"),
      }
   }

   /// Low-latency path for links reporting a drop on their own.
   ///
   /// Skipped when the drop was caused by our own connect, belongs to an
   /// old link, or a reconnect is already running.
   pub async fn on_disconnect_notice(&self, notice: DisconnectNotice) {
      let session = &self.session;
      if session.stop().is_stopped() {
         return;
      }
      if session.is_reconnecting() {
         debug!("Disconnect notice ignored: connect in progress");
         return;
      }
      if notice.generation != session.generation() {
         debug!(
            "Disconnect notice ignored: link #{} is not current (#{})",
            notice.generation,
            session.generation()
         );
         return;
      }
      if self.is_reconnecting() {
         debug!("Reconnect already in progress, skipping disconnect notice");
         return;
      }

      warn!("Unexpected disconnect of link #{}", notice.generation);
      session.mark_disconnected();

      // Give the peripheral's stack a moment before reconnecting.
      if session.stop().sleep(session.policy().notice_grace).await.is_err() {
         return;
      }

      let Ok(guard) = self.guard.try_lock() else {
         debug!("Reconnect started meanwhile, skipping disconnect notice");
         return;
      };
      if !session.is_connected().await && !session.stop().is_stopped() {
         self
            .do_reconnect(&guard, ReconnectTrigger::DisconnectNotice)
            .await;
      }
   }

   /// Bounded reconnect loop. The guard must be held.
   pub async fn do_reconnect(
      &self,
      _held: &ReconnectGuard<'_>,
      trigger: ReconnectTrigger,
   ) -> bool {
      let policy = self.session.policy();
      let attempts = policy.max_reconnect_attempts.max(1);

      for attempt in 1..=attempts {
         if self.session.stop().is_stopped() {
            debug!("Reconnect [{trigger}] aborted: shutdown requested");
            return false;
         }
         info!("Reconnect [{trigger}] attempt {attempt}/{attempts}...");
         if self.session.connect().await {
            return true;
         }
         if attempt == attempts {
            break;
         }
         if self.session.stop().sleep(policy.reconnect_interval).await.is_err() {
            debug!("Reconnect [{trigger}] backoff interrupted by shutdown");
            return false;
         }
      }

      error!("Reconnect [{trigger}] failed after {attempts} attempts");
      false
   }
}
