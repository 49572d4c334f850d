//! Periodic background tasks bound to the device context.

use std::{rc::Rc, time::Duration};

use log::{debug, info, warn};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::{
   bluetooth::{
      supervisor::{ReconnectSupervisor, ReconnectTrigger},
      transport::Transport,
   },
   error::PavlokError,
   pavlok::protocol::CommandRequest,
};

/// First tick one period from now, then every period; late ticks are dropped.
fn ticker(period: Duration) -> Interval {
   let mut interval = time::interval_at(Instant::now() + period, period);
   interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
   interval
}

/// Writes the handshake bytes every keepalive interval so the peripheral's
/// idle-supervision timer never closes the link.
///
/// Never reconnects: a dead link is the monitor's business.
pub async fn keepalive_loop<T: Transport>(supervisor: Rc<ReconnectSupervisor<T>>) {
   let session = supervisor.session();
   let mut ticker = ticker(session.policy().keepalive_interval);
   let ping = CommandRequest::keepalive();

   while session.stop().run(ticker.tick()).await.is_ok() {
      if !session.is_connected().await {
         debug!("Keepalive skipped: not connected");
         continue;
      }
      match session.write(&ping).await {
         Ok(()) => debug!("Keepalive sent"),
         Err(PavlokError::ShutdownRequested) => break,
         Err(e) => warn!("Keepalive failed: {e}"),
      }
   }
   info!("Keepalive loop stopped");
}

/// Checks liveness every monitor interval and asks the supervisor for a
/// guarded reconnect when the link is gone.
pub async fn monitor_loop<T: Transport>(supervisor: Rc<ReconnectSupervisor<T>>) {
   let session = supervisor.session();
   let mut ticker = ticker(session.policy().monitor_interval);

   while session.stop().run(ticker.tick()).await.is_ok() {
      if session.is_connected().await {
         continue;
      }
      warn!("Monitor: device not connected");
      supervisor.ensure_connected(ReconnectTrigger::Monitor).await;
   }
   info!("Monitor loop stopped");
}
