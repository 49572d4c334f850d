//! Outward command path.
//!
//! A failed write is taken as proof that the link is stale, whatever the
//! connected flag says. The dispatcher then forces a reconnect before the
//! next attempt.

use std::rc::Rc;

use log::{debug, error, info, warn};

use crate::{
   bluetooth::{
      supervisor::{ReconnectSupervisor, ReconnectTrigger},
      transport::Transport,
   },
   error::PavlokError,
   pavlok::protocol::CommandRequest,
};

pub struct CommandDispatcher<T: Transport> {
   supervisor: Rc<ReconnectSupervisor<T>>,
}

impl<T: Transport> CommandDispatcher<T> {
   pub const fn new(supervisor: Rc<ReconnectSupervisor<T>>) -> Self {
      Self { supervisor }
   }

   pub async fn write_with_retry(&self, request: &CommandRequest) -> bool {
      let label = request.label;
      if !self.supervisor.ensure_connected(ReconnectTrigger::Ensure).await {
         warn!("{label} dropped: device not connected");
         return false;
      }

      let session = self.supervisor.session();
      let retries = session.policy().write_retries.max(1);
      for attempt in 1..=retries {
         if session.stop().is_stopped() {
            return false;
         }

         match session.write(request).await {
            Ok(()) => {
               match request.intensity() {
                  Some(intensity) => info!("{label} sent (intensity={intensity})"),
                  None => debug!("{label} sent"),
               }
               return true;
            },
            Err(PavlokError::ShutdownRequested) => return false,
            Err(e) => {
               warn!(
                  "{label} write to {} failed (attempt {attempt}/{retries}): {e}",
                  request.characteristic
               );
               if attempt < retries
                  && !self
                     .supervisor
                     .force_reconnect(ReconnectTrigger::WriteRetry)
                     .await
               {
                  break;
               }
            },
         }
      }

      error!("{label} failed after {retries} write attempts");
      // Leave a clean disconnected session for the next caller or monitor tick.
      self.supervisor.discard_link().await;
      false
   }
}
