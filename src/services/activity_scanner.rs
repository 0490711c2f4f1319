use std::{sync::Arc, time::Duration};

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    dao::lobby_store::LobbyStore,
    services::notification_service::{DispatcherError, NotificationQueue},
};

/// Periodic sweep feeding every active user to the notification queue.
pub struct ActivityScanner {
    store: Arc<dyn LobbyStore>,
    queue: NotificationQueue,
    activity_window: Duration,
}

impl ActivityScanner {
    /// Scanner feeding `queue` with users active within `activity_window`.
    pub fn new(
        store: Arc<dyn LobbyStore>,
        queue: NotificationQueue,
        activity_window: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            activity_window,
        }
    }

    /// List active users once and enqueue each of them.
    ///
    /// Blocks while the queue is full. Returns how many users were enqueued.
    pub async fn scan_once(&self, cancel: &CancellationToken) -> Result<usize, DispatcherError> {
        let users = match self.store.list_active_users(self.activity_window).await {
            Ok(users) => users,
            Err(err) => {
                error!(error = %err, "failed to list active users");
                return Ok(0);
            }
        };

        let count = users.len();
        for user_id in users {
            self.queue.notify_user(user_id, cancel).await?;
        }
        debug!(users = count, "activity scan enqueued users");
        Ok(count)
    }

    /// Run [`Self::scan_once`] every `period` until `cancel` fires.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        info!(interval_secs = period.as_secs(), "activity scanner started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan_once(&cancel).await {
                        Ok(_) | Err(DispatcherError::Cancelled) => {}
                        Err(err) => {
                            error!(error = %err, "activity scanner cannot reach the dispatcher");
                        }
                    }
                }
            }
        }
        info!("activity scanner stopped");
    }
}
