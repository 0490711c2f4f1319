//! Fast path notifying players right after a move is submitted.
//!
//! The awaiting-input colors are read before the move is forwarded and again
//! from a detached task once the engine answered. Seats whose color changed
//! state are handed to the notification queue without waiting for the next
//! activity scan.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    dao::lobby_store::LobbyStore,
    engine::GameEngine,
    error::ServiceError,
    services::notification_service::NotificationQueue,
};

/// Timeouts of the watcher.
#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    /// Bound on the lookup made before the move is forwarded.
    pub lookup_timeout: Duration,
    /// Bound on the whole detached follow-up.
    pub follow_up_timeout: Duration,
}

/// State captured before a move is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTicket {
    /// Seat that submitted the move.
    pub seat_id: String,
    /// Colors awaiting input before the move.
    pub before: Vec<String>,
}

/// Colors present in exactly one of the two sets.
pub fn symmetric_difference(before: &[String], after: &[String]) -> BTreeSet<String> {
    let before = before.iter().cloned().collect::<BTreeSet<_>>();
    let after = after.iter().cloned().collect::<BTreeSet<_>>();
    before.symmetric_difference(&after).cloned().collect()
}

/// Turn-state watcher shared by the move middleware.
pub struct TurnWatcher {
    store: Arc<dyn LobbyStore>,
    engine: Arc<dyn GameEngine>,
    queue: NotificationQueue,
    settings: WatcherSettings,
    shutdown: CancellationToken,
}

impl TurnWatcher {
    /// `shutdown` cancels pending enqueues of detached follow-ups.
    pub fn new(
        store: Arc<dyn LobbyStore>,
        engine: Arc<dyn GameEngine>,
        queue: NotificationQueue,
        settings: WatcherSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            engine,
            queue,
            settings,
            shutdown,
        }
    }

    /// Read the awaiting colors of the seat's match. Failures only disable the fast path.
    pub async fn prepare(&self, seat_id: &str) -> Option<WatchTicket> {
        let lookup = self.engine.awaiting_colors(seat_id.to_owned());
        match timeout(self.settings.lookup_timeout, lookup).await {
            Ok(Ok(before)) => Some(WatchTicket {
                seat_id: seat_id.to_owned(),
                before,
            }),
            Ok(Err(err)) => {
                warn!(seat_id, error = %err, "failed to read turn state before move");
                None
            }
            Err(_) => {
                warn!(seat_id, "timed out reading turn state before move");
                None
            }
        }
    }

    /// Spawn the follow-up for `ticket`, detached from the request that produced it.
    pub fn follow_up(self: &Arc<Self>, ticket: WatchTicket) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            let seat_id = ticket.seat_id.clone();
            match timeout(watcher.settings.follow_up_timeout, watcher.settle(ticket)).await {
                Ok(Ok(notified)) => {
                    debug!(seat_id = %seat_id, notified, "turn state follow-up done")
                }
                Ok(Err(err)) => {
                    warn!(seat_id = %seat_id, error = %err, "turn state follow-up failed")
                }
                Err(_) => warn!(seat_id = %seat_id, "turn state follow-up timed out"),
            }
        })
    }

    /// Compare the current awaiting colors with the ticket and enqueue every affected user.
    ///
    /// Returns how many users were enqueued.
    pub async fn settle(&self, ticket: WatchTicket) -> Result<usize, ServiceError> {
        let after = self.engine.awaiting_colors(ticket.seat_id.clone()).await?;
        let changed = symmetric_difference(&ticket.before, &after);
        if changed.is_empty() {
            return Ok(0);
        }

        let game = self.store.find_match_by_seat(ticket.seat_id).await?;
        let mut users: Vec<String> = Vec::new();
        for seat in game.seats.iter().filter(|seat| changed.contains(&seat.color)) {
            if !users.contains(&seat.user_id) {
                users.push(seat.user_id.clone());
            }
        }

        for user_id in &users {
            self.queue
                .notify_user(user_id.clone(), &self.shutdown)
                .await?;
        }
        Ok(users.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::lobby_store::memory::MemoryLobbyStore,
        test_support::{FakeEngine, seed_match},
    };

    fn colors(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn watcher(
        store: &MemoryLobbyStore,
        engine: &Arc<FakeEngine>,
        queue: NotificationQueue,
        follow_up_timeout: Duration,
    ) -> Arc<TurnWatcher> {
        Arc::new(TurnWatcher::new(
            Arc::new(store.clone()),
            engine.clone(),
            queue,
            WatcherSettings {
                lookup_timeout: Duration::from_millis(50),
                follow_up_timeout,
            },
            CancellationToken::new(),
        ))
    }

    #[test]
    fn symmetric_difference_keeps_colors_that_changed() {
        let diff = symmetric_difference(&colors(&["red", "blue"]), &colors(&["blue", "green"]));
        assert_eq!(diff.into_iter().collect::<Vec<_>>(), colors(&["green", "red"]));
        assert!(symmetric_difference(&colors(&["red"]), &colors(&["red"])).is_empty());
    }

    #[tokio::test]
    async fn settle_enqueues_users_whose_turn_state_changed() {
        let store = MemoryLobbyStore::new();
        let engine = FakeEngine::new();
        let seats = ["g1-ann", "g1-bob", "g1-cyd"];
        seed_match(&store, "g1", &["ann", "bob", "cyd"], &["red", "blue", "green"]).await;
        let (queue, mut receiver) = NotificationQueue::channel(8);
        let watcher = watcher(&store, &engine, queue, Duration::from_secs(1));

        engine.set_waiting(&seats, &["red", "green"]);
        let ticket = watcher.prepare("g1-ann").await.unwrap();
        engine.set_waiting(&seats, &["blue", "green"]);

        assert_eq!(watcher.settle(ticket).await.unwrap(), 2);
        assert_eq!(receiver.try_recv().unwrap(), "ann");
        assert_eq!(receiver.try_recv().unwrap(), "bob");
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_turn_state_enqueues_nobody() {
        let store = MemoryLobbyStore::new();
        let engine = FakeEngine::new();
        seed_match(&store, "g1", &["ann", "bob"], &["red", "blue"]).await;
        engine.set_waiting(&["g1-ann", "g1-bob"], &["red"]);
        let (queue, mut receiver) = NotificationQueue::channel(8);
        let watcher = watcher(&store, &engine, queue, Duration::from_secs(1));

        let ticket = watcher.prepare("g1-ann").await.unwrap();
        assert_eq!(watcher.settle(ticket).await.unwrap(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_lookup_disables_the_fast_path() {
        let store = MemoryLobbyStore::new();
        let engine = FakeEngine::new();
        let (queue, _receiver) = NotificationQueue::channel(1);
        let watcher = watcher(&store, &engine, queue, Duration::from_secs(1));

        engine.set_failing(true);
        assert!(watcher.prepare("g1-ann").await.is_none());

        engine.set_failing(false);
        engine.set_lookup_delay(Duration::from_millis(200));
        assert!(watcher.prepare("g1-ann").await.is_none());
    }

    #[tokio::test]
    async fn follow_up_gives_up_after_its_timeout() {
        let store = MemoryLobbyStore::new();
        let engine = FakeEngine::new();
        seed_match(&store, "g1", &["ann", "bob"], &["red", "blue"]).await;
        engine.set_waiting(&["g1-ann", "g1-bob"], &["blue"]);
        let (queue, mut receiver) = NotificationQueue::channel(8);
        let watcher = watcher(&store, &engine, queue, Duration::from_millis(20));

        engine.set_lookup_delay(Duration::from_secs(5));
        let ticket = WatchTicket {
            seat_id: "g1-ann".into(),
            before: colors(&["red"]),
        };
        tokio::time::timeout(Duration::from_secs(1), watcher.follow_up(ticket))
            .await
            .unwrap()
            .unwrap();
        assert!(receiver.try_recv().is_err());
    }
}
