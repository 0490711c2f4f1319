/// Process-local backend.
pub mod memory;
/// PostgreSQL backend.
#[cfg(feature = "postgres-store")]
pub mod postgres;

use std::time::Duration;

use futures::future::BoxFuture;

use crate::dao::models::{
    MatchEntity, NewMatch, NewUser, NotificationState, RatingResults, RatingUpdateState,
    UserEntity, UserMatch,
};
use crate::dao::storage::{BoxError, StorageResult};

/// What a locked read-modify-write callback wants done with the row it was handed.
#[derive(Debug)]
pub enum Decision<T> {
    /// Release the lock without writing anything.
    Keep,
    /// Persist the value atomically with the lock release.
    Commit(T),
    /// Roll the transaction back and surface the error to the caller.
    Abort(BoxError),
}

/// Callback run while the user's notification row is exclusively locked.
pub type NotificationUpdater =
    Box<dyn FnOnce(NotificationState) -> BoxFuture<'static, Decision<NotificationState>> + Send>;

/// Callback computing rating adjustments for a claimed match.
pub type RatingUpdater =
    Box<dyn FnOnce(&RatingUpdateState) -> Result<RatingResults, BoxError> + Send>;

/// Abstraction over the persistence layer for users, matches and pipeline bookkeeping.
pub trait LobbyStore: Send + Sync {
    /// Create a user on first login; existing rows are left untouched.
    fn upsert_user(&self, user: NewUser) -> BoxFuture<'static, StorageResult<()>>;
    /// Register or replace the push token of a user.
    fn update_device_token(
        &self,
        user_id: String,
        device_token: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Load a user row with its push bookkeeping.
    fn find_user(&self, user_id: String) -> BoxFuture<'static, StorageResult<UserEntity>>;
    /// Insert a match together with its ordered seats.
    fn create_match(&self, game: NewMatch) -> BoxFuture<'static, StorageResult<()>>;
    /// Distinct users seated in an unexpired match that is unfinished or
    /// finished within `activity_window`.
    fn list_active_users(
        &self,
        activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<String>>>;
    /// Active matches of one user, each paired with that user's seat.
    fn list_user_matches(
        &self,
        user_id: String,
        activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<UserMatch>>>;
    /// Unexpired matches the engine has not reported as finished yet.
    fn list_unfinished_matches(&self) -> BoxFuture<'static, StorageResult<Vec<MatchEntity>>>;
    /// Match owning `seat_id`, with all of its seats.
    fn find_match_by_seat(&self, seat_id: String) -> BoxFuture<'static, StorageResult<MatchEntity>>;
    /// Mark a match finished and keep the raw engine snapshot. Write-once.
    fn record_match_results(
        &self,
        match_id: String,
        results: serde_json::Value,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Lock the user's notification row, hand it to `updater` and apply its [`Decision`].
    fn update_notification_state(
        &self,
        user_id: String,
        updater: NotificationUpdater,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Claim the oldest finished and unrated match, rate it with `updater` and
    /// commit the snapshot and ratings. `None` when nothing is waiting.
    fn rate_oldest_finished(
        &self,
        updater: RatingUpdater,
    ) -> BoxFuture<'static, StorageResult<Option<String>>>;
    /// Cheap round-trip proving the backend is reachable.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
