//! In-process [`LobbyStore`] with the same locking semantics as the SQL backend.
//!
//! Every user row sits behind its own async mutex, which plays the role of
//! `SELECT ... FOR UPDATE`. Rating claims are serialised by a dedicated mutex.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::future::BoxFuture;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::dao::{
    lobby_store::{Decision, LobbyStore, NotificationUpdater, RatingUpdater},
    models::{
        DEFAULT_RATING, DeviceTokenEnv, MatchEntity, NewMatch, NewUser, NotificationState,
        RatedUser, RatingUpdateState, SentNotification, UserEntity, UserMatch,
    },
    storage::{StorageError, StorageResult},
};

/// Source of "now" for expiry and activity-window checks.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

struct UserRow {
    user: UserEntity,
    sent: SentNotification,
}

struct Inner {
    users: DashMap<String, Arc<Mutex<UserRow>>>,
    matches: RwLock<Vec<MatchEntity>>,
    rating_claim: Mutex<()>,
    clock: Clock,
}

/// Volatile store used by tests and by the `memory` storage backend.
#[derive(Clone)]
pub struct MemoryLobbyStore {
    inner: Arc<Inner>,
}

impl Default for MemoryLobbyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLobbyStore {
    /// Empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(OffsetDateTime::now_utc))
    }

    /// Empty store driven by a caller-provided clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                users: DashMap::new(),
                matches: RwLock::new(Vec::new()),
                rating_claim: Mutex::new(()),
                clock,
            }),
        }
    }

    fn now(&self) -> OffsetDateTime {
        (self.inner.clock)()
    }

    fn user_row(&self, user_id: &str) -> StorageResult<Arc<Mutex<UserRow>>> {
        self.inner
            .users
            .get(user_id)
            .map(|row| Arc::clone(row.value()))
            .ok_or_else(|| StorageError::not_found("user", user_id))
    }

    /// Current notification row of a user, read under its lock.
    pub async fn notification_state(&self, user_id: &str) -> StorageResult<NotificationState> {
        let row = self.user_row(user_id)?;
        let guard = row.lock().await;
        Ok(NotificationState {
            device_token: guard.user.device_token.clone(),
            device_token_env: guard.user.device_token_env,
            sent: guard.sent,
        })
    }

    /// Match lookup by id.
    pub async fn find_match(&self, match_id: &str) -> StorageResult<MatchEntity> {
        let matches = self.inner.matches.read().await;
        matches
            .iter()
            .find(|game| game.id == match_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("match", match_id))
    }
}

fn is_active(game: &MatchEntity, now: OffsetDateTime, activity_window: Duration) -> bool {
    game.expires_at > now
        && game
            .finished_at
            .is_none_or(|finished_at| finished_at > now - activity_window)
}

impl LobbyStore for MemoryLobbyStore {
    fn upsert_user(&self, user: NewUser) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let created_at = store.now();
            store.inner.users.entry(user.id.clone()).or_insert_with(|| {
                Arc::new(Mutex::new(UserRow {
                    user: UserEntity {
                        id: user.id,
                        nickname: user.nickname,
                        color: user.color,
                        created_at,
                        device_token: Vec::new(),
                        device_token_env: DeviceTokenEnv::default(),
                        rating: DEFAULT_RATING,
                    },
                    sent: SentNotification::default(),
                }))
            });
            Ok(())
        })
    }

    fn update_device_token(
        &self,
        user_id: String,
        device_token: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let row = store.user_row(&user_id)?;
            row.lock().await.user.device_token = device_token;
            Ok(())
        })
    }

    fn find_user(&self, user_id: String) -> BoxFuture<'static, StorageResult<UserEntity>> {
        let store = self.clone();
        Box::pin(async move {
            let row = store.user_row(&user_id)?;
            let guard = row.lock().await;
            Ok(guard.user.clone())
        })
    }

    fn create_match(&self, game: NewMatch) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            for seat in &game.seats {
                store.user_row(&seat.user_id)?;
            }

            let mut matches = store.inner.matches.write().await;
            if matches.iter().any(|existing| existing.id == game.id) {
                return Err(StorageError::AlreadyWritten {
                    entity: "match",
                    key: game.id,
                });
            }
            matches.push(MatchEntity {
                id: game.id,
                spectator_id: game.spectator_id,
                created_at: store.now(),
                expires_at: game.expires_at,
                finished_at: None,
                results: None,
                rating_results: None,
                seats: game.seats,
            });
            Ok(())
        })
    }

    fn list_active_users(
        &self,
        activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let store = self.clone();
        Box::pin(async move {
            let now = store.now();
            let matches = store.inner.matches.read().await;
            let users = matches
                .iter()
                .filter(|game| is_active(game, now, activity_window))
                .flat_map(|game| game.seats.iter().map(|seat| seat.user_id.clone()))
                .collect::<BTreeSet<_>>();
            Ok(users.into_iter().collect())
        })
    }

    fn list_user_matches(
        &self,
        user_id: String,
        activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<UserMatch>>> {
        let store = self.clone();
        Box::pin(async move {
            let now = store.now();
            let matches = store.inner.matches.read().await;
            let mut result = matches
                .iter()
                .filter(|game| is_active(game, now, activity_window))
                .filter_map(|game| {
                    game.seat_of(&user_id).map(|seat| UserMatch {
                        seat: seat.clone(),
                        game: game.clone(),
                    })
                })
                .collect::<Vec<_>>();
            result.sort_by_key(|entry| entry.game.created_at);
            Ok(result)
        })
    }

    fn list_unfinished_matches(&self) -> BoxFuture<'static, StorageResult<Vec<MatchEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let now = store.now();
            let matches = store.inner.matches.read().await;
            Ok(matches
                .iter()
                .filter(|game| game.expires_at > now && game.finished_at.is_none())
                .cloned()
                .collect())
        })
    }

    fn find_match_by_seat(
        &self,
        seat_id: String,
    ) -> BoxFuture<'static, StorageResult<MatchEntity>> {
        let store = self.clone();
        Box::pin(async move {
            let matches = store.inner.matches.read().await;
            matches
                .iter()
                .find(|game| game.seats.iter().any(|seat| seat.seat_id == seat_id))
                .cloned()
                .ok_or_else(|| StorageError::not_found("seat", seat_id))
        })
    }

    fn record_match_results(
        &self,
        match_id: String,
        results: serde_json::Value,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let now = store.now();
            let mut matches = store.inner.matches.write().await;
            let game = matches
                .iter_mut()
                .find(|game| game.id == match_id)
                .ok_or_else(|| StorageError::not_found("match", match_id.clone()))?;
            if game.finished_at.is_some() {
                return Err(StorageError::AlreadyWritten {
                    entity: "match results",
                    key: match_id,
                });
            }
            game.finished_at = Some(now);
            game.results = Some(results);
            Ok(())
        })
    }

    fn update_notification_state(
        &self,
        user_id: String,
        updater: NotificationUpdater,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let row = store.user_row(&user_id)?;
            let mut guard = row.lock().await;
            let state = NotificationState {
                device_token: guard.user.device_token.clone(),
                device_token_env: guard.user.device_token_env,
                sent: guard.sent,
            };

            match updater(state).await {
                Decision::Keep => Ok(()),
                Decision::Commit(next) => {
                    guard.user.device_token = next.device_token;
                    guard.user.device_token_env = next.device_token_env;
                    guard.sent = next.sent;
                    Ok(())
                }
                Decision::Abort(err) => Err(StorageError::Aborted(err)),
            }
        })
    }

    fn rate_oldest_finished(
        &self,
        updater: RatingUpdater,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let store = self.clone();
        Box::pin(async move {
            let _claim = store.inner.rating_claim.lock().await;

            let game = {
                let matches = store.inner.matches.read().await;
                matches
                    .iter()
                    .filter(|game| game.finished_at.is_some() && game.rating_results.is_none())
                    .min_by_key(|game| game.finished_at)
                    .cloned()
            };
            let Some(game) = game else {
                return Ok(None);
            };

            // Lock seat owners in id order so concurrent claims cannot deadlock.
            let user_ids = game
                .seats
                .iter()
                .map(|seat| seat.user_id.clone())
                .collect::<BTreeSet<_>>();
            let mut guards: Vec<(String, OwnedMutexGuard<UserRow>)> = Vec::new();
            for user_id in user_ids {
                let row = store.user_row(&user_id)?;
                guards.push((user_id, row.lock_owned().await));
            }

            let mut users: Vec<RatedUser> = Vec::new();
            for seat in &game.seats {
                if users.iter().any(|user| user.user_id == seat.user_id) {
                    continue;
                }
                if let Some((_, guard)) = guards.iter().find(|(id, _)| *id == seat.user_id) {
                    users.push(RatedUser {
                        user_id: seat.user_id.clone(),
                        rating: guard.user.rating,
                    });
                }
            }

            let state = RatingUpdateState {
                game: game.clone(),
                users,
            };
            let results = updater(&state).map_err(StorageError::Aborted)?;
            let changes = results.user_changes();

            let mut matches = store.inner.matches.write().await;
            let entry = matches
                .iter_mut()
                .find(|entry| entry.id == game.id)
                .ok_or_else(|| StorageError::not_found("match", game.id.clone()))?;
            if entry.rating_results.is_some() {
                return Err(StorageError::AlreadyWritten {
                    entity: "rating results",
                    key: game.id,
                });
            }

            // Check every predicate before touching anything so a conflict leaves no trace.
            for (user_id, old_rating, _) in &changes {
                let current = guards
                    .iter()
                    .find(|(id, _)| id == user_id)
                    .map(|(_, guard)| guard.user.rating);
                if current != Some(*old_rating) {
                    return Err(StorageError::RatingConflict {
                        user_id: user_id.clone(),
                        expected: *old_rating,
                    });
                }
            }

            for (user_id, _, new_rating) in changes {
                if let Some((_, guard)) = guards.iter_mut().find(|(id, _)| *id == user_id) {
                    guard.user.rating = new_rating;
                }
            }
            entry.rating_results = Some(results);
            Ok(Some(game.id))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
