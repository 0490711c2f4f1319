//! Fakes shared by the pipeline tests.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::{
    dao::{
        lobby_store::{LobbyStore, NotificationUpdater, RatingUpdater, memory::MemoryLobbyStore},
        models::{MatchEntity, NewMatch, NewUser, SeatEntity, UserEntity, UserMatch},
        storage::{StorageError, StorageResult},
    },
    engine::{
        CreateGameRequest, CreatedGame, CreatedPlayer, EngineError, EngineResult, GameDescription,
        GameEngine,
    },
    push::{Notification, PushError, PushNotifier, PushResult},
};

/// In-process engine whose answers are set by the test.
#[derive(Default)]
pub struct FakeEngine {
    waiting: Mutex<HashMap<String, Vec<String>>>,
    spectator: Mutex<HashMap<String, Value>>,
    failing: AtomicBool,
    lookup_delay: Mutex<Option<Duration>>,
    pub lookups: AtomicUsize,
    created: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Colors awaited in the match containing `seats`.
    pub fn set_waiting(&self, seats: &[&str], colors: &[&str]) {
        let colors = colors.iter().map(|color| color.to_string()).collect::<Vec<_>>();
        let mut waiting = self.waiting.lock().unwrap();
        for seat in seats {
            waiting.insert(seat.to_string(), colors.clone());
        }
    }

    pub fn set_spectator(&self, spectator_id: &str, document: Value) {
        self.spectator
            .lock()
            .unwrap()
            .insert(spectator_id.to_string(), document);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = Some(delay);
    }

    fn unavailable(path: &'static str) -> EngineError {
        EngineError::RequestStatus {
            path,
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl GameEngine for FakeEngine {
    fn create_game(
        &self,
        request: CreateGameRequest,
    ) -> BoxFuture<'static, EngineResult<CreatedGame>> {
        let number = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self.failing.load(Ordering::SeqCst);
        Box::pin(async move {
            if failing {
                return Err(Self::unavailable("game"));
            }
            let players = crate::engine::assign_colors(request.players)
                .into_iter()
                .map(|player| CreatedPlayer {
                    id: format!("seat-{}", player.name),
                    name: player.name,
                    color: player.color,
                })
                .collect();
            Ok(CreatedGame {
                id: format!("game-{number}"),
                spectator_id: format!("spectator-{number}"),
                players,
                purge_date: OffsetDateTime::now_utc() + Duration::from_secs(7 * 24 * 3600),
            })
        })
    }

    fn describe_game(
        &self,
        spectator_id: String,
    ) -> BoxFuture<'static, EngineResult<GameDescription>> {
        let failing = self.failing.load(Ordering::SeqCst);
        let document = self.spectator.lock().unwrap().get(&spectator_id).cloned();
        Box::pin(async move {
            if failing {
                return Err(Self::unavailable("api/spectator"));
            }
            let document =
                document.unwrap_or_else(|| json!({"game": {"phase": "action"}, "players": []}));
            GameDescription::from_raw(document)
        })
    }

    fn awaiting_colors(&self, seat_id: String) -> BoxFuture<'static, EngineResult<Vec<String>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing.load(Ordering::SeqCst);
        let colors = self
            .waiting
            .lock()
            .unwrap()
            .get(&seat_id)
            .cloned()
            .unwrap_or_default();
        let delay = *self.lookup_delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if failing {
                return Err(Self::unavailable("api/waitingfor"));
            }
            Ok(colors)
        })
    }

    fn player_url(&self, seat_id: &str) -> String {
        format!("https://play.test/player?id={seat_id}")
    }
}

/// Scripted answer of the [`RecordingNotifier`].
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Accept,
    BadToken,
    Fail,
}

/// Push notifier recording every attempt.
#[derive(Default)]
pub struct RecordingNotifier {
    pub attempts: Mutex<Vec<(Vec<u8>, Notification)>>,
    script: Mutex<VecDeque<Reply>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue replies; once drained every send is accepted.
    pub fn script(&self, replies: &[Reply]) {
        self.script.lock().unwrap().extend(replies.iter().copied());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn attempts(&self) -> Vec<Notification> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, notification)| notification.clone())
            .collect()
    }
}

impl PushNotifier for RecordingNotifier {
    fn send(
        &self,
        device_token: Vec<u8>,
        notification: Notification,
    ) -> BoxFuture<'static, PushResult<()>> {
        self.attempts
            .lock()
            .unwrap()
            .push((device_token, notification));
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Accept);
        let delay = *self.delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Accept => Ok(()),
                Reply::BadToken => Err(PushError::BadDeviceToken),
                Reply::Fail => Err(PushError::Rejected {
                    status: 500,
                    reason: "InternalServerError".into(),
                }),
            }
        })
    }
}

/// Register users and a match where `users[n]` sits on seat `{match_id}-{user}` with `colors[n]`.
pub async fn seed_match(
    store: &MemoryLobbyStore,
    match_id: &str,
    users: &[&str],
    colors: &[&str],
) -> Vec<SeatEntity> {
    for user in users {
        store
            .upsert_user(NewUser {
                id: user.to_string(),
                nickname: user.to_string(),
                color: String::new(),
            })
            .await
            .unwrap();
    }
    let seats = users
        .iter()
        .zip(colors)
        .map(|(user, color)| SeatEntity {
            user_id: user.to_string(),
            seat_id: format!("{match_id}-{user}"),
            color: color.to_string(),
        })
        .collect::<Vec<_>>();
    store
        .create_match(NewMatch {
            id: match_id.to_string(),
            spectator_id: format!("spectator-{match_id}"),
            expires_at: OffsetDateTime::now_utc() + Duration::from_secs(3600),
            seats: seats.clone(),
        })
        .await
        .unwrap();
    seats
}

/// Store whose backend is down: every call fails as unavailable.
#[derive(Default)]
pub struct FailingStore {
    pub calls: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail<T: Send + 'static>(&self) -> BoxFuture<'static, StorageResult<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {
            Err(StorageError::unavailable(
                "backend down".into(),
                io::Error::other("connection refused"),
            ))
        })
    }
}

impl LobbyStore for FailingStore {
    fn upsert_user(&self, _user: NewUser) -> BoxFuture<'static, StorageResult<()>> {
        self.fail()
    }

    fn update_device_token(
        &self,
        _user_id: String,
        _device_token: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.fail()
    }

    fn find_user(&self, _user_id: String) -> BoxFuture<'static, StorageResult<UserEntity>> {
        self.fail()
    }

    fn create_match(&self, _game: NewMatch) -> BoxFuture<'static, StorageResult<()>> {
        self.fail()
    }

    fn list_active_users(
        &self,
        _activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        self.fail()
    }

    fn list_user_matches(
        &self,
        _user_id: String,
        _activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<UserMatch>>> {
        self.fail()
    }

    fn list_unfinished_matches(&self) -> BoxFuture<'static, StorageResult<Vec<MatchEntity>>> {
        self.fail()
    }

    fn find_match_by_seat(
        &self,
        _seat_id: String,
    ) -> BoxFuture<'static, StorageResult<MatchEntity>> {
        self.fail()
    }

    fn record_match_results(
        &self,
        _match_id: String,
        _results: Value,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.fail()
    }

    fn update_notification_state(
        &self,
        _user_id: String,
        _updater: NotificationUpdater,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.fail()
    }

    fn rate_oldest_finished(
        &self,
        _updater: RatingUpdater,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.fail()
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.fail()
    }
}

/// Let a loop started with a short period tick a few times.
pub async fn wait_for_calls(calls: &AtomicUsize, at_least: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while calls.load(Ordering::SeqCst) < at_least {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
