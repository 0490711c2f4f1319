use std::{sync::Arc, time::Duration};

use futures::future::try_join_all;
use time::OffsetDateTime;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    dao::{
        lobby_store::LobbyStore,
        models::{MatchEntity, NewMatch, SeatEntity, UserEntity},
    },
    engine::{CreateGameRequest, GameEngine, GameSettings, NewPlayer},
    error::ServiceError,
};

/// A match seen from one of its players, with the engine's current turn state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserGame {
    /// Engine match identifier.
    pub match_id: String,
    /// The player's own seat.
    pub seat_id: String,
    /// URL the player opens to play.
    pub play_url: String,
    /// Creation time in the lobby.
    pub created_at: OffsetDateTime,
    /// Engine purge date.
    pub expires_at: OffsetDateTime,
    /// Number of seats.
    pub players_count: usize,
    /// Whether the engine currently waits on this player's color.
    pub awaits_input: bool,
}

/// Match lifecycle on top of the store and the engine.
pub struct GameService {
    store: Arc<dyn LobbyStore>,
    engine: Arc<dyn GameEngine>,
    activity_window: Duration,
}

impl GameService {
    /// `activity_window` bounds how long finished matches stay listed.
    pub fn new(
        store: Arc<dyn LobbyStore>,
        engine: Arc<dyn GameEngine>,
        activity_window: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            activity_window,
        }
    }

    /// Create a match for `users` on the engine and persist it with one seat per user.
    ///
    /// Engine players are matched back to users by nickname.
    pub async fn create_game(
        &self,
        users: &[UserEntity],
        settings: GameSettings,
    ) -> Result<MatchEntity, ServiceError> {
        if users.len() < 2 {
            return Err(ServiceError::InvalidInput(
                "a game needs at least two players".into(),
            ));
        }

        let players = users
            .iter()
            .map(|user| NewPlayer {
                name: user.nickname.clone(),
                color: user.color.clone(),
            })
            .collect();
        let created = self
            .engine
            .create_game(CreateGameRequest { players, settings })
            .await?;

        let mut seats = Vec::with_capacity(users.len());
        for user in users {
            let player = created
                .players
                .iter()
                .find(|player| player.name == user.nickname)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("engine player for `{}`", user.nickname))
                })?;
            seats.push(SeatEntity {
                user_id: user.id.clone(),
                seat_id: player.id.clone(),
                color: player.color.clone(),
            });
        }

        let game = NewMatch {
            id: created.id.clone(),
            spectator_id: created.spectator_id.clone(),
            expires_at: created.purge_date,
            seats: seats.clone(),
        };
        self.store.create_match(game).await?;
        info!(game_id = %created.id, players = seats.len(), "game created");

        Ok(MatchEntity {
            id: created.id,
            spectator_id: created.spectator_id,
            created_at: OffsetDateTime::now_utc(),
            expires_at: created.purge_date,
            finished_at: None,
            results: None,
            rating_results: None,
            seats,
        })
    }

    /// Active matches of a user, each annotated with whether it waits on that user.
    ///
    /// The engine is asked about every match concurrently; one failure fails the whole call.
    pub async fn user_games(&self, user_id: &str) -> Result<Vec<UserGame>, ServiceError> {
        let matches = self
            .store
            .list_user_matches(user_id.to_owned(), self.activity_window)
            .await?;

        let lookups = matches.iter().map(|entry| {
            let engine = Arc::clone(&self.engine);
            let seat = entry.seat.clone();
            async move {
                let colors = engine.awaiting_colors(seat.seat_id).await?;
                Ok::<_, ServiceError>(colors.contains(&seat.color))
            }
        });
        let awaiting = try_join_all(lookups).await?;

        Ok(matches
            .into_iter()
            .zip(awaiting)
            .map(|(entry, awaits_input)| UserGame {
                play_url: self.engine.player_url(&entry.seat.seat_id),
                match_id: entry.game.id,
                seat_id: entry.seat.seat_id,
                created_at: entry.game.created_at,
                expires_at: entry.game.expires_at,
                players_count: entry.game.seats.len(),
                awaits_input,
            })
            .collect())
    }

    /// Ask the engine about every unfinished match and store the results of finished ones.
    ///
    /// Returns how many matches were newly recorded as finished.
    pub async fn collect_finished(&self) -> Result<usize, ServiceError> {
        let matches = self.store.list_unfinished_matches().await?;
        let mut recorded = 0;
        for game in matches {
            match self.record_if_finished(&game).await {
                Ok(true) => recorded += 1,
                Ok(false) => {}
                Err(err) => error!(game_id = %game.id, error = %err, "failed to process game"),
            }
        }
        Ok(recorded)
    }

    async fn record_if_finished(&self, game: &MatchEntity) -> Result<bool, ServiceError> {
        let description = self.engine.describe_game(game.spectator_id.clone()).await?;
        if !description.finished {
            return Ok(false);
        }
        self.store
            .record_match_results(game.id.clone(), description.raw)
            .await?;
        info!(game_id = %game.id, "game finished");
        Ok(true)
    }

    /// Run [`Self::collect_finished`] every `period` until `cancel` fires.
    pub async fn run_collector(&self, period: Duration, cancel: CancellationToken) {
        info!(interval_secs = period.as_secs(), "finished game collector started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.collect_finished().await {
                        error!(error = %err, "failed to list unfinished games");
                    }
                }
            }
        }
        info!("finished game collector stopped");
    }
}
