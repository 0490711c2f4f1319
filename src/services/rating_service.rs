//! Pairwise Elo adjustments for finished matches.
//!
//! Every unordered pair of seats is compared in the order the engine lists
//! them. Deltas are computed against the ratings read when the match was
//! claimed and summed per seat, so a match never changes the total rating.

use std::{cmp::Ordering, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{Mutex, oneshot},
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dao::{
        lobby_store::{LobbyStore, RatingUpdater},
        models::{RatingPair, RatingPlayer, RatingResults, RatingUpdateState},
        storage::BoxError,
    },
    engine::{EngineError, GameDescription, SeatResult},
    error::ServiceError,
};

/// Maximum rating movement of a single pair.
pub const K_FACTOR: f64 = 20.0;
/// Rating gap at which the stronger side is expected to score ten times more.
pub const RATING_SCALE: f64 = 480.0;

/// Reasons a claimed match cannot be rated.
#[derive(Debug, Error)]
pub enum RatingError {
    /// The match was claimed without a results snapshot.
    #[error("match `{match_id}` has no stored results")]
    MissingResults {
        /// Claimed match.
        match_id: String,
    },
    /// The snapshot is not a spectator document.
    #[error("stored results cannot be parsed")]
    InvalidResults {
        /// Parsing failure.
        #[source]
        source: EngineError,
    },
    /// Fewer than two standings could be read.
    #[error("match `{match_id}` lists {seats} seat(s), at least two are needed")]
    TooFewSeats {
        /// Claimed match.
        match_id: String,
        /// Number of standings found.
        seats: usize,
    },
    /// A standing names a seat the lobby does not know.
    #[error("seat `{seat_id}` has no owner in the match")]
    UnknownSeat {
        /// Seat from the snapshot.
        seat_id: String,
    },
}

/// Rate the claimed match described by `state`.
pub fn compute_ratings(state: &RatingUpdateState) -> Result<RatingResults, RatingError> {
    let raw = state
        .game
        .results
        .clone()
        .ok_or_else(|| RatingError::MissingResults {
            match_id: state.game.id.clone(),
        })?;
    let standings = GameDescription::from_raw(raw)
        .map_err(|source| RatingError::InvalidResults { source })?
        .seats;
    if standings.len() < 2 {
        return Err(RatingError::TooFewSeats {
            match_id: state.game.id.clone(),
            seats: standings.len(),
        });
    }

    let mut players = standings
        .iter()
        .map(|standing| seat_owner(state, &standing.seat_id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut pairs = Vec::with_capacity(players.len() * (players.len() - 1) / 2);
    for left in 0..players.len() {
        for right in left + 1..players.len() {
            let left_score = left_score(&standings[left], &standings[right]);
            let left_rating = players[left].old_rating;
            let right_rating = players[right].old_rating;
            let left_delta = rating_delta(left_rating, right_rating, left_score);

            pairs.push(RatingPair {
                left_seat_id: players[left].seat_id.clone(),
                right_seat_id: players[right].seat_id.clone(),
                left_rating,
                right_rating,
                left_delta,
                left_score,
            });
            players[left].new_rating += left_delta;
            players[right].new_rating -= left_delta;
        }
    }

    Ok(RatingResults { pairs, players })
}

fn seat_owner(state: &RatingUpdateState, seat_id: &str) -> Result<RatingPlayer, RatingError> {
    let unknown = || RatingError::UnknownSeat {
        seat_id: seat_id.to_owned(),
    };
    let seat = state
        .game
        .seats
        .iter()
        .find(|seat| seat.seat_id == seat_id)
        .ok_or_else(unknown)?;
    let user = state
        .users
        .iter()
        .find(|user| user.user_id == seat.user_id)
        .ok_or_else(unknown)?;
    Ok(RatingPlayer {
        user_id: user.user_id.clone(),
        seat_id: seat.seat_id.clone(),
        old_rating: user.rating,
        new_rating: user.rating,
    })
}

/// 1.0 when `left` finished ahead, 0.0 when behind, 0.5 on a full tie.
fn left_score(left: &SeatResult, right: &SeatResult) -> f64 {
    match (left.score, left.tiebreaker).cmp(&(right.score, right.tiebreaker)) {
        Ordering::Greater => 1.0,
        Ordering::Less => 0.0,
        Ordering::Equal => 0.5,
    }
}

/// Rating moved from right to left, rounded towards positive infinity.
pub fn rating_delta(left_rating: i64, right_rating: i64, left_score: f64) -> i64 {
    let power = (right_rating - left_rating) as f64 / RATING_SCALE;
    let expected = 1.0 / (1.0 + 10f64.powf(power));
    (K_FACTOR * (left_score - expected)).ceil() as i64
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StuckMatch {
    match_id: String,
    attempts: u32,
}

/// Background updater rating one finished match per tick.
pub struct RatingService {
    store: Arc<dyn LobbyStore>,
    stuck: Mutex<Option<StuckMatch>>,
}

impl RatingService {
    /// Updater over `store` with an empty stuck-match counter.
    pub fn new(store: Arc<dyn LobbyStore>) -> Self {
        Self {
            store,
            stuck: Mutex::new(None),
        }
    }

    /// Rate the oldest finished and unrated match, if there is one.
    pub async fn rate_next(&self) -> Result<Option<String>, ServiceError> {
        let (claimed_tx, claimed) = oneshot::channel();
        let updater: RatingUpdater = Box::new(
            move |state: &RatingUpdateState| -> Result<RatingResults, BoxError> {
                let _ = claimed_tx.send(state.game.id.clone());
                compute_ratings(state).map_err(|err| Box::new(err) as BoxError)
            },
        );

        match self.store.rate_oldest_finished(updater).await {
            Ok(rated) => {
                if let Some(match_id) = &rated {
                    info!(match_id = %match_id, "match rated");
                    self.stuck.lock().await.take();
                }
                Ok(rated)
            }
            Err(err) => {
                if let Ok(match_id) = claimed.await {
                    let attempts = self.record_failure(match_id.clone()).await;
                    warn!(match_id = %match_id, attempts, error = %err, "match cannot be rated");
                }
                Err(err.into())
            }
        }
    }

    async fn record_failure(&self, match_id: String) -> u32 {
        let mut stuck = self.stuck.lock().await;
        match stuck.as_mut() {
            Some(current) if current.match_id == match_id => {
                current.attempts += 1;
                current.attempts
            }
            _ => {
                *stuck = Some(StuckMatch {
                    match_id,
                    attempts: 1,
                });
                1
            }
        }
    }

    /// Match that failed on consecutive ticks, with its attempt count.
    pub async fn stuck_match(&self) -> Option<(String, u32)> {
        self.stuck
            .lock()
            .await
            .as_ref()
            .map(|stuck| (stuck.match_id.clone(), stuck.attempts))
    }

    /// Run [`Self::rate_next`] every `period` until `cancel` fires.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        info!(interval_secs = period.as_secs(), "rating updater started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.rate_next().await {
                        error!(error = %err, "failed to update ratings");
                    }
                }
            }
        }
        info!("rating updater stopped");
    }
}
