use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Rating assigned to users that never finished a rated match.
pub const DEFAULT_RATING: i64 = 1000;

/// Push credential set a device token is believed to belong to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceTokenEnv {
    /// Development builds, delivered through the sandbox gateway.
    #[serde(rename = "sdbx")]
    Sandbox,
    /// Store builds, delivered through the production gateway.
    #[default]
    #[serde(rename = "prod")]
    Production,
}

impl DeviceTokenEnv {
    /// Stable short code persisted in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceTokenEnv::Sandbox => "sdbx",
            DeviceTokenEnv::Production => "prod",
        }
    }

    /// The other environment, used when the gateway rejects a token.
    pub fn toggled(self) -> Self {
        match self {
            DeviceTokenEnv::Sandbox => DeviceTokenEnv::Production,
            DeviceTokenEnv::Production => DeviceTokenEnv::Sandbox,
        }
    }
}

impl fmt::Display for DeviceTokenEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceTokenEnv {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sdbx" => Ok(DeviceTokenEnv::Sandbox),
            "prod" => Ok(DeviceTokenEnv::Production),
            other => Err(format!("unknown device token environment `{other}`")),
        }
    }
}

/// Registered player of the lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntity {
    /// Identifier issued by the identity provider.
    pub id: String,
    /// Display name, also used to match engine players back to users.
    pub nickname: String,
    /// Preferred seat color.
    pub color: String,
    /// First login time.
    pub created_at: OffsetDateTime,
    /// Opaque push token; empty when the user never registered a device.
    pub device_token: Vec<u8>,
    /// Gateway the device token is currently believed to belong to.
    pub device_token_env: DeviceTokenEnv,
    /// Current skill rating.
    pub rating: i64,
}

/// Payload used to create a user on first login.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Identity provider id.
    pub id: String,
    /// Display name.
    pub nickname: String,
    /// Preferred seat color.
    pub color: String,
}

/// Slot of a match bound to one user and one engine color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatEntity {
    /// Owning user.
    pub user_id: String,
    /// Engine-side player identifier for this seat.
    pub seat_id: String,
    /// Engine color assigned to the seat.
    pub color: String,
}

/// Match persisted by the lobby, with its seats in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEntity {
    /// Engine match identifier.
    pub id: String,
    /// Read-only handle used to describe the match.
    pub spectator_id: String,
    /// Creation time in the lobby.
    pub created_at: OffsetDateTime,
    /// Engine purge date; the match is inactive afterwards.
    pub expires_at: OffsetDateTime,
    /// Set once the engine reports the terminal phase.
    pub finished_at: Option<OffsetDateTime>,
    /// Raw engine snapshot captured when the match finished.
    pub results: Option<serde_json::Value>,
    /// Rating adjustments; non-null means the match is rated.
    pub rating_results: Option<RatingResults>,
    /// Seats in creation order.
    pub seats: Vec<SeatEntity>,
}

impl MatchEntity {
    /// Seat owned by `user_id`, if any.
    pub fn seat_of(&self, user_id: &str) -> Option<&SeatEntity> {
        self.seats.iter().find(|seat| seat.user_id == user_id)
    }
}

/// Payload used to persist a freshly created match.
#[derive(Debug, Clone)]
pub struct NewMatch {
    /// Engine match identifier.
    pub id: String,
    /// Engine spectator handle.
    pub spectator_id: String,
    /// Engine purge date.
    pub expires_at: OffsetDateTime,
    /// Seats in the order the engine listed the players.
    pub seats: Vec<SeatEntity>,
}

/// A match seen from one participant.
#[derive(Debug, Clone)]
pub struct UserMatch {
    /// The match with all of its seats.
    pub game: MatchEntity,
    /// The participant's own seat.
    pub seat: SeatEntity,
}

/// Last notification delivered to a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentNotification {
    /// Number of matches awaiting input when the notification was sent.
    #[serde(rename = "ag")]
    pub active_games: i64,
}

/// Per-user notification bookkeeping, only touched under the user's row lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationState {
    /// Push token; empty means nothing can be delivered.
    pub device_token: Vec<u8>,
    /// Gateway the token is sent to.
    pub device_token_env: DeviceTokenEnv,
    /// Last delivered notification.
    pub sent: SentNotification,
}

/// Seat owner together with the rating read inside the claim transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatedUser {
    /// Seat owner.
    pub user_id: String,
    /// Rating before this match.
    pub rating: i64,
}

/// Snapshot handed to the rating callback.
#[derive(Debug, Clone)]
pub struct RatingUpdateState {
    /// Claimed match, with its results snapshot.
    pub game: MatchEntity,
    /// Distinct seat owners.
    pub users: Vec<RatedUser>,
}

/// Outcome of one pairwise comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingPair {
    /// Seat listed first by the engine.
    pub left_seat_id: String,
    /// Seat listed later by the engine.
    pub right_seat_id: String,
    /// Left owner's rating before the match.
    pub left_rating: i64,
    /// Right owner's rating before the match.
    pub right_rating: i64,
    /// Amount added to left and subtracted from right.
    pub left_delta: i64,
    /// 1.0 win, 0.5 tie, 0.0 loss for the left seat.
    pub left_score: f64,
}

/// Rating movement of one seat owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingPlayer {
    /// Seat owner.
    pub user_id: String,
    /// Seat the movement was computed for.
    pub seat_id: String,
    /// Rating before the match.
    pub old_rating: i64,
    /// Rating after the match.
    pub new_rating: i64,
}

/// Rating-result snapshot persisted on the match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingResults {
    /// Every unordered seat pair, in engine order.
    pub pairs: Vec<RatingPair>,
    /// One entry per seat.
    pub players: Vec<RatingPlayer>,
}

impl RatingResults {
    /// Net rating change per distinct user, in first-seen order.
    pub fn user_changes(&self) -> Vec<(String, i64, i64)> {
        let mut changes: Vec<(String, i64, i64)> = Vec::new();
        for player in &self.players {
            let delta = player.new_rating - player.old_rating;
            match changes.iter_mut().find(|(id, _, _)| *id == player.user_id) {
                Some((_, _, new_rating)) => *new_rating += delta,
                None => {
                    changes.push((player.user_id.clone(), player.old_rating, player.new_rating))
                }
            }
        }
        changes
    }
}
