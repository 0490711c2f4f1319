use std::collections::HashMap;

use sqlx::{FromRow, types::Json};
use time::OffsetDateTime;

use crate::dao::{
    models::{
        DeviceTokenEnv, MatchEntity, NotificationState, RatingResults, SeatEntity,
        SentNotification, UserEntity,
    },
    storage::{StorageError, StorageResult},
};

#[derive(Debug, FromRow)]
pub(super) struct UserRow {
    pub id: String,
    pub nickname: String,
    pub color: String,
    pub created_at: OffsetDateTime,
    pub device_token: Vec<u8>,
    pub device_token_env: String,
    pub rating: i64,
}

impl TryFrom<UserRow> for UserEntity {
    type Error = StorageError;

    fn try_from(row: UserRow) -> StorageResult<Self> {
        Ok(UserEntity {
            device_token_env: parse_env(&row.device_token_env)?,
            id: row.id,
            nickname: row.nickname,
            color: row.color,
            created_at: row.created_at,
            device_token: row.device_token,
            rating: row.rating,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct NotificationRow {
    pub device_token: Vec<u8>,
    pub device_token_env: String,
    pub sent_notification: Option<Json<SentNotification>>,
}

impl TryFrom<NotificationRow> for NotificationState {
    type Error = StorageError;

    fn try_from(row: NotificationRow) -> StorageResult<Self> {
        Ok(NotificationState {
            device_token_env: parse_env(&row.device_token_env)?,
            device_token: row.device_token,
            sent: row.sent_notification.map(|json| json.0).unwrap_or_default(),
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct MatchRow {
    pub id: String,
    pub spectator_id: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub results: Option<Json<serde_json::Value>>,
    pub rating_results: Option<Json<RatingResults>>,
}

impl MatchRow {
    pub fn into_entity(self, seats: Vec<SeatEntity>) -> MatchEntity {
        MatchEntity {
            id: self.id,
            spectator_id: self.spectator_id,
            created_at: self.created_at,
            expires_at: self.expires_at,
            finished_at: self.finished_at,
            results: self.results.map(|json| json.0),
            rating_results: self.rating_results.map(|json| json.0),
            seats,
        }
    }
}

#[derive(Debug, FromRow)]
pub(super) struct SeatRow {
    pub match_id: String,
    pub user_id: String,
    pub seat_id: String,
    pub color: String,
}

/// Attach seats (already ordered by seat index) to their matches, keeping match order.
pub(super) fn assemble_matches(rows: Vec<MatchRow>, seats: Vec<SeatRow>) -> Vec<MatchEntity> {
    let mut by_match: HashMap<String, Vec<SeatEntity>> = HashMap::new();
    for seat in seats {
        by_match.entry(seat.match_id).or_default().push(SeatEntity {
            user_id: seat.user_id,
            seat_id: seat.seat_id,
            color: seat.color,
        });
    }
    rows.into_iter()
        .map(|row| {
            let seats = by_match.remove(&row.id).unwrap_or_default();
            row.into_entity(seats)
        })
        .collect()
}

fn parse_env(value: &str) -> StorageResult<DeviceTokenEnv> {
    value.parse().map_err(StorageError::Corrupt)
}
