use std::{collections::BTreeSet, slice, time::Duration};

use futures::future::BoxFuture;
use sqlx::{PgExecutor, PgPool, postgres::PgPoolOptions, types::Json};
use time::OffsetDateTime;
use tracing::info;

use super::{
    config::PgConfig,
    error::{PgDaoError, PgResult},
    models::{MatchRow, NotificationRow, SeatRow, UserRow, assemble_matches},
};
use crate::dao::{
    lobby_store::{Decision, LobbyStore, NotificationUpdater, RatingUpdater},
    models::{
        MatchEntity, NewMatch, NewUser, NotificationState, RatedUser, RatingUpdateState,
        UserEntity, UserMatch,
    },
    storage::{StorageError, StorageResult},
};

/// [`LobbyStore`] backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgLobbyStore {
    pool: PgPool,
}

impl PgLobbyStore {
    /// Open the pool and apply the embedded migrations.
    pub async fn connect(config: &PgConfig) -> PgResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|source| PgDaoError::Connect { source })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| PgDaoError::Migrate { source })?;

        info!(
            max_connections = config.max_connections,
            "PostgreSQL lobby store ready"
        );
        Ok(Self { pool })
    }
}

async fn load_seats<'e, E>(executor: E, match_ids: &[String]) -> PgResult<Vec<SeatRow>>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, SeatRow>(
        "SELECT match_id, user_id, seat_id, color FROM match_seats \
         WHERE match_id = ANY($1) ORDER BY match_id, seat_index",
    )
    .bind(match_ids)
    .fetch_all(executor)
    .await
    .map_err(PgDaoError::query("load seats"))
}

async fn with_seats(pool: &PgPool, rows: Vec<MatchRow>) -> PgResult<Vec<MatchEntity>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids = rows.iter().map(|row| row.id.clone()).collect::<Vec<_>>();
    let seats = load_seats(pool, &ids).await?;
    Ok(assemble_matches(rows, seats))
}

fn activity_bounds(activity_window: Duration) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    (now, now - activity_window)
}

impl LobbyStore for PgLobbyStore {
    fn upsert_user(&self, user: NewUser) -> BoxFuture<'static, StorageResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO users (id, nickname, color, created_at) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&user.id)
            .bind(&user.nickname)
            .bind(&user.color)
            .bind(OffsetDateTime::now_utc())
            .execute(&pool)
            .await
            .map_err(PgDaoError::query("upsert user"))?;
            Ok(())
        })
    }

    fn update_device_token(
        &self,
        user_id: String,
        device_token: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let updated = sqlx::query("UPDATE users SET device_token = $2 WHERE id = $1")
                .bind(&user_id)
                .bind(&device_token)
                .execute(&pool)
                .await
                .map_err(PgDaoError::query("update device token"))?;
            if updated.rows_affected() == 0 {
                return Err(StorageError::not_found("user", user_id));
            }
            Ok(())
        })
    }

    fn find_user(&self, user_id: String) -> BoxFuture<'static, StorageResult<UserEntity>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(
                "SELECT id, nickname, color, created_at, device_token, device_token_env, rating \
                 FROM users WHERE id = $1",
            )
            .bind(&user_id)
            .fetch_optional(&pool)
            .await
            .map_err(PgDaoError::query("find user"))?;
            row.ok_or_else(|| StorageError::not_found("user", user_id))?
                .try_into()
        })
    }

    fn create_match(&self, game: NewMatch) -> BoxFuture<'static, StorageResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(PgDaoError::query("begin create match"))?;

            let user_ids = game
                .seats
                .iter()
                .map(|seat| seat.user_id.clone())
                .collect::<Vec<_>>();
            let known = sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE id = ANY($1)")
                .bind(&user_ids[..])
                .fetch_all(&mut *tx)
                .await
                .map_err(PgDaoError::query("check seat owners"))?;
            if let Some(missing) = user_ids.iter().find(|id| !known.contains(id)) {
                return Err(StorageError::not_found("user", missing.clone()));
            }

            let inserted = sqlx::query(
                "INSERT INTO matches (id, spectator_id, created_at, expires_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&game.id)
            .bind(&game.spectator_id)
            .bind(OffsetDateTime::now_utc())
            .bind(game.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(PgDaoError::query("insert match"))?;
            if inserted.rows_affected() == 0 {
                return Err(StorageError::AlreadyWritten {
                    entity: "match",
                    key: game.id,
                });
            }

            for (index, seat) in game.seats.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO match_seats (match_id, seat_index, user_id, seat_id, color) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&game.id)
                .bind(index as i32)
                .bind(&seat.user_id)
                .bind(&seat.seat_id)
                .bind(&seat.color)
                .execute(&mut *tx)
                .await
                .map_err(PgDaoError::query("insert seat"))?;
            }

            tx.commit()
                .await
                .map_err(PgDaoError::query("commit create match"))?;
            Ok(())
        })
    }

    fn list_active_users(
        &self,
        activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let (now, cutoff) = activity_bounds(activity_window);
            let users = sqlx::query_scalar::<_, String>(
                "SELECT DISTINCT s.user_id FROM match_seats s \
                 JOIN matches m ON m.id = s.match_id \
                 WHERE m.expires_at > $1 AND (m.finished_at IS NULL OR m.finished_at > $2) \
                 ORDER BY s.user_id",
            )
            .bind(now)
            .bind(cutoff)
            .fetch_all(&pool)
            .await
            .map_err(PgDaoError::query("list active users"))?;
            Ok(users)
        })
    }

    fn list_user_matches(
        &self,
        user_id: String,
        activity_window: Duration,
    ) -> BoxFuture<'static, StorageResult<Vec<UserMatch>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let (now, cutoff) = activity_bounds(activity_window);
            let rows = sqlx::query_as::<_, MatchRow>(
                "SELECT m.id, m.spectator_id, m.created_at, m.expires_at, m.finished_at, \
                        m.results, m.rating_results \
                 FROM matches m \
                 WHERE m.expires_at > $2 AND (m.finished_at IS NULL OR m.finished_at > $3) \
                   AND EXISTS (SELECT 1 FROM match_seats s WHERE s.match_id = m.id AND s.user_id = $1) \
                 ORDER BY m.created_at",
            )
            .bind(&user_id)
            .bind(now)
            .bind(cutoff)
            .fetch_all(&pool)
            .await
            .map_err(PgDaoError::query("list user matches"))?;

            let matches = with_seats(&pool, rows).await?;
            Ok(matches
                .into_iter()
                .filter_map(|game| {
                    let seat = game.seat_of(&user_id)?.clone();
                    Some(UserMatch { game, seat })
                })
                .collect())
        })
    }

    fn list_unfinished_matches(&self) -> BoxFuture<'static, StorageResult<Vec<MatchEntity>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MatchRow>(
                "SELECT id, spectator_id, created_at, expires_at, finished_at, results, rating_results \
                 FROM matches WHERE expires_at > $1 AND finished_at IS NULL ORDER BY created_at",
            )
            .bind(OffsetDateTime::now_utc())
            .fetch_all(&pool)
            .await
            .map_err(PgDaoError::query("list unfinished matches"))?;
            Ok(with_seats(&pool, rows).await?)
        })
    }

    fn find_match_by_seat(
        &self,
        seat_id: String,
    ) -> BoxFuture<'static, StorageResult<MatchEntity>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let row = sqlx::query_as::<_, MatchRow>(
                "SELECT m.id, m.spectator_id, m.created_at, m.expires_at, m.finished_at, \
                        m.results, m.rating_results \
                 FROM matches m JOIN match_seats s ON s.match_id = m.id \
                 WHERE s.seat_id = $1",
            )
            .bind(&seat_id)
            .fetch_optional(&pool)
            .await
            .map_err(PgDaoError::query("find match by seat"))?;
            let row = row.ok_or_else(|| StorageError::not_found("seat", seat_id))?;
            with_seats(&pool, vec![row])
                .await?
                .pop()
                .ok_or_else(|| StorageError::Corrupt("match lost its row".into()))
        })
    }

    fn record_match_results(
        &self,
        match_id: String,
        results: serde_json::Value,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let updated = sqlx::query(
                "UPDATE matches SET finished_at = $2, results = $3 \
                 WHERE id = $1 AND finished_at IS NULL",
            )
            .bind(&match_id)
            .bind(OffsetDateTime::now_utc())
            .bind(Json(&results))
            .execute(&pool)
            .await
            .map_err(PgDaoError::query("record match results"))?;
            if updated.rows_affected() == 1 {
                return Ok(());
            }

            let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM matches WHERE id = $1")
                .bind(&match_id)
                .fetch_optional(&pool)
                .await
                .map_err(PgDaoError::query("check match"))?;
            match exists {
                Some(_) => Err(StorageError::AlreadyWritten {
                    entity: "match results",
                    key: match_id,
                }),
                None => Err(StorageError::not_found("match", match_id)),
            }
        })
    }

    fn update_notification_state(
        &self,
        user_id: String,
        updater: NotificationUpdater,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(PgDaoError::query("begin notification update"))?;

            let row = sqlx::query_as::<_, NotificationRow>(
                "SELECT device_token, device_token_env, sent_notification \
                 FROM users WHERE id = $1 FOR UPDATE",
            )
            .bind(&user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(PgDaoError::query("lock notification state"))?;
            let row = row.ok_or_else(|| StorageError::not_found("user", user_id.clone()))?;
            let state = NotificationState::try_from(row)?;

            match updater(state).await {
                Decision::Keep => {
                    tx.commit()
                        .await
                        .map_err(PgDaoError::query("release notification lock"))?;
                    Ok(())
                }
                Decision::Commit(next) => {
                    sqlx::query(
                        "UPDATE users SET device_token = $2, device_token_env = $3, \
                         sent_notification = $4 WHERE id = $1",
                    )
                    .bind(&user_id)
                    .bind(&next.device_token)
                    .bind(next.device_token_env.as_str())
                    .bind(Json(next.sent))
                    .execute(&mut *tx)
                    .await
                    .map_err(PgDaoError::query("write notification state"))?;
                    tx.commit()
                        .await
                        .map_err(PgDaoError::query("commit notification state"))?;
                    Ok(())
                }
                Decision::Abort(err) => {
                    tx.rollback()
                        .await
                        .map_err(PgDaoError::query("rollback notification update"))?;
                    Err(StorageError::Aborted(err))
                }
            }
        })
    }

    fn rate_oldest_finished(
        &self,
        updater: RatingUpdater,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(PgDaoError::query("begin rating claim"))?;

            // Concurrent raters skip a claimed match instead of waiting on it.
            let row = sqlx::query_as::<_, MatchRow>(
                "SELECT id, spectator_id, created_at, expires_at, finished_at, results, rating_results \
                 FROM matches WHERE finished_at IS NOT NULL AND rating_results IS NULL \
                 ORDER BY finished_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(PgDaoError::query("claim unrated match"))?;
            let Some(row) = row else {
                return Ok(None);
            };

            let seats = load_seats(&mut *tx, slice::from_ref(&row.id)).await?;
            let game = assemble_matches(vec![row], seats)
                .pop()
                .ok_or_else(|| StorageError::Corrupt("claimed match lost its row".into()))?;

            let user_ids = game
                .seats
                .iter()
                .map(|seat| seat.user_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();
            let locked = sqlx::query_as::<_, (String, i64)>(
                "SELECT id, rating FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            )
            .bind(&user_ids[..])
            .fetch_all(&mut *tx)
            .await
            .map_err(PgDaoError::query("lock seat owners"))?;

            let mut users: Vec<RatedUser> = Vec::new();
            for seat in &game.seats {
                if users.iter().any(|user| user.user_id == seat.user_id) {
                    continue;
                }
                if let Some((user_id, rating)) = locked.iter().find(|(id, _)| *id == seat.user_id)
                {
                    users.push(RatedUser {
                        user_id: user_id.clone(),
                        rating: *rating,
                    });
                }
            }

            let match_id = game.id.clone();
            let state = RatingUpdateState { game, users };
            let results = updater(&state).map_err(StorageError::Aborted)?;

            let written = sqlx::query(
                "UPDATE matches SET rating_results = $2 WHERE id = $1 AND rating_results IS NULL",
            )
            .bind(&match_id)
            .bind(Json(&results))
            .execute(&mut *tx)
            .await
            .map_err(PgDaoError::query("write rating results"))?;
            if written.rows_affected() != 1 {
                return Err(StorageError::AlreadyWritten {
                    entity: "rating results",
                    key: match_id,
                });
            }

            for (user_id, old_rating, new_rating) in results.user_changes() {
                let updated =
                    sqlx::query("UPDATE users SET rating = $2 WHERE id = $1 AND rating = $3")
                        .bind(&user_id)
                        .bind(new_rating)
                        .bind(old_rating)
                        .execute(&mut *tx)
                        .await
                        .map_err(PgDaoError::query("update rating"))?;
                if updated.rows_affected() != 1 {
                    return Err(StorageError::RatingConflict {
                        user_id,
                        expected: old_rating,
                    });
                }
            }

            tx.commit()
                .await
                .map_err(PgDaoError::query("commit rating"))?;
            Ok(Some(match_id))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map_err(PgDaoError::query("health ping"))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;
    use uuid::Uuid;

    use super::*;
    use crate::dao::models::{
        DeviceTokenEnv, RatingPlayer, RatingResults, SeatEntity, SentNotification,
    };
    use crate::dao::storage::BoxError;

    async fn store() -> PgLobbyStore {
        let url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
        PgLobbyStore::connect(&PgConfig::new(url)).await.unwrap()
    }

    async fn seed_match(store: &PgLobbyStore) -> (String, Vec<String>) {
        let suffix = Uuid::new_v4().simple().to_string();
        let users = vec![format!("a-{suffix}"), format!("b-{suffix}")];
        for user in &users {
            store
                .upsert_user(NewUser {
                    id: user.clone(),
                    nickname: user.clone(),
                    color: "red".into(),
                })
                .await
                .unwrap();
        }
        let match_id = format!("g-{suffix}");
        store
            .create_match(NewMatch {
                id: match_id.clone(),
                spectator_id: format!("s-{suffix}"),
                expires_at: OffsetDateTime::now_utc() + Duration::from_secs(3600),
                seats: users
                    .iter()
                    .enumerate()
                    .map(|(index, user)| SeatEntity {
                        user_id: user.clone(),
                        seat_id: format!("p{index}-{suffix}"),
                        color: if index == 0 { "red" } else { "blue" }.into(),
                    })
                    .collect(),
            })
            .await
            .unwrap();
        (match_id, users)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn notification_commit_persists_and_abort_rolls_back() {
        let store = store().await;
        let (_, users) = seed_match(&store).await;
        let user = users[0].clone();

        store
            .update_notification_state(
                user.clone(),
                Box::new(
                    |state: NotificationState| -> BoxFuture<'static, Decision<NotificationState>> {
                        Box::pin(async move {
                            Decision::Commit(NotificationState {
                                device_token_env: state.device_token_env.toggled(),
                                sent: SentNotification { active_games: 2 },
                                ..state
                            })
                        })
                    },
                ),
            )
            .await
            .unwrap();

        let err = store
            .update_notification_state(
                user.clone(),
                Box::new(
                    |_state: NotificationState| -> BoxFuture<'static, Decision<NotificationState>> {
                        Box::pin(async { Decision::Abort("gateway down".into()) })
                    },
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Aborted(_)));

        let found = store.find_user(user).await.unwrap();
        assert_eq!(found.device_token_env, DeviceTokenEnv::Sandbox);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn rating_is_written_once() {
        let store = store().await;
        let (match_id, users) = seed_match(&store).await;
        store
            .record_match_results(match_id.clone(), serde_json::json!({"phase": "end"}))
            .await
            .unwrap();
        assert!(matches!(
            store
                .record_match_results(match_id.clone(), serde_json::json!({}))
                .await,
            Err(StorageError::AlreadyWritten { .. })
        ));

        // Other tests may leave older unrated matches behind; drain until ours is rated.
        loop {
            let rated = store
                .rate_oldest_finished(Box::new(|state: &RatingUpdateState| {
                    let players = state
                        .game
                        .seats
                        .iter()
                        .zip(&state.users)
                        .enumerate()
                        .map(|(index, (seat, user))| RatingPlayer {
                            user_id: user.user_id.clone(),
                            seat_id: seat.seat_id.clone(),
                            old_rating: user.rating,
                            new_rating: user.rating + if index == 0 { 10 } else { -10 },
                        })
                        .collect();
                    Ok::<_, BoxError>(RatingResults {
                        pairs: Vec::new(),
                        players,
                    })
                }))
                .await
                .unwrap();
            match rated {
                Some(id) if id == match_id => break,
                Some(_) => continue,
                None => panic!("match {match_id} was never claimed"),
            }
        }

        assert_eq!(store.find_user(users[0].clone()).await.unwrap().rating, 1010);
        assert_eq!(store.find_user(users[1].clone()).await.unwrap().rating, 990);
    }
}
