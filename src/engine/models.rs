use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::error::{EngineError, EngineResult};

/// Seat colors offered by the engine, in assignment preference order.
pub const ALL_COLORS: [&str; 9] = [
    "blue", "red", "yellow", "green", "black", "purple", "orange", "pink", "bronze",
];

/// Phase reported by the engine once a match is over.
const FINISHED_PHASE: &str = "end";

/// Player requested for a new match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPlayer {
    /// Nickname shown in the match.
    pub name: String,
    /// Preferred color; may be reassigned on conflict.
    pub color: String,
}

/// Map the match is played on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Board {
    /// Base map.
    #[default]
    Tharsis,
    /// Southern map.
    Hellas,
    /// Northern map.
    Elysium,
}

/// Expansion toggles chosen by the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameSettings {
    /// Map.
    pub board: Board,
    /// Corporate era cards.
    pub corporate_era: bool,
    /// Prelude expansion.
    pub prelude: bool,
    /// Venus Next expansion.
    pub venus_next: bool,
    /// Solar phase variant, only meaningful with Venus Next.
    pub solar_phase: bool,
    /// Colonies expansion.
    pub colonies: bool,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            board: Board::Tharsis,
            corporate_era: true,
            prelude: true,
            venus_next: true,
            solar_phase: false,
            colonies: false,
        }
    }
}

/// Everything needed to create a match on the engine.
#[derive(Debug, Clone)]
pub struct CreateGameRequest {
    /// Participants, at least one.
    pub players: Vec<NewPlayer>,
    /// Expansion toggles.
    pub settings: GameSettings,
}

/// Player slot returned by the engine after creation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedPlayer {
    /// Seat identifier, also the player's private URL handle.
    pub id: String,
    /// Nickname the seat was created for.
    pub name: String,
    /// Color assigned by the engine.
    pub color: String,
}

/// Match freshly created on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedGame {
    /// Match identifier.
    pub id: String,
    /// Read-only handle.
    pub spectator_id: String,
    /// Seats in engine order.
    pub players: Vec<CreatedPlayer>,
    /// Date after which the engine drops the match.
    pub purge_date: OffsetDateTime,
}

/// Final standing of one seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatResult {
    /// Engine seat identifier.
    pub seat_id: String,
    /// Victory points.
    pub score: i64,
    /// Remaining credits, compared when scores are equal.
    pub tiebreaker: i64,
}

/// Parsed spectator view of a match together with the raw document.
#[derive(Debug, Clone, PartialEq)]
pub struct GameDescription {
    /// Whether the match reached its terminal phase.
    pub finished: bool,
    /// Seats in the order the engine lists them.
    pub seats: Vec<SeatResult>,
    /// Document as received, kept as the results snapshot.
    pub raw: Value,
}

impl GameDescription {
    /// Parse a spectator document, either fresh from the engine or stored with a match.
    pub fn from_raw(raw: Value) -> EngineResult<Self> {
        let parsed = SpectatorResponse::deserialize(&raw)
            .map_err(|source| EngineError::InvalidSnapshot { source })?;
        Ok(Self {
            finished: parsed.game.phase == FINISHED_PHASE,
            seats: parsed
                .players
                .into_iter()
                .map(|player| SeatResult {
                    seat_id: player.id,
                    score: player.victory_points_breakdown.total,
                    tiebreaker: player.mega_credits,
                })
                .collect(),
            raw,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SpectatorResponse {
    #[serde(default)]
    game: SpectatorGame,
    #[serde(default)]
    players: Vec<SpectatorPlayer>,
}

#[derive(Debug, Default, Deserialize)]
struct SpectatorGame {
    #[serde(default)]
    phase: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpectatorPlayer {
    id: String,
    #[serde(default)]
    mega_credits: i64,
    #[serde(default)]
    victory_points_breakdown: VictoryPoints,
}

#[derive(Debug, Default, Deserialize)]
struct VictoryPoints {
    #[serde(default)]
    total: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WaitingForResponse {
    #[serde(default)]
    pub waiting_for: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateGameResponse {
    pub id: String,
    pub spectator_id: String,
    pub players: Vec<CreatedPlayer>,
    #[serde(rename = "expectedPurgeTimeMs")]
    pub purge_time_ms: i64,
}

impl CreateGameResponse {
    pub fn into_created(self) -> EngineResult<CreatedGame> {
        let nanos = i128::from(self.purge_time_ms) * 1_000_000;
        let purge_date = OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| {
            EngineError::InvalidPurgeDate {
                millis: self.purge_time_ms,
            }
        })?;
        Ok(CreatedGame {
            id: self.id,
            spectator_id: self.spectator_id,
            players: self.players,
            purge_date,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerBody {
    name: String,
    color: String,
    beginner: bool,
    handicap: u32,
    first: bool,
}

/// Body of `PUT /game`. Only the options the lobby touches are spelled out.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateGameBody {
    players: Vec<PlayerBody>,
    board: Board,
    seed: f32,
    corporate_era: bool,
    prelude: bool,
    venus_next: bool,
    colonies: bool,
    solar_phase_option: bool,
    #[serde(rename = "showOtherPlayersVP")]
    show_other_players_vp: bool,
    undo_option: bool,
    show_timers: bool,
    include_venus_m_a: bool,
    political_agendas_extension: &'static str,
    starting_corporations: u32,
    prelude_draft_variant: bool,
    #[serde(rename = "randomMA")]
    random_ma: &'static str,
    custom_corporations_list: Vec<Value>,
    custom_colonies_list: Vec<Value>,
    custom_preludes: Vec<Value>,
    banned_cards: Vec<Value>,
    included_cards: Vec<Value>,
}

impl CreateGameBody {
    pub fn build(request: CreateGameRequest, rng: &mut impl Rng) -> EngineResult<Self> {
        if request.players.is_empty() {
            return Err(EngineError::NoPlayers);
        }
        let first = rng.random_range(0..request.players.len());
        let players = assign_colors(request.players)
            .into_iter()
            .enumerate()
            .map(|(index, player)| PlayerBody {
                name: player.name,
                color: player.color,
                beginner: false,
                handicap: 0,
                first: index == first,
            })
            .collect();

        let settings = request.settings;
        let mut starting_corporations = 2;
        if settings.venus_next {
            starting_corporations += 1;
        }
        if settings.colonies {
            starting_corporations += 1;
        }

        Ok(Self {
            players,
            board: settings.board,
            seed: rng.random(),
            corporate_era: settings.corporate_era,
            prelude: settings.prelude,
            venus_next: settings.venus_next,
            colonies: settings.colonies,
            solar_phase_option: settings.solar_phase,
            show_other_players_vp: true,
            undo_option: true,
            show_timers: true,
            include_venus_m_a: true,
            political_agendas_extension: "Standard",
            starting_corporations,
            prelude_draft_variant: true,
            random_ma: "No randomization",
            custom_corporations_list: Vec::new(),
            custom_colonies_list: Vec::new(),
            custom_preludes: Vec::new(),
            banned_cards: Vec::new(),
            included_cards: Vec::new(),
        })
    }
}

/// Give every player a distinct color, keeping requested colors where possible.
///
/// Players whose color is unknown or already taken get the first free color.
pub fn assign_colors(mut players: Vec<NewPlayer>) -> Vec<NewPlayer> {
    let mut free: Vec<&str> = ALL_COLORS.to_vec();
    let mut conflicting = Vec::new();
    for (index, player) in players.iter().enumerate() {
        match free.iter().position(|color| *color == player.color) {
            Some(position) => {
                free.remove(position);
            }
            None => conflicting.push(index),
        }
    }
    for index in conflicting {
        if free.is_empty() {
            break;
        }
        players[index].color = free.remove(0).to_string();
    }
    players
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};
    use serde_json::json;

    use super::*;

    fn player(name: &str, color: &str) -> NewPlayer {
        NewPlayer {
            name: name.into(),
            color: color.into(),
        }
    }

    #[test]
    fn description_reads_phase_scores_and_credits() {
        let raw = json!({
            "game": {"phase": "end", "id": "g1"},
            "players": [
                {"id": "pfd7", "megaCredits": 12, "victoryPointsBreakdown": {"total": 136, "terraformRating": 50}},
                {"id": "p53c", "megaCredits": 30, "victoryPointsBreakdown": {"total": 122}}
            ],
            "extra": [1, 2, 3]
        });

        let description = GameDescription::from_raw(raw.clone()).unwrap();

        assert!(description.finished);
        assert_eq!(
            description.seats,
            vec![
                SeatResult {
                    seat_id: "pfd7".into(),
                    score: 136,
                    tiebreaker: 12
                },
                SeatResult {
                    seat_id: "p53c".into(),
                    score: 122,
                    tiebreaker: 30
                },
            ]
        );
        assert_eq!(description.raw, raw);
    }

    #[test]
    fn description_of_running_match_is_unfinished() {
        let description =
            GameDescription::from_raw(json!({"game": {"phase": "action"}, "players": []}))
                .unwrap();
        assert!(!description.finished);
        assert!(description.seats.is_empty());
    }

    #[test]
    fn description_rejects_malformed_players() {
        let err = GameDescription::from_raw(json!({"players": [{"megaCredits": "lots"}]}))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSnapshot { .. }));
    }

    #[test]
    fn conflicting_colors_get_the_first_free_color() {
        let assigned = assign_colors(vec![
            player("ann", "red"),
            player("bob", "red"),
            player("cyd", "teal"),
            player("dee", "blue"),
        ]);
        let colors = assigned
            .iter()
            .map(|player| player.color.as_str())
            .collect::<Vec<_>>();
        assert_eq!(colors, vec!["red", "yellow", "green", "blue"]);
    }

    #[test]
    fn create_body_marks_exactly_one_first_player() {
        let mut rng = StdRng::seed_from_u64(7);
        let body = CreateGameBody::build(
            CreateGameRequest {
                players: vec![player("ann", "red"), player("bob", "blue"), player("cyd", "red")],
                settings: GameSettings {
                    colonies: true,
                    ..GameSettings::default()
                },
            },
            &mut rng,
        )
        .unwrap();

        assert_eq!(body.players.iter().filter(|player| player.first).count(), 1);
        assert_eq!(body.starting_corporations, 4);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["randomMA"], "No randomization");
        assert_eq!(json["players"][2]["color"], "yellow");
    }

    #[test]
    fn create_body_requires_players() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = CreateGameBody::build(
            CreateGameRequest {
                players: Vec::new(),
                settings: GameSettings::default(),
            },
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NoPlayers));
    }

    #[test]
    fn purge_date_is_read_from_milliseconds() {
        let response: CreateGameResponse = serde_json::from_value(json!({
            "id": "g1",
            "spectatorId": "s1",
            "players": [{"id": "p1", "name": "ann", "color": "red"}],
            "expectedPurgeTimeMs": 1_700_000_000_123_i64
        }))
        .unwrap();
        let created = response.into_created().unwrap();
        assert_eq!(created.purge_date.unix_timestamp(), 1_700_000_000);
        assert_eq!(created.purge_date.millisecond(), 123);
    }
}
