use serde::Deserialize;

/// Query string of engine player routes (`?id=<seat>`).
#[derive(Debug, Deserialize)]
pub struct SeatQuery {
    /// Engine seat identifier of the acting player.
    pub id: String,
}
