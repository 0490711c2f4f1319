//! Client for the external game engine the lobby sits in front of.

mod client;
mod error;
mod models;

use futures::future::BoxFuture;

pub use client::HttpGameEngine;
pub use error::{EngineError, EngineResult};
pub use models::{
    ALL_COLORS, Board, CreateGameRequest, CreatedGame, CreatedPlayer, GameDescription,
    GameSettings, NewPlayer, SeatResult, assign_colors,
};

/// The narrow set of engine operations the lobby relies on.
pub trait GameEngine: Send + Sync {
    /// Create a match and return its seats.
    fn create_game(
        &self,
        request: CreateGameRequest,
    ) -> BoxFuture<'static, EngineResult<CreatedGame>>;
    /// Spectator view of a match: finished flag, standings and the raw document.
    fn describe_game(
        &self,
        spectator_id: String,
    ) -> BoxFuture<'static, EngineResult<GameDescription>>;
    /// Colors the engine currently waits on, asked through one seat of the match.
    fn awaiting_colors(&self, seat_id: String) -> BoxFuture<'static, EngineResult<Vec<String>>>;
    /// Public URL a player opens to play from `seat_id`.
    fn player_url(&self, seat_id: &str) -> String;
}
