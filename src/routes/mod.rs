use axum::Router;

use crate::state::SharedState;

/// Move watching and engine passthrough.
pub mod engine;
/// Liveness endpoint.
pub mod health;

/// Compose all route trees and wire in shared state.
///
/// Anything not served by the lobby itself falls through to the game engine.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(engine::router(state.clone()))
        .with_state(state)
}
