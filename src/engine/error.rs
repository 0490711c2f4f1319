//! Error types raised by the game-engine client.

use reqwest::StatusCode;
use thiserror::Error;

/// Convenient result alias returning [`EngineError`] failures.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures that can occur while talking to the game engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Building the HTTP client failed.
    #[error("failed to build game engine client")]
    ClientBuilder {
        /// Builder failure.
        #[source]
        source: reqwest::Error,
    },
    /// The request never reached the engine or timed out.
    #[error("failed to send game engine request to `{path}`")]
    RequestSend {
        /// Engine path that was called.
        path: &'static str,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// The engine answered with a non-success status.
    #[error("unexpected game engine response status {status} for `{path}`")]
    RequestStatus {
        /// Engine path that was called.
        path: &'static str,
        /// Status returned by the engine.
        status: StatusCode,
    },
    /// The response body was not the expected JSON document.
    #[error("failed to decode game engine response for `{path}`")]
    DecodeResponse {
        /// Engine path that was called.
        path: &'static str,
        /// Decoding failure.
        #[source]
        source: reqwest::Error,
    },
    /// A stored or received match snapshot does not have the expected shape.
    #[error("malformed game snapshot")]
    InvalidSnapshot {
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The engine reported a purge date outside the representable range.
    #[error("invalid purge date {millis} ms")]
    InvalidPurgeDate {
        /// Raw value in milliseconds since the epoch.
        millis: i64,
    },
    /// A match needs at least one player.
    #[error("cannot create a game without players")]
    NoPlayers,
}
