//! Library crate for lobby-pulse-back, exposing modules for the binary and tests.

/// Startup configuration.
pub mod config;
/// Storage layer.
pub mod dao;
mod dto;
/// Game engine client.
pub mod engine;
/// Service and HTTP error types.
pub mod error;
/// Push delivery.
pub mod push;
/// HTTP routes.
pub mod routes;
/// Background pipeline and request services.
pub mod services;
/// Shared application state.
pub mod state;

#[cfg(test)]
mod test_support;
