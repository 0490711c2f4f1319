/// Persistence of users, matches and pipeline bookkeeping.
pub mod lobby_store;
/// Database model definitions.
pub mod models;
/// Storage abstraction layer for database operations.
pub mod storage;
