mod config;
mod error;
mod models;
mod store;

pub use config::PgConfig;
pub use error::PgDaoError;
pub use store::PgLobbyStore;
