/// Runtime configuration describing how to reach PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Connection string.
    pub database_url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl PgConfig {
    /// Construct a configuration from an explicit connection string.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
        }
    }

    /// Override the pool size shared by every pipeline component.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}
