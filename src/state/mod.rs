use std::sync::Arc;

use crate::{
    dao::lobby_store::LobbyStore,
    services::{proxy_service::EngineProxy, turn_watcher::TurnWatcher},
};

/// State handed to every handler.
pub type SharedState = Arc<AppState>;

/// Handles shared by the HTTP handlers.
pub struct AppState {
    store: Arc<dyn LobbyStore>,
    watcher: Arc<TurnWatcher>,
    proxy: EngineProxy,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        store: Arc<dyn LobbyStore>,
        watcher: Arc<TurnWatcher>,
        proxy: EngineProxy,
    ) -> SharedState {
        Arc::new(Self {
            store,
            watcher,
            proxy,
        })
    }

    /// Persistence backend shared with the background pipeline.
    pub fn store(&self) -> &Arc<dyn LobbyStore> {
        &self.store
    }

    /// Turn-state watcher wrapping move submissions.
    pub fn watcher(&self) -> &Arc<TurnWatcher> {
        &self.watcher
    }

    /// Passthrough to the game engine.
    pub fn proxy(&self) -> &EngineProxy {
        &self.proxy
    }
}
