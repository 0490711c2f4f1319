use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{
    GameEngine,
    error::{EngineError, EngineResult},
    models::{
        CreateGameBody, CreateGameRequest, CreateGameResponse, CreatedGame, GameDescription,
        WaitingForResponse,
    },
};

/// [`GameEngine`] speaking the engine's JSON-over-HTTP API.
#[derive(Clone)]
pub struct HttpGameEngine {
    client: Client,
    base_url: Arc<str>,
    public_base_url: Arc<str>,
}

impl HttpGameEngine {
    /// Build a client for the engine at `base_url`. Player links point at `public_base_url`.
    pub fn new(base_url: &str, public_base_url: &str, timeout: Duration) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| EngineError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            public_base_url: Arc::from(public_base_url.trim_end_matches('/')),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn read_json<T>(path: &'static str, response: reqwest::Response) -> EngineResult<T>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::RequestStatus { path, status });
        }
        response
            .json::<T>()
            .await
            .map_err(|source| EngineError::DecodeResponse { path, source })
    }

    async fn get_by_id<T>(&self, path: &'static str, id: &str) -> EngineResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .client
            .get(self.url(path))
            .query(&[("id", id)])
            .send()
            .await
            .map_err(|source| EngineError::RequestSend { path, source })?;
        Self::read_json(path, response).await
    }
}

impl GameEngine for HttpGameEngine {
    fn create_game(
        &self,
        request: CreateGameRequest,
    ) -> BoxFuture<'static, EngineResult<CreatedGame>> {
        let engine = self.clone();
        Box::pin(async move {
            const PATH: &str = "game";
            let body = CreateGameBody::build(request, &mut rand::rng())?;
            let response = engine
                .client
                .put(engine.url(PATH))
                .json(&body)
                .send()
                .await
                .map_err(|source| EngineError::RequestSend { path: PATH, source })?;
            let created = Self::read_json::<CreateGameResponse>(PATH, response)
                .await?
                .into_created()?;
            debug!(game_id = %created.id, players = created.players.len(), "engine created game");
            Ok(created)
        })
    }

    fn describe_game(
        &self,
        spectator_id: String,
    ) -> BoxFuture<'static, EngineResult<GameDescription>> {
        let engine = self.clone();
        Box::pin(async move {
            let raw = engine
                .get_by_id::<Value>("api/spectator", &spectator_id)
                .await?;
            GameDescription::from_raw(raw)
        })
    }

    fn awaiting_colors(&self, seat_id: String) -> BoxFuture<'static, EngineResult<Vec<String>>> {
        let engine = self.clone();
        Box::pin(async move {
            let response = engine
                .get_by_id::<WaitingForResponse>("api/waitingfor", &seat_id)
                .await?;
            Ok(response.waiting_for)
        })
    }

    fn player_url(&self, seat_id: &str) -> String {
        let base = format!("{}/player", self.public_base_url);
        match Url::parse_with_params(&base, &[("id", seat_id)]) {
            Ok(url) => url.into(),
            Err(_) => format!("{base}?id={seat_id}"),
        }
    }
}
