//! Lobby Pulse binary entrypoint wiring storage, the game engine, push delivery and the HTTP layer.

use std::{fs, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lobby_pulse_back::{
    config::{AppConfig, PushConfig, StorageBackend, StorageConfig},
    dao::{
        lobby_store::{LobbyStore, memory::MemoryLobbyStore},
        models::DeviceTokenEnv,
    },
    engine::{GameEngine, HttpGameEngine},
    push::{ApnsNotifier, ApnsSettings, DryRunNotifier, PushNotifier, PushTargets},
    routes,
    services::{
        activity_scanner::ActivityScanner,
        game_service::GameService,
        notification_service::{DispatcherSettings, NotificationDispatcher, NotificationQueue},
        proxy_service::EngineProxy,
        rating_service::RatingService,
        turn_watcher::{TurnWatcher, WatcherSettings},
    },
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load().context("loading configuration")?;
    let store = connect_store(&config.storage).await?;
    let engine: Arc<dyn GameEngine> = Arc::new(
        HttpGameEngine::new(
            &config.engine.base_url,
            &config.engine.public_base_url,
            config.engine.request_timeout,
        )
        .context("building game engine client")?,
    );
    let push = push_targets(&config.push)?;
    let cancel = CancellationToken::new();

    let notifications = &config.notifications;
    let games = Arc::new(GameService::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        notifications.activity_window,
    ));
    let (queue, receiver) = NotificationQueue::channel(notifications.queue_capacity);
    let dispatcher = NotificationDispatcher::new(
        DispatcherSettings {
            workers: notifications.workers,
            alert_title: notifications.alert_title.clone(),
        },
        Arc::clone(&store),
        Arc::clone(&games),
        push,
    )
    .context("starting notification dispatcher")?;
    let scanner = ActivityScanner::new(
        Arc::clone(&store),
        queue.clone(),
        notifications.activity_window,
    );
    let rating = RatingService::new(Arc::clone(&store));
    let watcher = Arc::new(TurnWatcher::new(
        Arc::clone(&store),
        engine,
        queue,
        WatcherSettings {
            lookup_timeout: config.watcher.lookup_timeout,
            follow_up_timeout: config.watcher.follow_up_timeout,
        },
        cancel.clone(),
    ));
    let proxy = EngineProxy::new(&config.engine.base_url, config.engine.request_timeout)
        .context("building engine proxy")?;

    let mut background = JoinSet::new();
    background.spawn(dispatcher.run(receiver, cancel.clone()));
    background.spawn({
        let cancel = cancel.clone();
        let period = notifications.scan_interval;
        async move { scanner.run(period, cancel).await }
    });
    background.spawn({
        let cancel = cancel.clone();
        let period = config.rating.scan_interval;
        async move { rating.run(period, cancel).await }
    });
    background.spawn({
        let cancel = cancel.clone();
        let period = config.games.scan_interval;
        async move { games.run_collector(period, cancel).await }
    });

    let app = build_router(AppState::new(store, watcher, proxy));

    let addr: SocketAddr = format!("{}:{}", config.listen.host, config.listen.port)
        .parse()
        .context("parsing listen address")?;
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    cancel.cancel();
    while let Some(joined) = background.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "background task crashed");
        }
    }
    info!("shutdown complete");

    Ok(())
}

/// Open the configured storage backend.
async fn connect_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn LobbyStore>> {
    match config.backend {
        StorageBackend::Memory => {
            warn!("using the in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryLobbyStore::new()))
        }
        StorageBackend::Postgres => connect_postgres(config).await,
    }
}

#[cfg(feature = "postgres-store")]
async fn connect_postgres(config: &StorageConfig) -> anyhow::Result<Arc<dyn LobbyStore>> {
    use lobby_pulse_back::dao::lobby_store::postgres::{PgConfig, PgLobbyStore};

    let url = config
        .database_url
        .clone()
        .context("storage.database_url is not set")?;
    let pg_config = PgConfig::new(url).with_max_connections(config.max_connections);
    let store = PgLobbyStore::connect(&pg_config)
        .await
        .context("connecting to PostgreSQL")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres-store"))]
async fn connect_postgres(_config: &StorageConfig) -> anyhow::Result<Arc<dyn LobbyStore>> {
    anyhow::bail!("built without the `postgres-store` feature")
}

/// One APNs client per credential set, or loggers when delivery is disabled.
fn push_targets(config: &PushConfig) -> anyhow::Result<PushTargets> {
    if !config.enabled {
        warn!("push delivery disabled; notifications are only logged");
        return Ok(PushTargets {
            sandbox: Arc::new(DryRunNotifier::new(DeviceTokenEnv::Sandbox)),
            production: Arc::new(DryRunNotifier::new(DeviceTokenEnv::Production)),
        });
    }

    let key_path = config
        .key_path
        .as_ref()
        .context("push.key_path is not set")?;
    let key_pem = fs::read(key_path)
        .with_context(|| format!("reading APNs key `{}`", key_path.display()))?;

    let notifier = |base_url: &str| -> anyhow::Result<Arc<dyn PushNotifier>> {
        let notifier = ApnsNotifier::new(ApnsSettings {
            base_url: base_url.to_owned(),
            topic: config.topic.clone(),
            team_id: config.team_id.clone(),
            key_id: config.key_id.clone(),
            key_pem: key_pem.clone(),
            max_token_age: config.max_token_age,
            request_timeout: config.request_timeout,
        })
        .context("building APNs client")?;
        Ok(Arc::new(notifier))
    };

    Ok(PushTargets {
        sandbox: notifier(&config.sandbox_url)?,
        production: notifier(&config.production_url)?,
    })
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
