use axum::{
    Router,
    extract::{Query, Request, State},
    http::Method,
    middleware::{self, Next},
    response::Response,
    routing::any,
};
use tracing::warn;

use crate::{dto::player::SeatQuery, error::AppError, state::SharedState};

/// Engine passthrough. Move submissions are watched for turn-state changes.
pub fn router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/player/input", any(forward))
        .route_layer(middleware::from_fn_with_state(state, watch_turn_state))
        .fallback(forward)
}

/// Relay the request to the game engine unchanged.
pub async fn forward(State(state): State<SharedState>, req: Request) -> Result<Response, AppError> {
    Ok(state.proxy().forward(req).await?)
}

/// Capture the awaiting colors before the move and schedule the follow-up after it.
///
/// Nothing here can fail or hold back the forwarded request beyond the lookup timeout.
async fn watch_turn_state(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }

    let seat_id = Query::<SeatQuery>::try_from_uri(req.uri())
        .ok()
        .map(|Query(query)| query.id)
        .filter(|id| !id.is_empty());

    let ticket = match seat_id {
        Some(seat_id) => state.watcher().prepare(&seat_id).await,
        None => {
            warn!(uri = %req.uri(), "move submitted without a seat id");
            None
        }
    };

    let response = next.run(req).await;
    if let Some(ticket) = ticket {
        state.watcher().follow_up(ticket);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, atomic::Ordering},
        time::{Duration, Instant},
    };

    use axum::{
        body::{Body, to_bytes},
        http::{Request as HttpRequest, StatusCode},
        routing::{get, post},
    };
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        dao::lobby_store::memory::MemoryLobbyStore,
        routes,
        services::{
            notification_service::NotificationQueue,
            proxy_service::EngineProxy,
            turn_watcher::{TurnWatcher, WatcherSettings},
        },
        state::AppState,
        test_support::{FakeEngine, seed_match},
    };

    const SEATS: [&str; 2] = ["g1-ann", "g1-bob"];

    /// Engine stand-in whose move endpoint passes the turn from red to blue.
    async fn engine_stub(engine: Arc<FakeEngine>) -> String {
        let app = Router::new()
            .route(
                "/player/input",
                post(move || {
                    let engine = Arc::clone(&engine);
                    async move {
                        engine.set_waiting(&SEATS, &["blue"]);
                        "accepted"
                    }
                })
                .get(|| async { "player view" }),
            )
            .route("/api/game", get(|| async { "game document" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    async fn app(engine: Arc<FakeEngine>) -> (Router, mpsc::Receiver<String>) {
        let store = MemoryLobbyStore::new();
        seed_match(&store, "g1", &["ann", "bob"], &["red", "blue"]).await;
        engine.set_waiting(&SEATS, &["red"]);

        let (queue, receiver) = NotificationQueue::channel(8);
        let watcher = Arc::new(TurnWatcher::new(
            Arc::new(store.clone()),
            engine.clone(),
            queue,
            WatcherSettings {
                lookup_timeout: Duration::from_millis(100),
                follow_up_timeout: Duration::from_secs(1),
            },
            CancellationToken::new(),
        ));
        let base = engine_stub(engine).await;
        let proxy = EngineProxy::new(&base, Duration::from_secs(5)).unwrap();
        let state = AppState::new(Arc::new(store), watcher, proxy);
        (routes::router(state), receiver)
    }

    fn submit_move() -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/player/input?id=g1-ann")
            .body(Body::from("{}"))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn move_wakes_up_both_players() {
        let engine = FakeEngine::new();
        let (app, mut receiver) = app(engine).await;

        let response = app.oneshot(submit_move()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "accepted");

        let mut notified = Vec::new();
        for _ in 0..2 {
            let user = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            notified.push(user);
        }
        notified.sort();
        assert_eq!(notified, vec!["ann", "bob"]);
    }

    #[tokio::test]
    async fn failing_lookup_does_not_fail_the_move() {
        let engine = FakeEngine::new();
        let (app, mut receiver) = app(engine.clone()).await;
        engine.set_failing(true);

        let response = app.oneshot(submit_move()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "accepted");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_lookup_only_delays_the_move_up_to_its_timeout() {
        let engine = FakeEngine::new();
        let (app, _receiver) = app(engine.clone()).await;
        engine.set_lookup_delay(Duration::from_secs(10));

        let started = Instant::now();
        let response = app.oneshot(submit_move()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(engine.lookups.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn other_routes_are_forwarded_without_watching() {
        let engine = FakeEngine::new();
        let (app, _receiver) = app(engine.clone()).await;

        let request = HttpRequest::builder()
            .uri("/api/game?id=g1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "game document");
        assert_eq!(engine.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_post_player_input_is_forwarded_without_watching() {
        let engine = FakeEngine::new();
        let (app, _receiver) = app(engine.clone()).await;

        let request = HttpRequest::builder()
            .uri("/player/input?id=g1-ann")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "player view");
        assert_eq!(engine.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn healthcheck_reports_ok() {
        let (app, _receiver) = app(FakeEngine::new()).await;
        let request = HttpRequest::builder()
            .uri("/healthcheck")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"status":"ok"}"#);
    }
}
