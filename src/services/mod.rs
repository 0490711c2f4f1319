/// Periodic sweep of active users.
pub mod activity_scanner;
/// Match creation, per-user match listing and finished-match collection.
pub mod game_service;
/// Health check service.
pub mod health_service;
/// Bounded queue and worker pool delivering turn notifications.
pub mod notification_service;
/// Passthrough of engine routes.
pub mod proxy_service;
/// Pairwise rating updates of finished matches.
pub mod rating_service;
/// Fast-path turn-state diffing around move submissions.
pub mod turn_watcher;
