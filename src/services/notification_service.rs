//! Per-user push notification pass fed by a bounded queue of user ids.
//!
//! Both the activity scanner and the turn watcher enqueue ids through a
//! [`NotificationQueue`]; a fixed pool of workers drains it. The decision and
//! the persisted [`NotificationState`] are taken together under the user's row
//! lock, so two passes for the same user serialize while other users proceed.

use std::{cmp::Ordering, sync::Arc};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dao::{
        lobby_store::{Decision, LobbyStore, NotificationUpdater},
        models::{DeviceTokenEnv, NotificationState, SentNotification},
    },
    error::ServiceError,
    push::{Alert, Notification, PushError, PushTargets},
    services::game_service::GameService,
};

/// Errors of the dispatcher lifecycle and of its queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatcherError {
    /// The worker pool was configured empty.
    #[error("notification dispatcher needs at least one worker")]
    NoWorkers,
    /// The caller gave up before the queue had room.
    #[error("notification request cancelled")]
    Cancelled,
    /// The dispatcher is gone.
    #[error("notification queue closed")]
    Closed,
}

/// Sending half of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<String>,
}

impl NotificationQueue {
    /// Bounded queue; the receiver goes to [`NotificationDispatcher::run`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Request a notification pass for `user_id`.
    ///
    /// Waits while the queue is full and gives up as soon as `cancel` fires.
    pub async fn notify_user(
        &self,
        user_id: String,
        cancel: &CancellationToken,
    ) -> Result<(), DispatcherError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatcherError::Cancelled),
            sent = self.tx.send(user_id) => sent.map_err(|_| DispatcherError::Closed),
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Size of the worker pool, at least one.
    pub workers: usize,
    /// Title of alert notifications.
    pub alert_title: String,
}

/// What one pass did for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// No device token registered.
    Skipped,
    /// The awaiting count matches what was last sent.
    Unchanged,
    /// A notification was delivered and recorded.
    Sent {
        /// Badge carried by the notification.
        badge: i64,
    },
    /// The gateway rejected the token; the stored environment now points to `to`.
    EnvironmentFlipped {
        /// Environment stored after the flip.
        to: DeviceTokenEnv,
    },
}

/// Worker pool delivering turn notifications.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn LobbyStore>,
    games: Arc<GameService>,
    push: PushTargets,
    alert_title: Arc<str>,
    workers: usize,
}

impl NotificationDispatcher {
    /// Build a dispatcher. Zero workers is a configuration error.
    pub fn new(
        settings: DispatcherSettings,
        store: Arc<dyn LobbyStore>,
        games: Arc<GameService>,
        push: PushTargets,
    ) -> Result<Self, DispatcherError> {
        if settings.workers == 0 {
            return Err(DispatcherError::NoWorkers);
        }
        Ok(Self {
            store,
            games,
            push,
            alert_title: settings.alert_title.into(),
            workers: settings.workers,
        })
    }

    /// Drain `receiver` with the worker pool until `cancel` fires or every sender is gone.
    pub async fn run(self, receiver: mpsc::Receiver<String>, cancel: CancellationToken) {
        info!(workers = self.workers, "notification dispatcher started");
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let dispatcher = self.clone();
            let receiver = Arc::clone(&receiver);
            let cancel = cancel.clone();
            workers.spawn(async move { dispatcher.work(worker, receiver, cancel).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "notification worker crashed");
            }
        }
        info!("notification dispatcher stopped");
    }

    async fn work(
        &self,
        worker: usize,
        receiver: Arc<Mutex<mpsc::Receiver<String>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    user_id = receiver.recv() => user_id,
                }
            };
            let Some(user_id) = next else {
                break;
            };

            match self.process_user(&user_id).await {
                Ok(outcome) => {
                    debug!(worker, user_id = %user_id, ?outcome, "notification pass done")
                }
                Err(err) => {
                    error!(worker, user_id = %user_id, error = %err, "notification pass failed")
                }
            }
        }
    }

    /// One notification pass for `user_id`.
    pub async fn process_user(&self, user_id: &str) -> Result<NotifyOutcome, ServiceError> {
        let user = self.store.find_user(user_id.to_owned()).await?;
        if user.device_token.is_empty() {
            return Ok(NotifyOutcome::Skipped);
        }

        let games = self.games.user_games(user_id).await?;
        let active = games.iter().filter(|game| game.awaits_input).count() as i64;

        let (report, outcome) = oneshot::channel();
        let push = self.push.clone();
        let title = Arc::clone(&self.alert_title);
        let owner = user_id.to_owned();
        let updater: NotificationUpdater = Box::new(
            move |state: NotificationState| -> BoxFuture<'static, Decision<NotificationState>> {
                Box::pin(async move {
                    if state.device_token.is_empty() {
                        let _ = report.send(NotifyOutcome::Skipped);
                        return Decision::Keep;
                    }
                    let Some(notification) =
                        build_notification(state.sent.active_games, active, &title)
                    else {
                        return Decision::Keep;
                    };

                    let notifier = push.for_env(state.device_token_env);
                    match notifier.send(state.device_token.clone(), notification).await {
                        Ok(()) => {
                            let _ = report.send(NotifyOutcome::Sent { badge: active });
                            Decision::Commit(NotificationState {
                                sent: SentNotification {
                                    active_games: active,
                                },
                                ..state
                            })
                        }
                        Err(PushError::BadDeviceToken) => {
                            let to = state.device_token_env.toggled();
                            warn!(
                                user_id = %owner,
                                from = %state.device_token_env,
                                to = %to,
                                "device token rejected, switching environment"
                            );
                            let _ = report.send(NotifyOutcome::EnvironmentFlipped { to });
                            Decision::Commit(NotificationState {
                                device_token_env: to,
                                ..state
                            })
                        }
                        Err(err) => Decision::Abort(Box::new(err)),
                    }
                })
            },
        );

        self.store
            .update_notification_state(user_id.to_owned(), updater)
            .await?;
        Ok(outcome.await.unwrap_or(NotifyOutcome::Unchanged))
    }
}

/// Notification for a change from `previous` to `active` awaiting games, if any.
///
/// More games produce an alert; fewer only refresh the badge, down to zero.
pub fn build_notification(previous: i64, active: i64, title: &str) -> Option<Notification> {
    match active.cmp(&previous) {
        Ordering::Equal => None,
        Ordering::Less => Some(Notification::badge_only(active)),
        Ordering::Greater => Some(Notification {
            alert: Some(Alert {
                title: title.to_owned(),
                subtitle: String::new(),
                body: awaiting_body(active),
            }),
            badge: active,
            sound: Some("default".to_owned()),
        }),
    }
}

fn awaiting_body(count: i64) -> String {
    if count == 1 {
        "1 game is awaiting your decision".to_owned()
    } else {
        format!("{count} games are awaiting your decision")
    }
}
