//! Push delivery to user devices.
//!
//! Every user's token belongs to one of two credential sets. [`PushTargets`]
//! holds a notifier per set and picks one by the stored [`DeviceTokenEnv`].

mod apns;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::dao::models::DeviceTokenEnv;

pub use apns::{ApnsNotifier, ApnsSettings};

/// Result alias for push delivery.
pub type PushResult<T> = Result<T, PushError>;

/// Visible part of a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Alert {
    /// Bold first line.
    pub title: String,
    /// Optional second line; empty when unused.
    pub subtitle: String,
    /// Message text.
    pub body: String,
}

/// Payload delivered to a device. Without an alert it only updates the badge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Visible alert, absent for silent badge updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    /// Application badge count.
    pub badge: i64,
    /// Sound name played with the alert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

impl Notification {
    /// Silent update of the application badge.
    pub fn badge_only(badge: i64) -> Self {
        Self {
            alert: None,
            badge,
            sound: None,
        }
    }
}

/// Failures reported by a push gateway.
#[derive(Debug, Error)]
pub enum PushError {
    /// The gateway does not know the token under this credential set.
    #[error("device token rejected by the gateway")]
    BadDeviceToken,
    /// The gateway refused the notification for another reason.
    #[error("push gateway rejected notification with status {status}: {reason}")]
    Rejected {
        /// HTTP status of the answer.
        status: u16,
        /// Reason string from the gateway, possibly empty.
        reason: String,
    },
    /// The gateway could not be reached.
    #[error("failed to reach push gateway")]
    Request {
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// Building the HTTP client failed.
    #[error("failed to build push client")]
    ClientBuilder {
        /// Builder failure.
        #[source]
        source: reqwest::Error,
    },
    /// The signing key could not be loaded.
    #[error("invalid push signing key")]
    InvalidKey {
        /// Key parsing failure.
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    /// Signing the provider token failed.
    #[error("failed to sign push provider token")]
    Signing {
        /// Signing failure.
        #[source]
        source: jsonwebtoken::errors::Error,
    },
}

/// Capability to deliver a notification to one device token.
pub trait PushNotifier: Send + Sync {
    /// Deliver `notification` to the device identified by `device_token`.
    fn send(
        &self,
        device_token: Vec<u8>,
        notification: Notification,
    ) -> BoxFuture<'static, PushResult<()>>;
}

/// One notifier per device-token environment.
#[derive(Clone)]
pub struct PushTargets {
    /// Notifier for [`DeviceTokenEnv::Sandbox`] tokens.
    pub sandbox: Arc<dyn PushNotifier>,
    /// Notifier for [`DeviceTokenEnv::Production`] tokens.
    pub production: Arc<dyn PushNotifier>,
}

impl PushTargets {
    /// Notifier owning tokens of `env`.
    pub fn for_env(&self, env: DeviceTokenEnv) -> &Arc<dyn PushNotifier> {
        match env {
            DeviceTokenEnv::Sandbox => &self.sandbox,
            DeviceTokenEnv::Production => &self.production,
        }
    }
}

/// Notifier that only logs, used when delivery is disabled.
#[derive(Debug, Clone)]
pub struct DryRunNotifier {
    env: DeviceTokenEnv,
}

impl DryRunNotifier {
    /// Logger tagged with the environment it stands in for.
    pub fn new(env: DeviceTokenEnv) -> Self {
        Self { env }
    }
}

impl PushNotifier for DryRunNotifier {
    fn send(
        &self,
        device_token: Vec<u8>,
        notification: Notification,
    ) -> BoxFuture<'static, PushResult<()>> {
        let env = self.env;
        Box::pin(async move {
            info!(
                env = %env,
                device = %hex::encode(&device_token),
                badge = notification.badge,
                alert = notification.alert.as_ref().map(|alert| alert.body.as_str()).unwrap_or(""),
                "push delivery disabled, dropping notification"
            );
            Ok(())
        })
    }
}
