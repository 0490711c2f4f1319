//! Apple Push Notification service client.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{Notification, PushError, PushNotifier, PushResult};

const BAD_DEVICE_TOKEN: &str = "BadDeviceToken";

/// Connection and signing parameters of one APNs endpoint.
#[derive(Debug, Clone)]
pub struct ApnsSettings {
    /// Gateway root, e.g. `https://api.sandbox.push.apple.com`.
    pub base_url: String,
    /// Bundle identifier the notifications are addressed to.
    pub topic: String,
    /// Developer team id, used as the token issuer.
    pub team_id: String,
    /// Key id placed in the token header.
    pub key_id: String,
    /// PKCS#8 PEM of the ES256 signing key.
    pub key_pem: Vec<u8>,
    /// Provider tokens are re-signed once they are this old.
    pub max_token_age: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

#[derive(Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

#[derive(Serialize)]
struct Payload<'a> {
    aps: &'a Notification,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    reason: String,
}

struct CachedToken {
    value: String,
    issued: Instant,
}

struct Inner {
    client: Client,
    base_url: String,
    topic: String,
    team_id: String,
    header: Header,
    key: EncodingKey,
    max_token_age: Duration,
    token: Mutex<Option<CachedToken>>,
}

/// [`PushNotifier`] posting to APNs over HTTP/2 with token-based authentication.
#[derive(Clone)]
pub struct ApnsNotifier {
    inner: Arc<Inner>,
}

impl ApnsNotifier {
    /// Parse the signing key and build the HTTP/2 client.
    pub fn new(settings: ApnsSettings) -> PushResult<Self> {
        let key = EncodingKey::from_ec_pem(&settings.key_pem)
            .map_err(|source| PushError::InvalidKey { source })?;
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|source| PushError::ClientBuilder { source })?;

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(settings.key_id);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url: settings.base_url.trim_end_matches('/').to_owned(),
                topic: settings.topic,
                team_id: settings.team_id,
                header,
                key,
                max_token_age: settings.max_token_age,
                token: Mutex::new(None),
            }),
        })
    }

    fn provider_token(&self) -> PushResult<String> {
        let inner = &self.inner;
        let mut cached = inner
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(token) = cached
            .as_ref()
            .filter(|token| token.issued.elapsed() < inner.max_token_age)
        {
            return Ok(token.value.clone());
        }

        let claims = ProviderClaims {
            iss: &inner.team_id,
            iat: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let value = jsonwebtoken::encode(&inner.header, &claims, &inner.key)
            .map_err(|source| PushError::Signing { source })?;
        *cached = Some(CachedToken {
            value: value.clone(),
            issued: Instant::now(),
        });
        Ok(value)
    }
}

/// Map a gateway rejection onto the push error taxonomy.
fn classify_rejection(status: StatusCode, body: &[u8]) -> PushError {
    let reason = serde_json::from_slice::<ErrorBody>(body)
        .unwrap_or_default()
        .reason;
    if status == StatusCode::BAD_REQUEST && reason == BAD_DEVICE_TOKEN {
        return PushError::BadDeviceToken;
    }
    PushError::Rejected {
        status: status.as_u16(),
        reason,
    }
}

impl PushNotifier for ApnsNotifier {
    fn send(
        &self,
        device_token: Vec<u8>,
        notification: Notification,
    ) -> BoxFuture<'static, PushResult<()>> {
        let notifier = self.clone();
        Box::pin(async move {
            let token = notifier.provider_token()?;
            let inner = &notifier.inner;
            let url = format!("{}/3/device/{}", inner.base_url, hex::encode(&device_token));
            let apns_id = Uuid::new_v4();

            let response = inner
                .client
                .post(url)
                .bearer_auth(token)
                .header("apns-id", apns_id.to_string())
                .header("apns-push-type", "alert")
                .header("apns-topic", &inner.topic)
                .json(&Payload { aps: &notification })
                .send()
                .await
                .map_err(|source| PushError::Request { source })?;

            let status = response.status();
            if status.is_success() {
                debug!(%apns_id, badge = notification.badge, "notification accepted");
                return Ok(());
            }
            let body = response
                .bytes()
                .await
                .map_err(|source| PushError::Request { source })?;
            Err(classify_rejection(status, &body))
        })
    }
}
