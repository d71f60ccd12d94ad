//! Browser Web Push.
//!
//! The engine parses subscriptions, shapes payloads, and enforces pacing;
//! message encryption and VAPID signing (RFC 8291 / RFC 8292) live behind
//! [`WebPushTransport`], the seam an external web-push library plugs into.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::ChannelAdapter;
use crate::batch::send_batch;
use crate::error::{error_key, ConfigError, TransportError};
use crate::limiter::MinTime;
use crate::types::{ChannelKind, Meta, SendResult, WebPushMeta};

/// Default sends per second for the web channel.
const DEFAULT_RATE_PER_SECOND: u32 = 50;
/// Default concurrent sends for the web channel.
const DEFAULT_CONCURRENCY: usize = 5;

/// A browser push subscription, as serialized by `PushSubscription.toJSON()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

/// Client key material for payload encryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

impl Subscription {
    /// Parse and structurally validate a serialized subscription.
    pub fn parse(raw: &str) -> Option<Subscription> {
        let sub: Subscription = serde_json::from_str(raw).ok()?;
        if !sub.endpoint.starts_with("https://") && !sub.endpoint.starts_with("http://") {
            return None;
        }
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        if sub.keys.p256dh.is_empty() || b64.decode(&sub.keys.p256dh).is_err() {
            return None;
        }
        if sub.keys.auth.is_empty() || b64.decode(&sub.keys.auth).is_err() {
            return None;
        }
        Some(sub)
    }
}

/// VAPID identification, set once per process before the first send.
#[derive(Clone, Debug)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub contact_email: String,
}

impl VapidConfig {
    pub fn new(
        public_key: impl Into<String>,
        private_key: impl Into<String>,
        contact_email: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
            contact_email: contact_email.into(),
        };
        if config.public_key.is_empty() {
            return Err(ConfigError::MissingField("vapid public_key"));
        }
        if config.private_key.is_empty() {
            return Err(ConfigError::MissingField("vapid private_key"));
        }
        if config.contact_email.is_empty() {
            return Err(ConfigError::MissingField("vapid contact_email"));
        }
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        if b64.decode(&config.public_key).is_err() || b64.decode(&config.private_key).is_err() {
            return Err(ConfigError::InvalidCredentials("vapid keys must be base64url".into()));
        }
        Ok(config)
    }
}

/// Push service request options assembled from the meta.
#[derive(Clone, Debug, Default)]
pub struct WebPushOptions {
    /// Push service TTL, seconds.
    pub ttl: Option<u32>,
    /// Extra request headers (`Topic`, `Urgency`, ...).
    pub headers: HashMap<String, String>,
}

/// The web-push boundary: encrypts `payload` for `subscription` and posts
/// it, returning the push service's response detail.
#[async_trait]
pub trait WebPushTransport: Send + Sync {
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &[u8],
        options: &WebPushOptions,
    ) -> Result<Value, TransportError>;
}

/// Web channel settings.
#[derive(Clone, Debug)]
pub struct WebPushConfig {
    pub vapid: VapidConfig,
    pub rate_per_second: u32,
    pub concurrency: usize,
}

impl WebPushConfig {
    pub fn new(vapid: VapidConfig) -> Self {
        Self { vapid, rate_per_second: DEFAULT_RATE_PER_SECOND, concurrency: DEFAULT_CONCURRENCY }
    }
}

/// Web Push channel adapter.
pub struct WebPushAdapter {
    transport: Arc<dyn WebPushTransport>,
    vapid: VapidConfig,
    limiter: MinTime,
    concurrency: usize,
}

impl WebPushAdapter {
    pub fn new(
        config: WebPushConfig,
        transport: Arc<dyn WebPushTransport>,
    ) -> Result<Self, ConfigError> {
        let limiter = MinTime::per_second(config.rate_per_second, config.concurrency)?;
        Ok(Self { transport, vapid: config.vapid, limiter, concurrency: config.concurrency })
    }

    /// The VAPID details transports sign requests with.
    pub fn vapid(&self) -> &VapidConfig {
        &self.vapid
    }

    fn payload_and_options(meta: &WebPushMeta) -> (Value, WebPushOptions) {
        let mut title = meta.title.clone();
        if title.is_none() && meta.body.is_none() && meta.data.is_none() {
            warn!("web push meta has no title, body, or data; defaulting title");
            title = Some("Notification".to_string());
        }

        let payload = json!({
            "title": title,
            "body": meta.body,
            "icon": meta.icon,
            "image": meta.image,
            "badge": meta.badge,
            "data": meta.data,
        });

        let options = WebPushOptions {
            ttl: meta.ttl,
            headers: meta.headers.clone().unwrap_or_default(),
        };
        (payload, options)
    }

    async fn send_one(&self, index: usize, recipient: String, meta: Meta) -> SendResult {
        let Meta::Web(web_meta) = meta else {
            return SendResult::failure(recipient, "INVALID_META_TYPE");
        };

        let Some(subscription) = Subscription::parse(&recipient) else {
            return SendResult::failure(
                format!("unparseable_sub_at_index_{index}"),
                "INVALID_SUBSCRIPTION_STRING",
            );
        };

        let (payload, options) = Self::payload_and_options(&web_meta);
        let body = payload.to_string();

        debug!(
            endpoint = %crate::telemetry::redact(&subscription.endpoint),
            "sending web push"
        );
        match self.transport.send(&subscription, body.as_bytes(), &options).await {
            Ok(response) => SendResult::success(recipient, response),
            Err(err) => SendResult::failure(recipient, error_key(err.code_str(), &err.message)),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebPushAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Web
    }

    async fn send(&self, recipients: &[String], metas: &[Meta]) -> Vec<SendResult> {
        send_batch(recipients, metas, &self.limiter, self.concurrency, |i, recipient, meta| {
            self.send_one(i, recipient, meta)
        })
        .await
    }
}
