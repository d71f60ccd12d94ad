//! Chat messages through the Telegram Bot API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::ChannelAdapter;
use crate::batch::send_batch;
use crate::error::{error_key, ConfigError, TransportError};
use crate::limiter::MinTime;
use crate::types::{ChannelKind, Meta, SendResult, TelegramMeta};

/// Default sends per second for the telegram channel.
const DEFAULT_RATE_PER_SECOND: u32 = 25;
/// Default concurrent sends for the telegram channel.
const DEFAULT_CONCURRENCY: usize = 5;
/// Applied when the meta does not override formatting.
const DEFAULT_PARSE_MODE: &str = "HTML";

/// The Bot API boundary. Returns the API's message object, which exposes
/// `message_id`.
#[async_trait]
pub trait TelegramTransport: Send + Sync {
    async fn send_message(&self, chat_id: &str, payload: &Value) -> Result<Value, TransportError>;
}

/// Telegram channel settings.
#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub rate_per_second: u32,
    pub concurrency: usize,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// reqwest-backed Bot API transport.
pub struct BotApiTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl BotApiTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self, ConfigError> {
        Self::with_base_url(config, "https://api.telegram.org")
    }

    /// Point at a different API origin. Intended for tests.
    pub fn with_base_url(config: &TelegramConfig, base_url: &str) -> Result<Self, ConfigError> {
        if config.bot_token.is_empty() {
            return Err(ConfigError::MissingField("telegram bot token"));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: format!(
                "{}/bot{}/sendMessage",
                base_url.trim_end_matches('/'),
                config.bot_token
            ),
        })
    }
}

#[async_trait]
impl TelegramTransport for BotApiTransport {
    async fn send_message(&self, chat_id: &str, payload: &Value) -> Result<Value, TransportError> {
        let mut body = payload.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert("chat_id".into(), Value::String(chat_id.to_string()));
        }

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        // The Bot API reports failure both via HTTP status and the `ok`
        // envelope field; trust the envelope when present.
        let ok = body.get("ok").and_then(Value::as_bool).unwrap_or(status.is_success());
        if ok {
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }

        let code = body
            .get("error_code")
            .and_then(Value::as_i64)
            .map(|c| c.to_string())
            .unwrap_or_else(|| status.as_u16().to_string());
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("request rejected")
            .to_string();
        Err(TransportError::with_code(code, description))
    }
}

/// Telegram channel adapter.
pub struct TelegramAdapter {
    transport: Arc<dyn TelegramTransport>,
    limiter: MinTime,
    concurrency: usize,
}

impl TelegramAdapter {
    /// Build an adapter over an explicit transport.
    pub fn with_transport(
        config: &TelegramConfig,
        transport: Arc<dyn TelegramTransport>,
    ) -> Result<Self, ConfigError> {
        let limiter = MinTime::per_second(config.rate_per_second, config.concurrency)?;
        Ok(Self { transport, limiter, concurrency: config.concurrency })
    }

    /// Build an adapter over the built-in Bot API transport.
    pub fn new(config: &TelegramConfig) -> Result<Self, ConfigError> {
        let transport = Arc::new(BotApiTransport::new(config)?);
        Self::with_transport(config, transport)
    }

    fn assemble(meta: &TelegramMeta) -> Result<Value, String> {
        let text = match meta.text.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => return Err("MISSING_TEXT".to_string()),
        };

        let mut payload = serde_json::Map::new();
        payload.insert("text".into(), Value::String(text.to_string()));
        payload.insert(
            "parse_mode".into(),
            Value::String(meta.parse_mode.clone().unwrap_or_else(|| DEFAULT_PARSE_MODE.to_string())),
        );
        for (key, value) in &meta.extra {
            payload.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(payload))
    }

    async fn send_one(&self, recipient: String, meta: Meta) -> SendResult {
        let Meta::Telegram(telegram_meta) = meta else {
            return SendResult::failure(recipient, "INVALID_META_TYPE");
        };

        let payload = match Self::assemble(&telegram_meta) {
            Ok(payload) => payload,
            Err(key) => return SendResult::failure(recipient, key),
        };

        debug!(recipient = %crate::telemetry::redact(&recipient), "sending telegram message");
        match self.transport.send_message(&recipient, &payload).await {
            Ok(message) => SendResult::success(recipient, message),
            Err(err) => SendResult::failure(recipient, error_key(err.code_str(), &err.message)),
        }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn send(&self, recipients: &[String], metas: &[Meta]) -> Vec<SendResult> {
        send_batch(recipients, metas, &self.limiter, self.concurrency, |_, recipient, meta| {
            self.send_one(recipient, meta)
        })
        .await
    }
}
