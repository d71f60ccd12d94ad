//! Core types shared by producers, workers, and channel adapters.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// A delivery channel.
///
/// Channels are a closed set: adding one means adding a variant here and a
/// matching [`Meta`] variant, which keeps job payloads fully typed end to
/// end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Transactional email over SMTP.
    Email,
    /// Mobile push through Firebase Cloud Messaging.
    Firebase,
    /// Telegram bot messages.
    Telegram,
    /// Browser Web Push.
    Web,
}

impl ChannelKind {
    /// Stable wire name for this channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Firebase => "firebase",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Web => "web",
        }
    }

    /// All known channels.
    pub fn all() -> [ChannelKind; 4] {
        [ChannelKind::Email, ChannelKind::Firebase, ChannelKind::Telegram, ChannelKind::Web]
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(ChannelKind::Email),
            "firebase" => Ok(ChannelKind::Firebase),
            "telegram" => Ok(ChannelKind::Telegram),
            "web" => Ok(ChannelKind::Web),
            other => Err(ConfigError::UnknownChannel(other.to_string())),
        }
    }
}

/// Per-recipient message content and options, tagged by channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum Meta {
    Email(EmailMeta),
    Firebase(PushMeta),
    Telegram(TelegramMeta),
    Web(WebPushMeta),
}

impl Meta {
    /// The channel this meta belongs to.
    pub fn kind(&self) -> ChannelKind {
        match self {
            Meta::Email(_) => ChannelKind::Email,
            Meta::Firebase(_) => ChannelKind::Firebase,
            Meta::Telegram(_) => ChannelKind::Telegram,
            Meta::Web(_) => ChannelKind::Web,
        }
    }

    /// An empty meta of the given kind.
    ///
    /// Used by the producer when a single record's meta cannot be built:
    /// the slot degrades to an empty payload instead of aborting the batch.
    pub fn empty(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Email => Meta::Email(EmailMeta::default()),
            ChannelKind::Firebase => Meta::Firebase(PushMeta::default()),
            ChannelKind::Telegram => Meta::Telegram(TelegramMeta::default()),
            ChannelKind::Web => Meta::Web(WebPushMeta::default()),
        }
    }
}

/// Email message content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailMeta {
    /// Subject line. Required at send time; a missing subject fails the
    /// recipient with `MISSING_SUBJECT` without touching the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Plain-text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// HTML body. Preferred over `text` when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// File attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// A single email attachment, content base64-encoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content: String,
}

/// Mobile push content and per-platform overrides.
///
/// `title`/`body` are folded into the notification payload; the remaining
/// fields pass through to the transport untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apns: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webpush: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcm_options: Option<Value>,
}

/// Telegram message content. Unknown fields pass through to the Bot API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramMeta {
    /// Message text. Required at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Formatting mode; defaults to `"HTML"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    /// Passthrough formatting fields (`disable_notification`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Web Push notification content and request options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WebPushMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Push service TTL, seconds.
    #[serde(default, rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    /// Extra request headers (`Topic`, `Urgency`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// Outcome status of a single send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Success,
    Error,
}

/// The outcome of one send attempt, positionally aligned with its input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendResult {
    pub status: SendStatus,
    /// Echoed recipient, or a synthetic placeholder when the input was
    /// unusable (`invalid_recipient_at_index_<i>`).
    pub recipient: String,
    /// Transport response on success; structured error detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Stable error key (`<code>:<sanitized-message>`), present iff
    /// `status == Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    /// A successful send.
    pub fn success(recipient: impl Into<String>, response: Value) -> Self {
        Self {
            status: SendStatus::Success,
            recipient: recipient.into(),
            response: Some(response),
            error: None,
        }
    }

    /// A failed send with a stable error key.
    pub fn failure(recipient: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Error,
            recipient: recipient.into(),
            response: None,
            error: Some(error.into()),
        }
    }

    /// A failed send carrying extra response detail.
    pub fn failure_with_response(
        recipient: impl Into<String>,
        error: impl Into<String>,
        response: Value,
    ) -> Self {
        Self {
            status: SendStatus::Error,
            recipient: recipient.into(),
            response: Some(response),
            error: Some(error.into()),
        }
    }

    /// Whether this result is a success.
    pub fn is_success(&self) -> bool {
        self.status == SendStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_kind_round_trips() {
        for kind in ChannelKind::all() {
            assert_eq!(kind.as_str().parse::<ChannelKind>().unwrap(), kind);
        }
        assert!("pigeon".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn meta_serializes_with_channel_tag() {
        let meta = Meta::Email(EmailMeta {
            subject: Some("Hi".into()),
            text: Some("Body".into()),
            ..Default::default()
        });
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["channel"], "email");
        assert_eq!(value["subject"], "Hi");

        let back: Meta = serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.kind(), ChannelKind::Email);
    }

    #[test]
    fn telegram_meta_keeps_passthrough_fields() {
        let raw = json!({
            "channel": "telegram",
            "text": "hello",
            "disable_notification": true
        });
        let meta: Meta = serde_json::from_value(raw).unwrap();
        match &meta {
            Meta::Telegram(t) => {
                assert_eq!(t.text.as_deref(), Some("hello"));
                assert_eq!(t.extra["disable_notification"], json!(true));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn web_push_meta_uses_uppercase_ttl() {
        let raw = json!({"channel": "web", "title": "T", "TTL": 60});
        let meta: Meta = serde_json::from_value(raw).unwrap();
        match meta {
            Meta::Web(w) => assert_eq!(w.ttl, Some(60)),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn empty_meta_matches_kind() {
        for kind in ChannelKind::all() {
            assert_eq!(Meta::empty(kind).kind(), kind);
        }
    }

    #[test]
    fn send_result_shapes() {
        let ok = SendResult::success("a@x", json!({"message_id": "<1@x>"}));
        assert!(ok.is_success());
        assert!(ok.error.is_none());

        let err = SendResult::failure("a@x", "MISSING_SUBJECT");
        assert!(!err.is_success());
        assert_eq!(err.error.as_deref(), Some("MISSING_SUBJECT"));
    }
}
