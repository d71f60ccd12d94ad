//! Transactional email over SMTP.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as LettreAttachment, Body, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::ChannelAdapter;
use crate::batch::send_batch;
use crate::error::{error_key, ConfigError, TransportError};
use crate::limiter::MinTime;
use crate::types::{ChannelKind, EmailMeta, Meta, SendResult};

/// Default sends per second for the email channel.
const DEFAULT_RATE_PER_SECOND: u32 = 10;
/// Default concurrent sends for the email channel.
const DEFAULT_CONCURRENCY: usize = 3;
/// SMTP connection pool cap.
const SMTP_POOL_MAX: u32 = 5;

/// A fully assembled outbound email, as handed to the transport.
#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    /// HTML body wins over text; at most one of the two is set.
    pub html: Option<String>,
    pub text: Option<String>,
    /// Decoded attachments: (filename, content type, bytes).
    pub attachments: Vec<(String, String, Vec<u8>)>,
    /// Message-ID assigned before handing off to the transport.
    pub message_id: String,
}

/// Transport acknowledgement for one accepted message.
#[derive(Clone, Debug)]
pub struct EmailReceipt {
    pub message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

/// The SMTP boundary the email adapter talks through.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<EmailReceipt, TransportError>;
}

/// SMTP server settings for the built-in lettre transport.
#[derive(Clone, Debug)]
pub struct EmailConfig {
    /// Sender mailbox, e.g. `"Notifications <no-reply@example.com>"`.
    pub sender: String,
    pub host: String,
    /// Overrides the scheme's default port when set.
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Use STARTTLS on the submission port instead of implicit TLS.
    pub starttls: bool,
    pub rate_per_second: u32,
    pub concurrency: usize,
}

impl EmailConfig {
    /// Settings for `sender` relayed through `host`, with channel defaults.
    pub fn new(sender: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            host: host.into(),
            port: None,
            username: None,
            password: None,
            starttls: false,
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Set SMTP credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// lettre-backed SMTP transport with a bounded connection pool.
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Connect settings are validated eagerly; the pool connects lazily.
    pub fn new(config: &EmailConfig) -> Result<Self, ConfigError> {
        if config.host.is_empty() {
            return Err(ConfigError::MissingField("smtp host"));
        }
        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        }
        .map_err(|e| ConfigError::InvalidCredentials(e.to_string()))?;

        if let Some(port) = config.port {
            builder = builder.port(port);
        }
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let inner = builder.pool_config(PoolConfig::new().max_size(SMTP_POOL_MAX)).build();
        Ok(Self { inner })
    }
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn send(&self, message: EmailMessage) -> Result<EmailReceipt, TransportError> {
        let to = message.to.clone();
        let message_id = message.message_id.clone();
        let email = build_lettre_message(message)?;

        self.inner.send(email).await.map_err(|err| TransportError {
            code: err.status().map(|code| code.to_string()),
            message: err.to_string(),
        })?;

        Ok(EmailReceipt { message_id, accepted: vec![to], rejected: Vec::new() })
    }
}

fn build_lettre_message(message: EmailMessage) -> Result<Message, TransportError> {
    let from: Mailbox = message
        .from
        .parse()
        .map_err(|_| TransportError::with_code("EADDRESS", format!("invalid sender {}", message.from)))?;
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|_| TransportError::with_code("EADDRESS", format!("invalid recipient {}", message.to)))?;

    let builder = Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone())
        .message_id(Some(message.message_id.clone()));

    let body_part = match (&message.html, &message.text) {
        (Some(html), _) => SinglePart::html(html.clone()),
        (None, Some(text)) => SinglePart::plain(text.clone()),
        (None, None) => SinglePart::plain(String::new()),
    };

    let built = if message.attachments.is_empty() {
        builder.singlepart(body_part)
    } else {
        let mut multipart = MultiPart::mixed().singlepart(body_part);
        for (filename, content_type, bytes) in message.attachments {
            let ct = ContentType::parse(&content_type).map_err(|_| {
                TransportError::with_code("EATTACHMENT", format!("bad content type {content_type}"))
            })?;
            multipart = multipart.singlepart(LettreAttachment::new(filename).body(Body::new(bytes), ct));
        }
        builder.multipart(multipart)
    };

    built.map_err(|e| TransportError::with_code("EMESSAGE", e.to_string()))
}

/// Email channel adapter.
pub struct EmailAdapter {
    transport: Arc<dyn EmailTransport>,
    limiter: MinTime,
    concurrency: usize,
    sender: String,
    sender_domain: String,
}

impl EmailAdapter {
    /// Build an adapter over an explicit transport (a mock in tests, or a
    /// custom SMTP stack).
    pub fn with_transport(
        config: &EmailConfig,
        transport: Arc<dyn EmailTransport>,
    ) -> Result<Self, ConfigError> {
        if config.sender.is_empty() {
            return Err(ConfigError::MissingField("email sender"));
        }
        let mailbox: Mailbox = config
            .sender
            .parse()
            .map_err(|_| ConfigError::InvalidCredentials(format!("invalid sender {}", config.sender)))?;
        let sender_domain =
            mailbox.email.to_string().rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_else(
                || "localhost".to_string(),
            );
        let limiter = MinTime::per_second(config.rate_per_second, config.concurrency)?;
        Ok(Self {
            transport,
            limiter,
            concurrency: config.concurrency,
            sender: config.sender.clone(),
            sender_domain,
        })
    }

    /// Build an adapter over the built-in lettre SMTP transport.
    pub fn new(config: &EmailConfig) -> Result<Self, ConfigError> {
        let transport = Arc::new(SmtpTransport::new(config)?);
        Self::with_transport(config, transport)
    }

    fn assemble(&self, to: &str, meta: &EmailMeta) -> Result<EmailMessage, String> {
        let subject = match meta.subject.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Err("MISSING_SUBJECT".to_string()),
        };

        let mut attachments = Vec::with_capacity(meta.attachments.len());
        for att in &meta.attachments {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&att.content)
                .map_err(|e| error_key("EATTACHMENT", &e.to_string()))?;
            let content_type =
                att.content_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
            attachments.push((att.filename.clone(), content_type, bytes));
        }

        // Prefer HTML; never set both bodies at once.
        let (html, text) = match (&meta.html, &meta.text) {
            (Some(html), _) => (Some(html.clone()), None),
            (None, text) => (None, text.clone()),
        };

        Ok(EmailMessage {
            from: self.sender.clone(),
            to: to.to_string(),
            subject,
            html,
            text,
            attachments,
            message_id: format!("<{}@{}>", Uuid::new_v4(), self.sender_domain),
        })
    }

    async fn send_one(&self, recipient: String, meta: Meta) -> SendResult {
        let Meta::Email(email_meta) = meta else {
            return SendResult::failure(recipient, "INVALID_META_TYPE");
        };

        let message = match self.assemble(&recipient, &email_meta) {
            Ok(message) => message,
            Err(key) => return SendResult::failure(recipient, key),
        };

        debug!(recipient = %crate::telemetry::redact(&recipient), "sending email");
        match self.transport.send(message).await {
            Ok(receipt) => SendResult::success(
                recipient,
                json!({
                    "message_id": receipt.message_id,
                    "accepted": receipt.accepted,
                    "rejected": receipt.rejected,
                }),
            ),
            Err(err) => SendResult::failure(recipient, error_key(err.code_str(), &err.message)),
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, recipients: &[String], metas: &[Meta]) -> Vec<SendResult> {
        send_batch(recipients, metas, &self.limiter, self.concurrency, |_, recipient, meta| {
            self.send_one(recipient, meta)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attachment;
    use parking_lot::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<EmailMessage>>,
        fail: Option<TransportError>,
    }

    impl RecordingTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: None })
        }

        fn failing(err: TransportError) -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: Some(err) })
        }
    }

    #[async_trait]
    impl EmailTransport for RecordingTransport {
        async fn send(&self, message: EmailMessage) -> Result<EmailReceipt, TransportError> {
            let to = message.to.clone();
            let id = message.message_id.clone();
            self.sent.lock().push(message);
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(EmailReceipt { message_id: id, accepted: vec![to], rejected: vec![] }),
            }
        }
    }

    fn config() -> EmailConfig {
        EmailConfig::new("Notify <no-reply@example.com>", "smtp.example.com")
    }

    fn subject_meta(subject: &str, text: &str) -> Meta {
        Meta::Email(EmailMeta {
            subject: Some(subject.into()),
            text: Some(text.into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn happy_path_batch() {
        let transport = RecordingTransport::ok();
        let adapter = EmailAdapter::with_transport(&config(), transport.clone()).unwrap();

        let results = adapter
            .send(
                &["a@x".into(), "b@x".into()],
                &[subject_meta("S1", "T1"), subject_meta("S2", "T2")],
            )
            .await;

        assert_eq!(results.len(), 2);
        for (result, recipient) in results.iter().zip(["a@x", "b@x"]) {
            assert!(result.is_success());
            assert_eq!(result.recipient, recipient);
            assert!(result.response.as_ref().unwrap()["message_id"].as_str().unwrap().contains("@example.com"));
        }
        assert_eq!(transport.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn missing_subject_never_reaches_transport() {
        let transport = RecordingTransport::ok();
        let adapter = EmailAdapter::with_transport(&config(), transport.clone()).unwrap();

        let meta = Meta::Email(EmailMeta { text: Some("only".into()), ..Default::default() });
        let results = adapter.send(&["a@x".into()], &[meta]).await;

        assert_eq!(results[0].error.as_deref(), Some("MISSING_SUBJECT"));
        assert_eq!(results[0].recipient, "a@x");
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn html_wins_over_text() {
        let transport = RecordingTransport::ok();
        let adapter = EmailAdapter::with_transport(&config(), transport.clone()).unwrap();

        let meta = Meta::Email(EmailMeta {
            subject: Some("S".into()),
            text: Some("plain".into()),
            html: Some("<b>rich</b>".into()),
            ..Default::default()
        });
        adapter.send(&["a@x".into()], &[meta]).await;

        let sent = transport.sent.lock();
        assert_eq!(sent[0].html.as_deref(), Some("<b>rich</b>"));
        assert!(sent[0].text.is_none());
    }

    #[tokio::test]
    async fn transport_errors_become_error_keys() {
        let transport =
            RecordingTransport::failing(TransportError::with_code("550", "user unknown. (mailbox)"));
        let adapter = EmailAdapter::with_transport(&config(), transport).unwrap();

        let results = adapter.send(&["a@x".into()], &[subject_meta("S", "T")]).await;
        assert_eq!(results[0].error.as_deref(), Some("550:user_unknown_mailbox"));
    }

    #[tokio::test]
    async fn bad_attachment_encoding_fails_the_recipient() {
        let transport = RecordingTransport::ok();
        let adapter = EmailAdapter::with_transport(&config(), transport.clone()).unwrap();

        let meta = Meta::Email(EmailMeta {
            subject: Some("S".into()),
            attachments: vec![Attachment {
                filename: "a.bin".into(),
                content_type: None,
                content: "%%not-base64%%".into(),
            }],
            ..Default::default()
        });
        let results = adapter.send(&["a@x".into()], &[meta]).await;

        assert!(results[0].error.as_deref().unwrap().starts_with("EATTACHMENT:"));
        assert!(transport.sent.lock().is_empty());
    }

    #[test]
    fn empty_sender_is_a_config_error() {
        let mut cfg = config();
        cfg.sender = String::new();
        assert!(EmailAdapter::with_transport(&cfg, RecordingTransport::ok()).is_err());
    }
}
