//! Error types for the notification fan-out engine.

use thiserror::Error;

/// Maximum length of an error key stored as a stats counter name.
const MAX_ERROR_KEY_LEN: usize = 255;

/// Construction-time configuration failure. Fatal, never retried.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("rate must be greater than zero, got {0}")]
    InvalidRate(f64),

    #[error("missing required setting: {0}")]
    MissingField(&'static str),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid store url: {0}")]
    InvalidStoreUrl(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Shared store (Redis) failure. Transient; callers retry or swallow
/// depending on the call site.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store connection failed: {0}")]
    Connect(String),
}

/// Job queue failure.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("queue is closed")]
    Closed,
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Store(StoreError::Redis(err))
    }
}

/// Failure surfaced by `dispatch()` to the producing caller.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("recipient source failed after retries: {0}")]
    Source(String),

    #[error("enqueue failed after retries: {0}")]
    Enqueue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("batch handler failed: {0}")]
    Handler(String),

    #[error("dispatch cancelled")]
    Cancelled,
}

/// Job payload failed structural validation in the worker. Surfaced to the
/// queue, whose retry policy decides what happens next.
#[derive(Debug, Clone, Error)]
#[error("invalid job: {0}")]
pub struct InvalidJobError(pub String);

/// Worker start/stop failure.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Cooperative cancellation of scheduled-but-unstarted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled before execution")]
pub struct Cancelled;

/// A channel transport rejected or failed a single send.
///
/// `code` is the transport's own classification (an SMTP status, an HTTP
/// status, a Firebase error status) when one exists; adapters fold it into
/// the per-recipient error key.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", code.as_deref().unwrap_or("UNKNOWN"))]
pub struct TransportError {
    pub code: Option<String>,
    pub message: String,
}

impl TransportError {
    /// A failure with a transport-level classification code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: Some(code.into()), message: message.into() }
    }

    /// A failure the transport could not classify.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self { code: None, message: message.into() }
    }

    /// The classification code, or `"UNKNOWN"`.
    pub fn code_str(&self) -> &str {
        self.code.as_deref().unwrap_or("UNKNOWN")
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TransportError::with_code(status.as_u16().to_string(), err.to_string()),
            None if err.is_timeout() => TransportError::with_code("TIMEOUT", err.to_string()),
            None => TransportError::unclassified(err.to_string()),
        }
    }
}

/// Sanitize one segment of an error key: whitespace becomes `_`, reserved
/// punctuation is stripped.
///
/// The same table applies to every channel so that equal failures collapse
/// onto equal counter names.
pub fn sanitize_error_segment(message: &str) -> String {
    message
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if matches!(
                c,
                '.' | ':' | ';' | ',' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|'
                    | '[' | ']' | '\\'
            ) {
                None
            } else {
                Some(c)
            }
        })
        .collect()
}

/// Build a colon-delimited error key from sanitized segments, truncated to
/// 255 chars.
///
/// The result is stable and contains no whitespace, so it is safe to use as
/// a stats counter name.
pub fn compose_error_key(segments: &[&str]) -> String {
    let mut key = segments.iter().map(|s| sanitize_error_segment(s)).collect::<Vec<_>>().join(":");
    if key.len() > MAX_ERROR_KEY_LEN {
        // Truncate on a char boundary.
        let mut cut = MAX_ERROR_KEY_LEN;
        while !key.is_char_boundary(cut) {
            cut -= 1;
        }
        key.truncate(cut);
    }
    key
}

/// Build a `<code>:<sanitized-message>` error key.
pub fn error_key(code: &str, message: &str) -> String {
    compose_error_key(&[code, message])
}
