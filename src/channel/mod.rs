//! Channel adapters: the per-channel strategies that turn (recipient, meta)
//! pairs into transport calls, and the registry workers resolve them from.

mod email;
mod firebase;
mod telegram;
mod web;

pub use email::{EmailAdapter, EmailConfig, EmailMessage, EmailReceipt, EmailTransport, SmtpTransport};
pub use firebase::{
    AccessTokenProvider, FcmHttpTransport, FirebaseApp, FirebaseCredentials, PushAdapter,
    PushConfig, PushMessage, PushTransport, StaticTokenProvider,
};
pub use telegram::{BotApiTransport, TelegramAdapter, TelegramConfig, TelegramTransport};
pub use web::{
    Subscription, SubscriptionKeys, VapidConfig, WebPushAdapter, WebPushConfig, WebPushOptions,
    WebPushTransport,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::ConfigError;
use crate::types::{ChannelKind, Meta, SendResult};

/// A channel adapter: sends one job's worth of (recipient, meta) pairs and
/// reports one positional result per input.
///
/// Implementations never fail the whole batch; per-recipient problems are
/// mapped to error results.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn kind(&self) -> ChannelKind;

    /// Send to every recipient, returning results in input order.
    async fn send(&self, recipients: &[String], metas: &[Meta]) -> Vec<SendResult>;
}

/// Process-scoped mapping from channel to adapter.
///
/// Mutation is expected only at worker startup; afterwards the registry is
/// effectively read-only.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: Arc<RwLock<HashMap<ChannelKind, Arc<dyn ChannelAdapter>>>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing (and warning about) any existing one
    /// for the same channel.
    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let kind = adapter.kind();
        let previous = self.adapters.write().insert(kind, adapter);
        if previous.is_some() {
            warn!(channel = %kind, "replacing already-registered channel adapter");
        }
    }

    /// Look up the adapter for a channel.
    pub fn get(&self, kind: ChannelKind) -> Result<Arc<dyn ChannelAdapter>, ConfigError> {
        self.adapters
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownChannel(kind.to_string()))
    }

    /// Remove a channel's adapter, returning it if present.
    pub fn unregister(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.write().remove(&kind)
    }

    /// Channels currently registered.
    pub fn list(&self) -> Vec<ChannelKind> {
        self.adapters.read().keys().copied().collect()
    }

    /// Remove every adapter. Intended for tests.
    pub fn clear(&self) {
        self.adapters.write().clear();
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").field("channels", &self.list()).finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::batch::send_batch;
    use crate::limiter::MinTime;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Adapter double that records inputs and succeeds or fails everything.
    pub(crate) struct StubAdapter {
        kind: ChannelKind,
        pub(crate) calls: Mutex<Vec<Vec<String>>>,
        fail_with: Option<String>,
    }

    impl StubAdapter {
        pub(crate) fn succeeding(kind: ChannelKind) -> Self {
            Self { kind, calls: Mutex::new(Vec::new()), fail_with: None }
        }

        pub(crate) fn failing(kind: ChannelKind, error: &str) -> Self {
            Self { kind, calls: Mutex::new(Vec::new()), fail_with: Some(error.to_string()) }
        }
    }

    #[async_trait]
    impl ChannelAdapter for StubAdapter {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, recipients: &[String], metas: &[Meta]) -> Vec<SendResult> {
            self.calls.lock().push(recipients.to_vec());
            let limiter = MinTime::per_second(10_000, 16).unwrap();
            let fail = self.fail_with.clone();
            send_batch(recipients, metas, &limiter, 8, move |_, recipient, _| {
                let fail = fail.clone();
                async move {
                    match fail {
                        Some(err) => SendResult::failure(recipient, err),
                        None => SendResult::success(recipient, json!({"delivered": true})),
                    }
                }
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubAdapter;
    use super::*;

    #[test]
    fn register_get_unregister() {
        let registry = ChannelRegistry::new();
        assert!(registry.get(ChannelKind::Email).is_err());

        registry.register(Arc::new(StubAdapter::succeeding(ChannelKind::Email)));
        assert!(registry.get(ChannelKind::Email).is_ok());
        assert_eq!(registry.list(), vec![ChannelKind::Email]);

        registry.unregister(ChannelKind::Email);
        assert!(registry.get(ChannelKind::Email).is_err());
    }

    #[test]
    fn reregistration_overwrites() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(StubAdapter::succeeding(ChannelKind::Telegram)));
        let second: Arc<dyn ChannelAdapter> =
            Arc::new(StubAdapter::failing(ChannelKind::Telegram, "nope"));
        registry.register(second.clone());

        let got = registry.get(ChannelKind::Telegram).unwrap();
        assert!(Arc::ptr_eq(&got, &second));
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(StubAdapter::succeeding(ChannelKind::Web)));
        registry.clear();
        assert!(registry.list().is_empty());
    }
}
