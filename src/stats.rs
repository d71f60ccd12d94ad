//! Outcome counters in the shared store.
//!
//! Tracking must never fail a send: every store error in here is logged and
//! swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::store::Store;
use crate::types::{SendResult, SendStatus};

/// Counter fallback when a failed result carries no error key.
const UNKNOWN_ERROR: &str = "error:UNKNOWN_ERROR";
/// Counter for response payloads the tracker cannot classify.
const INVALID_FORMAT: &str = "error:invalid_response_format";

/// Accumulates per-recipient outcome counters under a tracking key.
#[derive(Clone)]
pub struct StatsTracker {
    store: Arc<dyn Store>,
}

impl StatsTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Counter name for one result: `success`, `error:<body>`, or the
    /// unknown-error fallback.
    pub fn counter_name(result: &SendResult) -> String {
        match result.status {
            SendStatus::Success => "success".to_string(),
            SendStatus::Error => match result.error.as_deref() {
                Some(body) if !body.is_empty() => format!("error:{body}"),
                _ => UNKNOWN_ERROR.to_string(),
            },
        }
    }

    /// Record one batch of typed results as a single atomic pipeline.
    pub async fn record_results(&self, tracking_key: &str, results: &[SendResult]) {
        if results.is_empty() {
            return;
        }
        let mut counters: HashMap<String, i64> = HashMap::new();
        for result in results {
            *counters.entry(Self::counter_name(result)).or_insert(0) += 1;
        }
        self.apply(tracking_key, counters).await;
    }

    /// Record an untyped response payload, classifying by shape:
    /// a sequence counts per item, an object with `success: false` counts
    /// one error, anything else counts one `invalid_response_format`.
    /// Null and empty sequences write nothing.
    pub async fn record_value(&self, tracking_key: &str, response: &Value) {
        let mut counters: HashMap<String, i64> = HashMap::new();
        match response {
            Value::Null => return,
            Value::Array(items) => {
                if items.is_empty() {
                    return;
                }
                for item in items {
                    *counters.entry(classify_item(item)).or_insert(0) += 1;
                }
            }
            Value::Object(map) => {
                if map.get("success") == Some(&Value::Bool(false)) {
                    let name = map
                        .get("error")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(|body| format!("error:{body}"))
                        .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                    *counters.entry(name).or_insert(0) += 1;
                } else {
                    warn!(tracking_key, "unrecognized response shape, counting as invalid");
                    *counters.entry(INVALID_FORMAT.to_string()).or_insert(0) += 1;
                }
            }
            other => {
                warn!(tracking_key, shape = ?other, "unrecognized response shape, counting as invalid");
                *counters.entry(INVALID_FORMAT.to_string()).or_insert(0) += 1;
            }
        }
        self.apply(tracking_key, counters).await;
    }

    /// Record one error counter for a failure that happened outside the
    /// per-recipient result path (unknown channel, adapter panic).
    pub async fn record_error(&self, tracking_key: &str, message: &str) {
        let mut counters = HashMap::new();
        counters.insert(format!("error:{message}"), 1);
        self.apply(tracking_key, counters).await;
    }

    /// Read the whole stats hash; an empty map on read failure.
    pub async fn get_stats(&self, tracking_key: &str) -> HashMap<String, u64> {
        match self.store.hgetall(tracking_key).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(tracking_key, err = %err, "stats read failed");
                HashMap::new()
            }
        }
    }

    /// Delete the stats hash. Errors are logged and swallowed.
    pub async fn reset_stats(&self, tracking_key: &str) {
        if let Err(err) = self.store.del(tracking_key).await {
            warn!(tracking_key, err = %err, "stats reset failed");
        } else {
            debug!(tracking_key, "stats reset");
        }
    }

    async fn apply(&self, tracking_key: &str, counters: HashMap<String, i64>) {
        if counters.is_empty() {
            return;
        }
        let incrs: Vec<(String, i64)> = counters.into_iter().collect();
        if let Err(err) = self.store.hincr_many(tracking_key, &incrs).await {
            warn!(tracking_key, err = %err, "stats update failed, dropping increments");
        }
    }
}

fn classify_item(item: &Value) -> String {
    match item.get("status").and_then(Value::as_str) {
        Some("success") => "success".to_string(),
        _ => item
            .get("error")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|body| format!("error:{body}"))
            .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn tracker() -> (StatsTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (StatsTracker::new(store.clone()), store)
    }

    #[tokio::test]
    async fn typed_results_count_success_and_errors() {
        let (tracker, _store) = tracker();
        let results = vec![
            SendResult::success("a", json!("ok")),
            SendResult::success("b", json!("ok")),
            SendResult::failure("c", "550:user_unknown"),
            SendResult::failure("d", ""),
        ];
        tracker.record_results("k", &results).await;

        let stats = tracker.get_stats("k").await;
        assert_eq!(stats["success"], 2);
        assert_eq!(stats["error:550:user_unknown"], 1);
        assert_eq!(stats["error:UNKNOWN_ERROR"], 1);
        let total: u64 = stats.values().sum();
        assert_eq!(total, results.len() as u64);
    }

    #[tokio::test]
    async fn raw_sequence_counts_every_item() {
        let (tracker, _store) = tracker();
        tracker
            .record_value(
                "k",
                &json!([
                    {"status": "success"},
                    {"status": "error", "error": "X"},
                    {"status": "error"},
                    "garbage"
                ]),
            )
            .await;

        let stats = tracker.get_stats("k").await;
        let total: u64 = stats.values().sum();
        assert_eq!(total, 4);
        assert_eq!(stats["success"], 1);
        assert_eq!(stats["error:X"], 1);
        assert_eq!(stats["error:UNKNOWN_ERROR"], 2);
    }

    #[tokio::test]
    async fn single_failure_object_counts_one_error() {
        let (tracker, _store) = tracker();
        tracker.record_value("k", &json!({"success": false, "error": "BOOM"})).await;
        assert_eq!(tracker.get_stats("k").await["error:BOOM"], 1);
    }

    #[tokio::test]
    async fn unrecognized_shapes_count_invalid_format() {
        let (tracker, _store) = tracker();
        tracker.record_value("k", &json!({"ok": true})).await;
        tracker.record_value("k", &json!(42)).await;
        assert_eq!(tracker.get_stats("k").await["error:invalid_response_format"], 2);
    }

    #[tokio::test]
    async fn null_and_empty_write_nothing() {
        let (tracker, _store) = tracker();
        tracker.record_value("k", &Value::Null).await;
        tracker.record_value("k", &json!([])).await;
        tracker.record_results("k", &[]).await;
        assert!(tracker.get_stats("k").await.is_empty());
    }

    #[tokio::test]
    async fn reset_then_get_is_empty() {
        let (tracker, _store) = tracker();
        tracker.record_results("k", &[SendResult::success("a", json!("ok"))]).await;
        tracker.reset_stats("k").await;
        assert!(tracker.get_stats("k").await.is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn hincr_many(&self, _: &str, _: &[(String, i64)]) -> Result<(), StoreError> {
            Err(StoreError::Connect("down".into()))
        }
        async fn hgetall(
            &self,
            _: &str,
        ) -> Result<std::collections::HashMap<String, u64>, StoreError> {
            Err(StoreError::Connect("down".into()))
        }
        async fn del(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Connect("down".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Connect("down".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Connect("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let tracker = StatsTracker::new(Arc::new(BrokenStore));
        tracker.record_results("k", &[SendResult::success("a", json!("ok"))]).await;
        tracker.record_error("k", "boom").await;
        tracker.reset_stats("k").await;
        assert!(tracker.get_stats("k").await.is_empty());
    }
}
