//! Adapter-agnostic batch orchestration: validates inputs, schedules
//! per-recipient sends through a channel limiter, and yields positional
//! results.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::limiter::MinTime;
use crate::types::{Meta, SendResult};

/// Synthetic recipient used when the input slot held no usable recipient.
pub(crate) fn invalid_recipient_at(index: usize) -> String {
    format!("invalid_recipient_at_index_{index}")
}

/// Fan out one job's recipients through `send_one`, returning one result
/// per input slot in input order.
///
/// Guarantees, regardless of completion order or failures inside
/// `send_one`:
/// - the output length equals `recipients.len()`;
/// - the i-th result refers to the i-th input;
/// - panics inside `send_one` become `INTERNAL_SEND_ERROR` results;
/// - at most `concurrency` sends are in flight at once, each paced by
///   `limiter`.
pub async fn send_batch<F, Fut>(
    recipients: &[String],
    metas: &[Meta],
    limiter: &MinTime,
    concurrency: usize,
    send_one: F,
) -> Vec<SendResult>
where
    F: Fn(usize, String, Meta) -> Fut,
    Fut: Future<Output = SendResult>,
{
    let total = recipients.len();
    let mut slots: Vec<Option<SendResult>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);
    let mut skipped = 0usize;

    let mut in_flight = FuturesUnordered::new();
    let concurrency = concurrency.max(1);

    for (i, recipient) in recipients.iter().enumerate() {
        if recipient.trim().is_empty() {
            slots[i] = Some(SendResult::failure(invalid_recipient_at(i), "Invalid recipient data"));
            skipped += 1;
            continue;
        }
        let Some(meta) = metas.get(i) else {
            slots[i] = Some(SendResult::failure(recipient.clone(), "Missing meta for recipient"));
            skipped += 1;
            continue;
        };

        let recipient = recipient.clone();
        let meta = meta.clone();
        let task = &send_one;
        in_flight.push(async move {
            let scheduled = limiter
                .schedule(AssertUnwindSafe(task(i, recipient.clone(), meta)).catch_unwind())
                .await;
            let result = match scheduled {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => SendResult::failure_with_response(
                    recipient,
                    "INTERNAL_SEND_ERROR",
                    Value::String(panic_message(panic)),
                ),
                Err(_) => SendResult::failure(recipient, "CANCELLED"),
            };
            (i, result)
        });

        // Keep at most `concurrency` tasks outstanding.
        if in_flight.len() >= concurrency {
            if let Some((slot, result)) = in_flight.next().await {
                slots[slot] = Some(result);
            }
        }
    }

    while let Some((slot, result)) = in_flight.next().await {
        slots[slot] = Some(result);
    }

    let mut success = 0usize;
    let mut failed = 0usize;
    let results: Vec<SendResult> = slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            let result = slot.unwrap_or_else(|| {
                warn!(index = i, "send task never settled, marking slot as skipped");
                SendResult::failure(
                    recipients.get(i).cloned().unwrap_or_else(|| invalid_recipient_at(i)),
                    "PROCESSING_ERROR_OR_SKIPPED",
                )
            });
            if result.is_success() {
                success += 1;
            } else {
                failed += 1;
            }
            result
        })
        .collect();

    info!(
        success_count = success,
        failure_count = failed.saturating_sub(skipped),
        skipped_count = skipped,
        total_attempted = total,
        "batch send complete"
    );

    results
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "send task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EmailMeta, SendStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn meta() -> Meta {
        Meta::Email(EmailMeta { subject: Some("S".into()), ..Default::default() })
    }

    fn limiter() -> MinTime {
        MinTime::per_second(10_000, 16).unwrap()
    }

    #[tokio::test]
    async fn results_are_positional() {
        let recipients: Vec<String> = (0..6).map(|i| format!("user{i}@x")).collect();
        let metas: Vec<Meta> = (0..6).map(|_| meta()).collect();
        let limiter = limiter();

        let results = send_batch(&recipients, &metas, &limiter, 3, |i, recipient, _| async move {
            // Finish out of order.
            tokio::time::sleep(Duration::from_millis((6 - i as u64) * 5)).await;
            SendResult::success(recipient, json!({"index": i}))
        })
        .await;

        assert_eq!(results.len(), 6);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.recipient, format!("user{i}@x"));
            assert_eq!(result.response.as_ref().unwrap()["index"], json!(i));
        }
    }

    #[tokio::test]
    async fn invalid_recipients_are_skipped_without_sending() {
        let recipients = vec!["a@x".to_string(), "".to_string(), "  ".to_string()];
        let metas = vec![meta(), meta(), meta()];
        let limiter = limiter();
        let sends = Arc::new(AtomicUsize::new(0));

        let sends_in = sends.clone();
        let results = send_batch(&recipients, &metas, &limiter, 5, move |_, recipient, _| {
            let sends = sends_in.clone();
            async move {
                sends.fetch_add(1, Ordering::SeqCst);
                SendResult::success(recipient, json!("ok"))
            }
        })
        .await;

        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(results[1].recipient, "invalid_recipient_at_index_1");
        assert_eq!(results[1].error.as_deref(), Some("Invalid recipient data"));
        assert_eq!(results[2].recipient, "invalid_recipient_at_index_2");
    }

    #[tokio::test]
    async fn missing_meta_fails_the_slot() {
        let recipients = vec!["a@x".to_string(), "b@x".to_string()];
        let metas = vec![meta()];
        let limiter = limiter();

        let results = send_batch(&recipients, &metas, &limiter, 5, |_, recipient, _| async move {
            SendResult::success(recipient, json!("ok"))
        })
        .await;

        assert_eq!(results[0].status, SendStatus::Success);
        assert_eq!(results[1].error.as_deref(), Some("Missing meta for recipient"));
        assert_eq!(results[1].recipient, "b@x");
    }

    #[tokio::test]
    async fn panics_become_internal_send_errors() {
        let recipients = vec!["a@x".to_string(), "b@x".to_string()];
        let metas = vec![meta(), meta()];
        let limiter = limiter();

        let results = send_batch(&recipients, &metas, &limiter, 2, |i, recipient, _| async move {
            if i == 0 {
                panic!("transport exploded");
            }
            SendResult::success(recipient, json!("ok"))
        })
        .await;

        assert_eq!(results[0].error.as_deref(), Some("INTERNAL_SEND_ERROR"));
        assert_eq!(results[0].response, Some(json!("transport exploded")));
        assert!(results[1].is_success());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let recipients: Vec<String> = (0..12).map(|i| format!("u{i}")).collect();
        let metas: Vec<Meta> = (0..12).map(|_| meta()).collect();
        let limiter = limiter();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (running_in, peak_in) = (running.clone(), peak.clone());
        send_batch(&recipients, &metas, &limiter, 4, move |_, recipient, _| {
            let running = running_in.clone();
            let peak = peak_in.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                SendResult::success(recipient, json!("ok"))
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 4);
    }
}
