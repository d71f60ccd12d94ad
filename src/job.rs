//! The unit of work handed from producer to worker.

use serde::{Deserialize, Serialize};

use crate::error::InvalidJobError;
use crate::types::{ChannelKind, Meta};

/// Default stats hash key when neither job nor worker override it.
pub const DEFAULT_TRACKING_KEY: &str = "notifications:stats";

fn default_tracking_key() -> String {
    DEFAULT_TRACKING_KEY.to_string()
}

/// One queued unit bundling up to `batch_size` recipients for a single
/// channel.
///
/// Wire shape (what the queue persists):
///
/// ```json
/// { "userIds": ["a@x"], "channel": "email",
///   "meta": [{"channel": "email", "subject": "S"}],
///   "trackResponses": true, "trackingKey": "notifications:stats",
///   "campaignId": "spring-launch" }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Ordered recipient identifiers; interpretation is channel-specific
    /// (email address, push token, chat id, serialized subscription).
    pub user_ids: Vec<String>,
    /// Channel selecting the adapter in the worker.
    pub channel: ChannelKind,
    /// Channel-specific metadata, index-aligned with `user_ids`.
    pub meta: Vec<Meta>,
    /// When true, the worker writes per-recipient outcomes to the stats
    /// hash.
    #[serde(default)]
    pub track_responses: bool,
    /// Stats hash key under which outcome counters accumulate.
    #[serde(default = "default_tracking_key")]
    pub tracking_key: String,
    /// Logical grouping used for cooperative cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

impl Job {
    /// Structural validation applied by the worker before dispatch.
    pub fn validate(&self) -> Result<(), InvalidJobError> {
        if self.user_ids.is_empty() {
            return Err(InvalidJobError("userIds must be a non-empty array".into()));
        }
        if self.meta.is_empty() {
            return Err(InvalidJobError("meta must be a non-empty array".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmailMeta;
    use serde_json::json;

    fn email_job() -> Job {
        Job {
            user_ids: vec!["a@x".into(), "b@x".into()],
            channel: ChannelKind::Email,
            meta: vec![
                Meta::Email(EmailMeta { subject: Some("S1".into()), ..Default::default() }),
                Meta::Email(EmailMeta { subject: Some("S2".into()), ..Default::default() }),
            ],
            track_responses: true,
            tracking_key: DEFAULT_TRACKING_KEY.into(),
            campaign_id: Some("c1".into()),
        }
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let value = serde_json::to_value(email_job()).unwrap();
        assert_eq!(value["userIds"], json!(["a@x", "b@x"]));
        assert_eq!(value["channel"], "email");
        assert_eq!(value["trackResponses"], true);
        assert_eq!(value["trackingKey"], DEFAULT_TRACKING_KEY);
        assert_eq!(value["campaignId"], "c1");
        assert_eq!(value["meta"][0]["channel"], "email");
    }

    #[test]
    fn defaults_fill_in_on_decode() {
        let job: Job = serde_json::from_value(json!({
            "userIds": ["tok1"],
            "channel": "firebase",
            "meta": [{"channel": "firebase", "title": "T", "body": "B"}]
        }))
        .unwrap();
        assert!(!job.track_responses);
        assert_eq!(job.tracking_key, DEFAULT_TRACKING_KEY);
        assert!(job.campaign_id.is_none());
    }

    #[test]
    fn validation_rejects_empty_user_ids() {
        let mut job = email_job();
        job.user_ids.clear();
        assert!(job.validate().is_err());

        let mut job = email_job();
        job.meta.clear();
        assert!(job.validate().is_err());

        assert!(email_job().validate().is_ok());
    }
}
