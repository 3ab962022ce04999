use std::collections::HashMap;

use serde_json::{Value, json};

use beacon_common::types::{DispatchJob, Priority};

/// Title used when a job arrives without one.
pub const DEFAULT_TITLE: &str = "Notification";

/// Value of the `source` data key when the producer did not set one.
pub const DEFAULT_SOURCE: &str = "beacon-worker";

/// Android notification channel every message is posted to.
const ANDROID_CHANNEL_ID: &str = "default";

/// Provider-independent payload shared by every token of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
    pub priority: Priority,
    /// Collapse/thread key so repeated sends replace each other on device
    pub correlation_id: String,
}

impl PushMessage {
    /// Build the payload for a job, filling in the display defaults.
    pub fn from_job(job: &DispatchJob) -> Self {
        let title = if job.title.trim().is_empty() {
            DEFAULT_TITLE.to_string()
        } else {
            job.title.clone()
        };

        let mut data = job.data.clone();
        data.entry("source".to_string())
            .or_insert_with(|| DEFAULT_SOURCE.to_string());
        data.entry("job_id".to_string())
            .or_insert_with(|| job.id.clone());

        Self {
            title,
            body: job.body.clone(),
            data,
            priority: job.priority,
            correlation_id: job.correlation_key().to_string(),
        }
    }

    /// FCM HTTP v1 request body addressed to a single token.
    pub fn to_fcm_request(&self, token: &str) -> Value {
        let (android_priority, apns_priority) = match self.priority {
            Priority::High => ("HIGH", "10"),
            Priority::Normal => ("NORMAL", "5"),
        };

        json!({
            "message": {
                "token": token,
                "notification": {
                    "title": self.title,
                    "body": self.body,
                },
                "data": self.data,
                "android": {
                    "priority": android_priority,
                    "collapse_key": self.correlation_id,
                    "notification": {
                        "channel_id": ANDROID_CHANNEL_ID,
                        "tag": self.correlation_id,
                    },
                },
                "apns": {
                    "headers": {
                        "apns-priority": apns_priority,
                        "apns-collapse-id": self.correlation_id,
                    },
                    "payload": {
                        "aps": {
                            "thread-id": self.correlation_id,
                        },
                    },
                },
            }
        })
    }
}
