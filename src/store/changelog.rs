// package-restore/src/store/changelog.rs
use async_trait::async_trait;
use aws_sdk_sqs as sqs;
use chrono::Utc;

use crate::errors::{RestoreError, Result};
use crate::models::changelog::{ChangelogEvent, ChangelogMessage};
use crate::store::{sdk_error_message, ChangelogStore};

/// Sends restore events to the dataset changelog jobs queue.
pub struct SqsChangelogStore {
    client: sqs::Client,
    queue_url: String,
}

impl SqsChangelogStore {
    pub fn new(client: sqs::Client, queue_url: String) -> Self {
        SqsChangelogStore { client, queue_url }
    }
}

#[async_trait]
impl ChangelogStore for SqsChangelogStore {
    async fn log_restores(
        &self,
        org_id: i64,
        dataset_id: i64,
        user_id: &str,
        events: Vec<ChangelogEvent>,
    ) -> Result<()> {
        let count = events.len();
        let message = ChangelogMessage::restores(org_id, dataset_id, user_id, events, Utc::now());
        let body = serde_json::to_string(&message)?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| {
                RestoreError::Sqs(format!(
                    "error sending restore changelog events to queue {}: {}",
                    self.queue_url,
                    sdk_error_message(e)
                ))
            })?;
        tracing::debug!(
            org_id,
            dataset_id,
            count,
            trace_id = %message.dataset_changelog_event_job.trace_id,
            "sent restore changelog events"
        );
        Ok(())
    }
}
