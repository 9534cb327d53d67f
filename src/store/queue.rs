// package-restore/src/store/queue.rs
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_sqs as sqs;

use crate::errors::{RestoreError, Result};
use crate::models::restore::RestorePackageMessage;
use crate::store::{sdk_error_message, RestoreQueue};

/// A message as received from the restore queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

pub struct SqsRestoreQueue {
    client: sqs::Client,
    queue_url: String,
}

impl SqsRestoreQueue {
    pub fn new(client: sqs::Client, queue_url: String) -> Self {
        SqsRestoreQueue { client, queue_url }
    }

    /// Accepts either a queue URL or a queue name to resolve.
    pub async fn from_queue_name(client: sqs::Client, queue: &str) -> anyhow::Result<Self> {
        if queue.starts_with("https://") || queue.starts_with("http://") {
            return Ok(Self::new(client, queue.to_string()));
        }
        let output = client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(sdk_error_message(e)))
            .with_context(|| format!("Failed to resolve URL of queue {}", queue))?;
        let queue_url = output
            .queue_url()
            .with_context(|| format!("No URL returned for queue {}", queue))?
            .to_string();
        tracing::info!(queue, queue_url = %queue_url, "resolved restore queue");
        Ok(Self::new(client, queue_url))
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Long-polls for up to `max_messages` messages.
    pub async fn receive(
        &self,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout_seconds: Option<i32>,
    ) -> Result<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_seconds)
            .set_visibility_timeout(visibility_timeout_seconds)
            .send()
            .await
            .map_err(|e| RestoreError::Sqs(sdk_error_message(e)))?;

        let mut messages = Vec::new();
        for message in output.messages() {
            let (Some(message_id), Some(receipt_handle)) =
                (message.message_id(), message.receipt_handle())
            else {
                tracing::warn!("skipping message without id or receipt handle");
                continue;
            };
            messages.push(QueueMessage {
                message_id: message_id.to_string(),
                receipt_handle: receipt_handle.to_string(),
                body: message.body().unwrap_or_default().to_string(),
            });
        }
        Ok(messages)
    }

    pub async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| RestoreError::Sqs(sdk_error_message(e)))?;
        Ok(())
    }
}

#[async_trait]
impl RestoreQueue for SqsRestoreQueue {
    async fn send_restore_package(&self, message: &RestorePackageMessage) -> Result<()> {
        let body = serde_json::to_string(message)?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| {
                RestoreError::Sqs(format!(
                    "error sending restore message for package {} to {}: {}",
                    message.package.node_id,
                    self.queue_url,
                    sdk_error_message(e)
                ))
            })?;
        Ok(())
    }
}
