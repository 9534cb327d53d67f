// package-restore/src/restore/worker.rs
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, WorkerConfig};
use crate::restore::handler::RestoreHandler;
use crate::restore::Stores;
use crate::store::changelog::SqsChangelogStore;
use crate::store::dynamodb::DynamoDbDeleteRecordStore;
use crate::store::postgres::PostgresStoreFactory;
use crate::store::queue::SqsRestoreQueue;
use crate::store::s3::S3ObjectStore;
use crate::store::ChangelogStore;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) async fn run(app_config: &AppConfig, worker_config: &WorkerConfig) -> Result<()> {
    let sdk_config = app_config.aws.load_sdk_config().await;
    let sqs_client = aws_sdk_sqs::Client::new(&sdk_config);

    // one connection per in-flight message
    let max_connections = u32::try_from(worker_config.concurrency)
        .context("worker concurrency does not fit a connection pool size")?;
    let packages =
        PostgresStoreFactory::connect(&app_config.postgres, max_connections, app_config.traversal)
            .await?;
    let queue = SqsRestoreQueue::from_queue_name(sqs_client.clone(), &worker_config.restore_queue)
        .await?;
    let changelog = worker_config.changelog_queue_url.as_ref().map(|queue_url| {
        Arc::new(SqsChangelogStore::new(sqs_client.clone(), queue_url.clone()))
            as Arc<dyn ChangelogStore>
    });

    let handler = Arc::new(RestoreHandler::new(Stores {
        packages: Arc::new(packages),
        delete_records: Arc::new(DynamoDbDeleteRecordStore::new(
            aws_sdk_dynamodb::Client::new(&sdk_config),
            worker_config.delete_record_table.clone(),
            app_config.retry.clone(),
        )),
        objects: Arc::new(S3ObjectStore::new(
            aws_sdk_s3::Client::new(&sdk_config),
            app_config.retry.clone(),
        )),
        changelog,
    }));

    tracing::info!(
        queue_url = %queue.queue_url(),
        table = %worker_config.delete_record_table,
        concurrency = worker_config.concurrency,
        traversal = ?app_config.traversal,
        "restore worker started"
    );

    loop {
        let received = tokio::select! {
            received = queue.receive(
                worker_config.max_messages,
                worker_config.wait_time_seconds,
                worker_config.visibility_timeout_seconds,
            ) => received,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested, stopping restore worker");
                break;
            }
        };
        let messages = match received {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(error = %err, "failed to receive restore messages");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };
        if messages.is_empty() {
            if worker_config.exit_when_idle {
                tracing::info!("restore queue is empty, exiting");
                break;
            }
            continue;
        }
        process_batch(&handler, &queue, worker_config, messages).await;
    }
    Ok(())
}

/// Handles one received batch and deletes the messages that succeeded. Failed
/// ones become visible again once their visibility timeout expires.
async fn process_batch(
    handler: &Arc<RestoreHandler>,
    queue: &SqsRestoreQueue,
    worker_config: &WorkerConfig,
    messages: Vec<crate::store::queue::QueueMessage>,
) {
    let received = messages.len();
    let receipts: Vec<(String, String)> = messages
        .iter()
        .map(|m| (m.message_id.clone(), m.receipt_handle.clone()))
        .collect();

    let response = handler
        .handle_batch(messages, worker_config.concurrency)
        .await;
    let failed = response.failed_ids();
    for (message_id, receipt_handle) in &receipts {
        if failed.contains(message_id.as_str()) {
            continue;
        }
        if let Err(err) = queue.delete(receipt_handle).await {
            // the restore is committed; a redelivery fails harmlessly with PackageNotFound
            tracing::warn!(message_id = %message_id, error = %err, "failed to delete processed message");
        }
    }
    tracing::info!(received, failed = failed.len(), "processed restore batch");
}
