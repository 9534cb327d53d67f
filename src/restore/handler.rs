// package-restore/src/restore/handler.rs
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::errors::Result;
use crate::models::changelog::ChangelogEvent;
use crate::models::restore::RestorePackageMessage;
use crate::restore::file::restore_file;
use crate::restore::folder::restore_folder;
use crate::restore::Stores;
use crate::store::exec_store_tx;
use crate::store::queue::QueueMessage;

/// Messages of a batch that have to be delivered again.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

impl BatchResponse {
    pub fn failed_ids(&self) -> HashSet<&str> {
        self.batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect()
    }
}

pub struct RestoreHandler {
    stores: Stores,
}

impl RestoreHandler {
    pub fn new(stores: Stores) -> Self {
        RestoreHandler { stores }
    }

    /// Processes each message in its own task, at most `concurrency` at a time.
    pub async fn handle_batch(
        self: &Arc<Self>,
        messages: Vec<QueueMessage>,
        concurrency: usize,
    ) -> BatchResponse {
        let order: Vec<String> = messages.iter().map(|m| m.message_id.clone()).collect();
        let mut pending: HashSet<String> = order.iter().cloned().collect();

        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for message in messages {
            let handler = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = handler.handle_message(&message).await;
                (message.message_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((message_id, Ok(()))) => {
                    pending.remove(&message_id);
                }
                Ok((message_id, Err(err))) => {
                    tracing::error!(
                        message_id = %message_id,
                        error = %err,
                        kind = ?err.kind(),
                        "restore failed, message will be redelivered"
                    );
                }
                // the message id is still pending and gets reported below
                Err(join_err) => tracing::error!(error = %join_err, "restore task aborted"),
            }
        }

        BatchResponse {
            batch_item_failures: order
                .into_iter()
                .filter(|id| pending.contains(id))
                .map(|item_identifier| BatchItemFailure { item_identifier })
                .collect(),
        }
    }

    pub async fn handle_message(&self, message: &QueueMessage) -> Result<()> {
        let span = tracing::info_span!("restore_message", message_id = %message.message_id);
        async {
            let restore: RestorePackageMessage = serde_json::from_str(&message.body)?;
            let events = self.restore_package(&restore).await?;
            tracing::info!(
                org_id = restore.org_id,
                dataset_id = restore.dataset_id,
                node_id = %restore.package.node_id,
                restored = events.len(),
                "restored package"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Restores one top-level package in a single transaction, then reports
    /// the restored packages to the changelog.
    pub async fn restore_package(&self, message: &RestorePackageMessage) -> Result<Vec<ChangelogEvent>> {
        let stores = &self.stores;
        let events = exec_store_tx(stores.packages.as_ref(), message.org_id, |mut tx| {
            Box::pin(async move {
                let outcome = if message.package.package_type.is_collection() {
                    restore_folder(&mut *tx, stores, message).await
                } else {
                    restore_file(&mut *tx, stores, message).await
                };
                (tx, outcome)
            })
        })
        .await?;
        self.emit_changelog(message, &events).await;
        Ok(events)
    }

    async fn emit_changelog(&self, message: &RestorePackageMessage, events: &[ChangelogEvent]) {
        let Some(changelog) = &self.stores.changelog else {
            return;
        };
        if events.is_empty() {
            return;
        }
        let result = changelog
            .log_restores(
                i64::from(message.org_id),
                message.dataset_id,
                &message.user_id,
                events.to_vec(),
            )
            .await;
        if let Err(err) = result {
            tracing::warn!(
                org_id = message.org_id,
                dataset_id = message.dataset_id,
                error = %err,
                "failed to send restore changelog events"
            );
        }
    }
}
