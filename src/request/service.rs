// package-restore/src/request/service.rs
use std::sync::Arc;

use crate::errors::{Result, Subject};
use crate::models::package::PackageState;
use crate::models::restore::{Failure, RestorePackageMessage, RestoreRequest, RestoreResponse};
use crate::store::{exec_store_tx, PackageStore, PackageStoreFactory, RestoreQueue};

/// Accepts restore requests: marks the requested packages RESTORING and queues
/// one message per package for the worker.
pub struct RestoreService {
    packages: Arc<dyn PackageStoreFactory>,
    queue: Arc<dyn RestoreQueue>,
}

impl RestoreService {
    pub fn new(packages: Arc<dyn PackageStoreFactory>, queue: Arc<dyn RestoreQueue>) -> Self {
        RestoreService { packages, queue }
    }

    /// A node that is not a deleted package of the dataset is reported as a
    /// failure without affecting the others. An unknown dataset, any other
    /// store error, or a failed enqueue rolls the whole request back.
    pub async fn restore_packages(
        &self,
        org_id: i32,
        dataset_node_id: &str,
        request: &RestoreRequest,
        user_id: &str,
    ) -> Result<RestoreResponse> {
        let queue = self.queue.as_ref();
        exec_store_tx(self.packages.as_ref(), org_id, |mut tx| {
            Box::pin(async move {
                let outcome =
                    mark_restoring(&mut *tx, queue, dataset_node_id, request, user_id).await;
                (tx, outcome)
            })
        })
        .await
    }
}

async fn mark_restoring<S>(
    store: &mut S,
    queue: &dyn RestoreQueue,
    dataset_node_id: &str,
    request: &RestoreRequest,
    user_id: &str,
) -> Result<RestoreResponse>
where
    S: PackageStore + ?Sized,
{
    let dataset = store.get_dataset_by_node_id(dataset_node_id).await?;
    let org_id = store.org_id();

    let mut response = RestoreResponse::default();
    let mut messages = Vec::new();
    for node_id in &request.node_ids {
        match store
            .transition_package_state(
                dataset.id,
                node_id,
                PackageState::Deleted,
                PackageState::Restoring,
            )
            .await
        {
            Ok(package) => {
                messages.push(RestorePackageMessage::new(org_id, dataset.id, user_id, &package));
                response.success.push(node_id.clone());
            }
            Err(err) if err.is_not_found(Subject::Package) => {
                response.failures.push(Failure {
                    id: node_id.clone(),
                    error: format!(
                        "deleted package {} not found in dataset {}",
                        node_id, dataset_node_id
                    ),
                });
            }
            Err(err) => return Err(err),
        }
    }

    for message in &messages {
        queue.send_restore_package(message).await?;
    }
    tracing::info!(
        org_id,
        dataset_id = dataset.id,
        requested = request.node_ids.len(),
        queued = messages.len(),
        "queued package restores"
    );
    Ok(response)
}
