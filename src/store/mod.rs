//! Storage seams used by the restore worker and the request service.
//!
//! - `postgres`: package tree, storage accounting, savepoints (one transaction per message)
//! - `dynamodb`: delete records written by the trash operation
//! - `s3`: versioned objects whose delete markers are removed on restore
//! - `changelog` / `queue`: SQS producers
//!
//! Every store is reached through a trait so the orchestration can run against
//! the in-memory implementations in `memory` during tests.

pub(crate) mod batch;
pub(crate) mod changelog;
pub(crate) mod dynamodb;
#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod postgres;
pub(crate) mod queue;
pub(crate) mod s3;
pub(crate) mod savepoint;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::Result;
use crate::models::changelog::ChangelogEvent;
use crate::models::package::{Dataset, Package, PackageState};
use crate::models::restore::{DeleteRecord, RestorePackageMessage};

/// How far `transition_descendant_package_state` walks below the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescendantTraversal {
    /// Only descend through packages that are themselves in the source state.
    #[default]
    StopAtNonMatching,
    /// Descend through every package; only matching ones are transitioned.
    EntireSubtree,
}

impl FromStr for DescendantTraversal {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop_at_non_matching" | "bounded" => Ok(DescendantTraversal::StopAtNonMatching),
            "entire_subtree" | "unbounded" => Ok(DescendantTraversal::EntireSubtree),
            other => Err(format!("unknown descendant traversal mode {:?}", other)),
        }
    }
}

/// Statements against one workspace schema. Implementations backed by a
/// transaction see each other's writes until commit or rollback.
#[async_trait]
pub trait PackageStore: Send {
    fn org_id(&self) -> i32;

    async fn get_dataset_by_node_id(&mut self, dataset_node_id: &str) -> Result<Dataset>;

    async fn get_package_by_node_id(&mut self, dataset_id: i64, node_id: &str) -> Result<Package>;

    /// Moves the package from `expected` to `target`. Fails with `PackageNotFound`
    /// when no row in `expected` state matches.
    async fn transition_package_state(
        &mut self,
        dataset_id: i64,
        node_id: &str,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Package>;

    /// Moves descendants of `package_id` (not the package itself) that are in
    /// `expected` state to `target`, in one statement. Rows come back parents first.
    async fn transition_descendant_package_state(
        &mut self,
        dataset_id: i64,
        package_id: i64,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Vec<Package>>;

    /// Moves the collection `parent_id` and its collection ancestors in `expected` state to `target`.
    async fn transition_ancestor_package_state(
        &mut self,
        parent_id: i64,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Vec<Package>>;

    /// Fails with `NameUniqueness` when a sibling already has `new_name`.
    async fn update_package_name(&mut self, package_id: i64, new_name: &str) -> Result<()>;

    /// Total size of the source files of each package. Packages without files are absent.
    async fn get_package_sizes(&mut self, package_ids: &[i64]) -> Result<HashMap<i64, i64>>;

    async fn increment_package_storage(&mut self, package_id: i64, delta: i64) -> Result<()>;

    /// Adds `delta` to `start_id` and every package above it.
    async fn increment_package_storage_ancestors(&mut self, start_id: i64, delta: i64) -> Result<()>;

    async fn increment_dataset_storage(&mut self, dataset_id: i64, delta: i64) -> Result<()>;

    async fn increment_organization_storage(&mut self, org_id: i64, delta: i64) -> Result<()>;

    async fn new_savepoint(&mut self, name: &str) -> Result<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn release_savepoint(&mut self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait PackageTx: PackageStore {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait PackageStoreFactory: Send + Sync {
    async fn begin(&self, org_id: i32) -> Result<Box<dyn PackageTx>>;
}

/// Runs `f` against a fresh transaction. The transaction is committed when `f`
/// succeeds and rolled back otherwise; `f` hands the transaction back together
/// with its outcome.
pub async fn exec_store_tx<'f, T, F>(
    factory: &dyn PackageStoreFactory,
    org_id: i32,
    f: F,
) -> Result<T>
where
    F: FnOnce(Box<dyn PackageTx>) -> BoxFuture<'f, (Box<dyn PackageTx>, Result<T>)>,
{
    let tx = factory.begin(org_id).await?;
    let (tx, outcome) = f(tx).await;
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rb_err) = tx.rollback().await {
                return Err(err.context(format!("rollback failed as well: {}", rb_err)));
            }
            Err(err)
        }
    }
}

/// Delete records keyed by node id.
#[async_trait]
pub trait DeleteRecordStore: Send + Sync {
    /// Missing records are simply absent from the result.
    async fn get_delete_marker_versions(
        &self,
        node_ids: &[String],
    ) -> Result<HashMap<String, DeleteRecord>>;

    async fn remove_delete_records(&self, node_ids: &[String]) -> Result<()>;
}

/// One object version to delete. For restores this is the delete marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
    pub node_id: String,
    pub bucket: String,
    pub key: String,
    pub version_id: String,
}

impl From<&DeleteRecord> for ObjectVersion {
    fn from(r: &DeleteRecord) -> Self {
        ObjectVersion {
            node_id: r.node_id.clone(),
            bucket: r.bucket.clone(),
            key: r.key.clone(),
            version_id: r.version_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedVersion {
    pub node_id: String,
    pub bucket: String,
    pub key: String,
    pub delete_marker: bool,
}

/// Error the provider reported for a single object of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersionError {
    pub node_id: Option<String>,
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteObjectsVersionResponse {
    pub deleted: Vec<DeletedVersion>,
    pub errors: Vec<ObjectVersionError>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Per-object failures land in `errors`; a failed request aborts the call.
    async fn delete_objects_version(
        &self,
        objects: &[ObjectVersion],
    ) -> Result<DeleteObjectsVersionResponse>;
}

#[async_trait]
pub trait ChangelogStore: Send + Sync {
    async fn log_restores(
        &self,
        org_id: i64,
        dataset_id: i64,
        user_id: &str,
        events: Vec<ChangelogEvent>,
    ) -> Result<()>;
}

#[async_trait]
pub trait RestoreQueue: Send + Sync {
    async fn send_restore_package(&self, message: &RestorePackageMessage) -> Result<()>;
}

/// Renders an AWS SDK error with its full source chain.
pub(crate) fn sdk_error_message<E: std::error::Error>(err: E) -> String {
    aws_sdk_s3::error::DisplayErrorContext(err).to_string()
}
