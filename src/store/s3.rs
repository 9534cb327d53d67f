// package-restore/src/store/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::types::{Delete, ObjectIdentifier};
use std::collections::{BTreeMap, HashMap};

use crate::config::RetryConfig;
use crate::errors::{RestoreError, Result, ResultExt};
use crate::store::batch::{run_chunked, BatchAttempt, BatchOperation};
use crate::store::{
    sdk_error_message, DeleteObjectsVersionResponse, DeletedVersion, ObjectStore, ObjectVersion,
    ObjectVersionError,
};

/// Provider limit for DeleteObjects.
pub const MAX_DELETE_OBJECTS_BATCH: usize = 1000;

pub struct S3ObjectStore {
    client: s3::Client,
    retry: RetryConfig,
}

impl S3ObjectStore {
    pub fn new(client: s3::Client, retry: RetryConfig) -> Self {
        S3ObjectStore { client, retry }
    }
}

pub(crate) fn group_by_bucket(objects: &[ObjectVersion]) -> BTreeMap<String, Vec<ObjectVersion>> {
    let mut by_bucket: BTreeMap<String, Vec<ObjectVersion>> = BTreeMap::new();
    for object in objects {
        by_bucket
            .entry(object.bucket.clone())
            .or_default()
            .push(object.clone());
    }
    by_bucket
}

/// Deletes `objects` one bucket at a time, in requests built by `op_for_bucket`.
/// Per-object errors are collected; a failed request aborts the remaining ones.
pub(crate) async fn delete_versions_by_bucket<Op, F>(
    objects: &[ObjectVersion],
    retry: &RetryConfig,
    op_for_bucket: F,
) -> Result<DeleteObjectsVersionResponse>
where
    Op: BatchOperation<Item = ObjectVersion, Output = DeleteObjectsVersionResponse>,
    F: Fn(&str) -> Op,
{
    let mut response = DeleteObjectsVersionResponse::default();
    for (bucket, versions) in group_by_bucket(objects) {
        let op = op_for_bucket(&bucket);
        let count = versions.len();
        let batches = run_chunked(&op, versions, retry)
            .await
            .with_restore_context(|| format!("error deleting object versions in bucket {}", bucket))?;
        for batch in batches {
            response.deleted.extend(batch.deleted);
            response.errors.extend(batch.errors);
        }
        tracing::debug!(bucket = %bucket, count, "deleted object versions");
    }
    Ok(response)
}

struct DeleteVersionsInBucket<'a> {
    client: &'a s3::Client,
    bucket: String,
}

#[async_trait]
impl BatchOperation for DeleteVersionsInBucket<'_> {
    type Item = ObjectVersion;
    type Output = DeleteObjectsVersionResponse;

    fn name(&self) -> &str {
        "s3 delete object versions"
    }

    fn limit(&self) -> usize {
        MAX_DELETE_OBJECTS_BATCH
    }

    async fn submit(
        &self,
        versions: Vec<ObjectVersion>,
    ) -> Result<BatchAttempt<ObjectVersion, DeleteObjectsVersionResponse>> {
        let identifiers = versions
            .iter()
            .map(|v| {
                ObjectIdentifier::builder()
                    .key(&v.key)
                    .version_id(&v.version_id)
                    .build()
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RestoreError::S3(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .build()
            .map_err(|e| RestoreError::S3(e.to_string()))?;
        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| RestoreError::S3(sdk_error_message(e)))?;

        let node_ids: HashMap<&str, &str> = versions
            .iter()
            .map(|v| (v.key.as_str(), v.node_id.as_str()))
            .collect();
        let mut response = DeleteObjectsVersionResponse::default();
        for deleted in output.deleted() {
            let key = deleted.key().unwrap_or_default();
            match node_ids.get(key) {
                Some(node_id) => response.deleted.push(DeletedVersion {
                    node_id: node_id.to_string(),
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    delete_marker: deleted.delete_marker().unwrap_or(false),
                }),
                None => tracing::warn!(bucket = %self.bucket, key, "deleted unrequested key"),
            }
        }
        for error in output.errors() {
            let key = error.key().unwrap_or_default();
            response.errors.push(ObjectVersionError {
                node_id: node_ids.get(key).map(|id| id.to_string()),
                bucket: self.bucket.clone(),
                key: key.to_string(),
                version_id: error.version_id().map(str::to_string),
                code: error.code().unwrap_or_default().to_string(),
                message: error.message().unwrap_or_default().to_string(),
            });
        }
        Ok(BatchAttempt::done(response))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn delete_objects_version(
        &self,
        objects: &[ObjectVersion],
    ) -> Result<DeleteObjectsVersionResponse> {
        if objects.is_empty() {
            return Ok(DeleteObjectsVersionResponse::default());
        }
        delete_versions_by_bucket(objects, &self.retry, |bucket| DeleteVersionsInBucket {
            client: &self.client,
            bucket: bucket.to_string(),
        })
        .await
    }
}
