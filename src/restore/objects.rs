// package-restore/src/restore/objects.rs
//! Bringing back the stored content of restored leaves: the delete marker of
//! each object is removed, then its delete record.

use std::collections::HashMap;

use crate::errors::{RestoreError, Result};
use crate::models::restore::DeleteRecord;
use crate::store::{DeleteRecordStore, ObjectStore, ObjectVersion};

/// Undeletes the objects behind `node_ids` and returns the delete records that were found.
///
/// Records without a version id belong to published files whose content was
/// never hidden; they are removed without touching the object store. Records of
/// objects the store failed to undelete are kept so a redelivery can retry them.
pub async fn undelete(
    delete_records: &dyn DeleteRecordStore,
    objects: &dyn ObjectStore,
    node_ids: &[String],
) -> Result<HashMap<String, DeleteRecord>> {
    if node_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let records = delete_records.get_delete_marker_versions(node_ids).await?;

    let mut versions = Vec::new();
    let mut cleared = Vec::new();
    for node_id in node_ids {
        match records.get(node_id) {
            None => tracing::warn!(node_id = %node_id, "no delete record, nothing to undelete"),
            Some(record) if record.version_id.is_empty() => cleared.push(node_id.clone()),
            Some(record) => versions.push(ObjectVersion::from(record)),
        }
    }

    let response = objects.delete_objects_version(&versions).await?;
    for deleted in &response.deleted {
        if !deleted.delete_marker {
            // already gone on a previous delivery
            tracing::warn!(
                node_id = %deleted.node_id,
                bucket = %deleted.bucket,
                key = %deleted.key,
                "deleted version was not a delete marker"
            );
        }
        cleared.push(deleted.node_id.clone());
    }
    delete_records.remove_delete_records(&cleared).await?;

    if let Some(first) = response.errors.first() {
        for error in &response.errors {
            tracing::error!(
                node_id = ?error.node_id,
                bucket = %error.bucket,
                key = %error.key,
                code = %error.code,
                message = %error.message,
                "failed to remove delete marker"
            );
        }
        return Err(RestoreError::S3(format!(
            "{} of {} delete markers could not be removed, first: {}/{}: {} {}",
            response.errors.len(),
            versions.len(),
            first.bucket,
            first.key,
            first.code,
            first.message
        )));
    }

    tracing::info!(
        requested = node_ids.len(),
        found = records.len(),
        undeleted = response.deleted.len(),
        "undeleted objects"
    );
    Ok(records)
}
