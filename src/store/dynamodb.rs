// package-restore/src/store/dynamodb.rs
use async_trait::async_trait;
use aws_sdk_dynamodb as dynamodb;
use dynamodb::types::{AttributeValue, DeleteRequest, KeysAndAttributes, WriteRequest};
use std::collections::HashMap;

use crate::config::RetryConfig;
use crate::errors::{RestoreError, Result, ResultExt};
use crate::models::restore::DeleteRecord;
use crate::store::batch::{run_chunked, BatchAttempt, BatchOperation};
use crate::store::{sdk_error_message, DeleteRecordStore};

/// Provider limit for BatchGetItem.
pub const MAX_GET_ITEM_BATCH: usize = 100;
/// Provider limit for BatchWriteItem.
pub const MAX_WRITE_ITEM_BATCH: usize = 25;

const NODE_ID: &str = "NodeId";
const DELETE_MARKER_PROJECTION: &str = "NodeId, S3Bucket, S3Key, S3ObjectVersion, ObjectSize";

pub struct DynamoDbDeleteRecordStore {
    client: dynamodb::Client,
    table: String,
    retry: RetryConfig,
}

impl DynamoDbDeleteRecordStore {
    pub fn new(client: dynamodb::Client, table: String, retry: RetryConfig) -> Self {
        DynamoDbDeleteRecordStore {
            client,
            table,
            retry,
        }
    }
}

fn node_id_key(node_id: &str) -> HashMap<String, AttributeValue> {
    HashMap::from([(NODE_ID.to_string(), AttributeValue::S(node_id.to_string()))])
}

fn node_id_of(key: &HashMap<String, AttributeValue>) -> Option<String> {
    key.get(NODE_ID).and_then(|v| v.as_s().ok()).cloned()
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<String> {
    match item.get(name) {
        Some(AttributeValue::S(value)) => Ok(value.clone()),
        Some(other) => Err(RestoreError::DynamoDb(format!(
            "attribute {} has unexpected type: {:?}",
            name, other
        ))),
        None => Err(RestoreError::DynamoDb(format!("attribute {} missing", name))),
    }
}

/// ObjectSize is written as a string; numbers are accepted too. Empty means unknown.
fn size_attr(item: &HashMap<String, AttributeValue>) -> Result<Option<i64>> {
    let raw = match item.get("ObjectSize") {
        Some(AttributeValue::S(value)) | Some(AttributeValue::N(value)) => value.trim(),
        Some(AttributeValue::Null(_)) | None => return Ok(None),
        Some(other) => {
            return Err(RestoreError::DynamoDb(format!(
                "attribute ObjectSize has unexpected type: {:?}",
                other
            )));
        }
    };
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<i64>()
        .map(Some)
        .map_err(|e| RestoreError::DynamoDb(format!("invalid ObjectSize {:?}: {}", raw, e)))
}

pub(crate) fn parse_delete_record(item: &HashMap<String, AttributeValue>) -> Result<DeleteRecord> {
    Ok(DeleteRecord {
        node_id: string_attr(item, NODE_ID)?,
        bucket: string_attr(item, "S3Bucket")?,
        key: string_attr(item, "S3Key")?,
        version_id: string_attr(item, "S3ObjectVersion")?,
        size: size_attr(item)?,
    })
}

struct BatchGetDeleteRecords<'a> {
    client: &'a dynamodb::Client,
    table: &'a str,
}

#[async_trait]
impl BatchOperation for BatchGetDeleteRecords<'_> {
    type Item = String;
    type Output = Vec<DeleteRecord>;

    fn name(&self) -> &str {
        "dynamodb batch get delete records"
    }

    fn limit(&self) -> usize {
        MAX_GET_ITEM_BATCH
    }

    async fn submit(&self, node_ids: Vec<String>) -> Result<BatchAttempt<String, Vec<DeleteRecord>>> {
        let keys = node_ids.iter().map(|id| node_id_key(id)).collect();
        let request = KeysAndAttributes::builder()
            .set_keys(Some(keys))
            .projection_expression(DELETE_MARKER_PROJECTION)
            .build()
            .map_err(|e| RestoreError::DynamoDb(e.to_string()))?;
        let output = self
            .client
            .batch_get_item()
            .request_items(self.table, request)
            .send()
            .await
            .map_err(|e| RestoreError::DynamoDb(sdk_error_message(e)))?;

        let items = output
            .responses()
            .and_then(|responses| responses.get(self.table))
            .ok_or_else(|| {
                RestoreError::DynamoDb(format!("no responses for table {}", self.table))
            })?;
        let records = items
            .iter()
            .map(parse_delete_record)
            .collect::<Result<Vec<_>>>()?;
        let unprocessed = output
            .unprocessed_keys()
            .and_then(|unprocessed| unprocessed.get(self.table))
            .map(|k| k.keys().iter().filter_map(node_id_of).collect())
            .unwrap_or_default();
        Ok(BatchAttempt {
            output: records,
            unprocessed,
        })
    }
}

struct BatchRemoveDeleteRecords<'a> {
    client: &'a dynamodb::Client,
    table: &'a str,
}

#[async_trait]
impl BatchOperation for BatchRemoveDeleteRecords<'_> {
    type Item = String;
    type Output = ();

    fn name(&self) -> &str {
        "dynamodb batch remove delete records"
    }

    fn limit(&self) -> usize {
        MAX_WRITE_ITEM_BATCH
    }

    async fn submit(&self, node_ids: Vec<String>) -> Result<BatchAttempt<String, ()>> {
        let mut requests = Vec::with_capacity(node_ids.len());
        for node_id in &node_ids {
            let delete = DeleteRequest::builder()
                .set_key(Some(node_id_key(node_id)))
                .build()
                .map_err(|e| RestoreError::DynamoDb(e.to_string()))?;
            requests.push(WriteRequest::builder().delete_request(delete).build());
        }
        let output = self
            .client
            .batch_write_item()
            .request_items(self.table, requests)
            .send()
            .await
            .map_err(|e| RestoreError::DynamoDb(sdk_error_message(e)))?;

        let unprocessed = output
            .unprocessed_items()
            .and_then(|unprocessed| unprocessed.get(self.table))
            .map(|writes| {
                writes
                    .iter()
                    .filter_map(|w| w.delete_request())
                    .filter_map(|d| node_id_of(d.key()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(BatchAttempt {
            output: (),
            unprocessed,
        })
    }
}

#[async_trait]
impl DeleteRecordStore for DynamoDbDeleteRecordStore {
    async fn get_delete_marker_versions(
        &self,
        node_ids: &[String],
    ) -> Result<HashMap<String, DeleteRecord>> {
        if node_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let op = BatchGetDeleteRecords {
            client: &self.client,
            table: &self.table,
        };
        let batches = run_chunked(&op, node_ids.to_vec(), &self.retry)
            .await
            .with_restore_context(|| format!("error reading delete records from {}", self.table))?;
        let records: HashMap<String, DeleteRecord> = batches
            .into_iter()
            .flatten()
            .map(|record| (record.node_id.clone(), record))
            .collect();
        tracing::debug!(
            table = %self.table,
            requested = node_ids.len(),
            found = records.len(),
            "read delete records"
        );
        Ok(records)
    }

    async fn remove_delete_records(&self, node_ids: &[String]) -> Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let op = BatchRemoveDeleteRecords {
            client: &self.client,
            table: &self.table,
        };
        run_chunked(&op, node_ids.to_vec(), &self.retry)
            .await
            .with_restore_context(|| format!("error removing delete records from {}", self.table))?;
        tracing::debug!(table = %self.table, count = node_ids.len(), "removed delete records");
        Ok(())
    }
}
