//! Restore worker: consumes restore messages and brings trashed packages back.
//!
//! - `handler`: per-message transaction and the partial batch response
//! - `file` / `folder`: the two restore flows
//! - `names`, `objects`, `storage`: the steps the flows are made of
//! - `worker`: the queue polling loop

mod file;
mod folder;
pub(crate) mod handler;
pub(crate) mod names;
mod objects;
mod storage;
mod worker;

use anyhow::Result;
use std::sync::Arc;

use crate::config::{AppConfig, OperationConfig};
use crate::store::{ChangelogStore, DeleteRecordStore, ObjectStore, PackageStoreFactory};

/// Everything a restore touches besides the message itself.
pub struct Stores {
    pub packages: Arc<dyn PackageStoreFactory>,
    pub delete_records: Arc<dyn DeleteRecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    /// Restores are not reported when absent.
    pub changelog: Option<Arc<dyn ChangelogStore>>,
}

/// Public entry point for the restore worker.
pub async fn run_worker_flow(app_config: &AppConfig) -> Result<()> {
    let worker_config = match &app_config.operation {
        Some(OperationConfig::Worker(cfg)) => cfg,
        _ => anyhow::bail!("Worker operation selected but no worker configuration found."),
    };
    worker::run(app_config, worker_config).await
}
