//! Restore requests: resolves trashed packages to RESTORING and queues them for the worker.

pub(crate) mod service;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::{AppConfig, OperationConfig};
use crate::models::restore::RestoreRequest;
use crate::request::service::RestoreService;
use crate::store::postgres::PostgresStoreFactory;
use crate::store::queue::SqsRestoreQueue;

const USAGE: &str = "request <org_id> <dataset_node_id> <user_id> <node_id>...";

#[derive(Debug, PartialEq)]
struct RequestArgs {
    org_id: i32,
    dataset_node_id: String,
    user_id: String,
    request: RestoreRequest,
}

fn parse_args(args: &[String]) -> Result<RequestArgs> {
    let [org_id, dataset_node_id, user_id, node_ids @ ..] = args else {
        anyhow::bail!("usage: {}", USAGE);
    };
    if node_ids.is_empty() {
        anyhow::bail!("no node ids given; usage: {}", USAGE);
    }
    let org_id = org_id
        .parse::<i32>()
        .with_context(|| format!("parsing org_id `{}`", org_id))?;
    Ok(RequestArgs {
        org_id,
        dataset_node_id: dataset_node_id.clone(),
        user_id: user_id.clone(),
        request: RestoreRequest {
            node_ids: node_ids.to_vec(),
        },
    })
}

/// Public entry point for a restore request. `args` are the command line
/// arguments following the operation name.
pub async fn run_request_flow(app_config: &AppConfig, args: &[String]) -> Result<()> {
    let request_config = match &app_config.operation {
        Some(OperationConfig::Request(cfg)) => cfg,
        _ => anyhow::bail!("Request operation selected but no request configuration found."),
    };
    let args = parse_args(args)?;

    let sdk_config = app_config.aws.load_sdk_config().await;
    let queue = SqsRestoreQueue::from_queue_name(
        aws_sdk_sqs::Client::new(&sdk_config),
        &request_config.restore_queue,
    )
    .await?;
    let packages = PostgresStoreFactory::connect(&app_config.postgres, 1, app_config.traversal)
        .await?;
    let service = RestoreService::new(Arc::new(packages), Arc::new(queue));

    let response = service
        .restore_packages(
            args.org_id,
            &args.dataset_node_id,
            &args.request,
            &args.user_id,
        )
        .await
        .with_context(|| {
            format!(
                "Failed to restore packages in dataset {}",
                args.dataset_node_id
            )
        })?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
