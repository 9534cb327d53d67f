//! Restore request/response payloads and the queued unit of work.

use serde::{Deserialize, Serialize};

use super::package::{Package, PackageType};

/// Body of a restore request: the node ids to bring back from the trashcan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub node_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub success: Vec<String>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub id: String,
    pub error: String,
}

/// What the worker needs to know about one package in order to restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePackageInfo {
    pub id: i64,
    pub node_id: String,
    pub name: String,
    pub parent_id: Option<i64>,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

impl From<&Package> for RestorePackageInfo {
    fn from(p: &Package) -> Self {
        RestorePackageInfo {
            id: p.id,
            node_id: p.node_id.clone(),
            name: p.name.clone(),
            parent_id: p.parent_id,
            package_type: p.package_type,
            size: None,
        }
    }
}

/// One top-level package to restore, as carried on the restore queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePackageMessage {
    pub org_id: i32,
    pub dataset_id: i64,
    #[serde(default)]
    pub user_id: String,
    pub package: RestorePackageInfo,
}

impl RestorePackageMessage {
    pub fn new(org_id: i32, dataset_id: i64, user_id: &str, package: &Package) -> Self {
        RestorePackageMessage {
            org_id,
            dataset_id,
            user_id: user_id.to_string(),
            package: RestorePackageInfo::from(package),
        }
    }
}

/// Bookkeeping row written by the trash operation for every deleted file-like package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecord {
    pub node_id: String,
    pub bucket: String,
    pub key: String,
    /// Version id of the delete marker hiding the content.
    pub version_id: String,
    pub size: Option<i64>,
}
