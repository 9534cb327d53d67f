// package-restore/src/restore/storage.rs
//! Storage accounting for restored leaves.

use std::collections::HashMap;

use crate::errors::Result;
use crate::models::restore::{DeleteRecord, RestorePackageInfo};
use crate::store::PackageStore;

/// Size each leaf brings back: the size carried by the message, else the sum
/// of its source files, else the size on its delete record, else nothing.
pub async fn leaf_sizes<S>(
    store: &mut S,
    leaves: &[RestorePackageInfo],
    records: &HashMap<String, DeleteRecord>,
) -> Result<HashMap<i64, i64>>
where
    S: PackageStore + ?Sized,
{
    let unsized_ids: Vec<i64> = leaves
        .iter()
        .filter(|leaf| leaf.size.is_none())
        .map(|leaf| leaf.id)
        .collect();
    let file_sizes = if unsized_ids.is_empty() {
        HashMap::new()
    } else {
        store.get_package_sizes(&unsized_ids).await?
    };

    Ok(leaves
        .iter()
        .map(|leaf| {
            let size = leaf
                .size
                .or_else(|| file_sizes.get(&leaf.id).copied())
                .or_else(|| records.get(&leaf.node_id).and_then(|r| r.size))
                .unwrap_or(0);
            (leaf.id, size)
        })
        .collect())
}

/// Adds each leaf's size to the leaf, to every package above it, and the sum
/// to the dataset and workspace totals. Returns the sum.
pub async fn propagate<S>(
    store: &mut S,
    dataset_id: i64,
    leaves: &[RestorePackageInfo],
    sizes: &HashMap<i64, i64>,
) -> Result<i64>
where
    S: PackageStore + ?Sized,
{
    let mut total = 0;
    for leaf in leaves {
        let size = sizes.get(&leaf.id).copied().unwrap_or(0);
        if size == 0 {
            continue;
        }
        store.increment_package_storage(leaf.id, size).await?;
        if let Some(parent_id) = leaf.parent_id {
            store.increment_package_storage_ancestors(parent_id, size).await?;
        }
        total += size;
    }

    if total != 0 {
        store.increment_dataset_storage(dataset_id, total).await?;
        let org_id = store.org_id();
        store
            .increment_organization_storage(i64::from(org_id), total)
            .await?;
    }
    tracing::debug!(dataset_id, leaves = leaves.len(), total, "propagated restored storage");
    Ok(total)
}
