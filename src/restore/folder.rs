// package-restore/src/restore/folder.rs
use std::collections::HashMap;

use crate::errors::{EntityRef, RestoreError, Result, Subject};
use crate::models::changelog::{ChangelogEvent, ChangelogParent};
use crate::models::package::PackageState;
use crate::models::restore::{RestorePackageInfo, RestorePackageMessage};
use crate::restore::file::claim;
use crate::restore::names::restore_name;
use crate::restore::objects::undelete;
use crate::restore::storage;
use crate::restore::Stores;
use crate::store::PackageStore;

/// Restores a folder and every deleted package below it.
pub async fn restore_folder<S>(
    store: &mut S,
    stores: &Stores,
    message: &RestorePackageMessage,
) -> Result<Vec<ChangelogEvent>>
where
    S: PackageStore + ?Sized,
{
    let dataset_id = message.dataset_id;
    let node_id = &message.package.node_id;
    let folder_not_found = |org_id, actual_type| RestoreError::FolderNotFound {
        org_id,
        dataset: EntityRef::Id(dataset_id),
        node_id: node_id.clone(),
        actual_type,
    };
    let org_id = store.org_id();
    match store.get_package_by_node_id(dataset_id, node_id).await {
        Ok(package) if !package.package_type.is_collection() => {
            return Err(folder_not_found(org_id, Some(package.package_type)));
        }
        Ok(_) => {}
        Err(err) if err.is_not_found(Subject::Package) => {
            return Err(folder_not_found(org_id, None));
        }
        Err(err) => return Err(err),
    }
    let folder = claim(store, message).await?;

    let descendants = store
        .transition_descendant_package_state(
            dataset_id,
            folder.id,
            PackageState::Deleted,
            PackageState::Restoring,
        )
        .await?;
    tracing::info!(
        node_id = %folder.node_id,
        dataset_id,
        descendants = descendants.len(),
        "restoring folder"
    );

    let folder_info = RestorePackageInfo::from(&folder);
    let restored = restore_name(store, &folder_info).await?;
    let mut parents: HashMap<i64, ChangelogParent> = HashMap::new();
    parents.insert(
        folder.id,
        ChangelogParent {
            id: folder.id,
            node_id: folder.node_id.clone(),
            name: restored.name.clone(),
        },
    );
    let mut events = vec![ChangelogEvent {
        id: folder.id,
        node_id: folder.node_id.clone(),
        original_name: restored.displaced_original(),
        name: restored.name,
        parent: None,
    }];

    // descendants come parents first, so a parent's restored name is known
    // before its children are visited
    let mut subfolders = Vec::new();
    let mut leaves = Vec::new();
    for descendant in &descendants {
        let info = RestorePackageInfo::from(descendant);
        let restored = restore_name(store, &info).await?;
        events.push(ChangelogEvent {
            id: info.id,
            node_id: info.node_id.clone(),
            original_name: restored.displaced_original(),
            name: restored.name.clone(),
            parent: info.parent_id.and_then(|id| parents.get(&id).cloned()),
        });
        if info.package_type.is_collection() {
            parents.insert(
                info.id,
                ChangelogParent {
                    id: info.id,
                    node_id: info.node_id.clone(),
                    name: restored.name,
                },
            );
            subfolders.push(info);
        } else {
            leaves.push(info);
        }
    }

    let leaf_node_ids: Vec<String> = leaves.iter().map(|l| l.node_id.clone()).collect();
    let records = undelete(
        stores.delete_records.as_ref(),
        stores.objects.as_ref(),
        &leaf_node_ids,
    )
    .await?;
    let sizes = storage::leaf_sizes(store, &leaves, &records).await?;
    storage::propagate(store, dataset_id, &leaves, &sizes).await?;

    for info in subfolders.iter().chain(leaves.iter()) {
        store
            .transition_package_state(
                dataset_id,
                &info.node_id,
                PackageState::Restoring,
                PackageState::restored(info.package_type),
            )
            .await?;
    }
    store
        .transition_package_state(
            dataset_id,
            &folder.node_id,
            PackageState::Restoring,
            PackageState::Ready,
        )
        .await?;

    Ok(events)
}
