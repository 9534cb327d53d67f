// package-restore/src/restore/file.rs
use crate::errors::Result;
use crate::models::changelog::ChangelogEvent;
use crate::models::package::{Package, PackageState};
use crate::models::restore::{RestorePackageInfo, RestorePackageMessage};
use crate::restore::names::restore_name;
use crate::restore::objects::undelete;
use crate::restore::storage;
use crate::restore::Stores;
use crate::store::PackageStore;

/// Claims a package the request service moved to RESTORING. The conditional
/// update locks the row, so a concurrent or repeated delivery of the same
/// message fails here with `PackageNotFound` before anything is changed.
pub(crate) async fn claim<S>(store: &mut S, message: &RestorePackageMessage) -> Result<Package>
where
    S: PackageStore + ?Sized,
{
    store
        .transition_package_state(
            message.dataset_id,
            &message.package.node_id,
            PackageState::Restoring,
            PackageState::Restoring,
        )
        .await
}

/// Restores a single file-like package.
pub async fn restore_file<S>(
    store: &mut S,
    stores: &Stores,
    message: &RestorePackageMessage,
) -> Result<Vec<ChangelogEvent>>
where
    S: PackageStore + ?Sized,
{
    let package = claim(store, message).await?;
    let mut info = RestorePackageInfo::from(&package);
    info.size = message.package.size;

    let restored = restore_name(store, &info).await?;

    let node_ids = [info.node_id.clone()];
    let records = undelete(stores.delete_records.as_ref(), stores.objects.as_ref(), &node_ids).await?;

    let leaves = [info];
    let sizes = storage::leaf_sizes(store, &leaves, &records).await?;
    storage::propagate(store, message.dataset_id, &leaves, &sizes).await?;

    let [info] = leaves;
    store
        .transition_package_state(
            message.dataset_id,
            &info.node_id,
            PackageState::Restoring,
            PackageState::restored(info.package_type),
        )
        .await?;

    Ok(vec![ChangelogEvent {
        id: info.id,
        node_id: info.node_id,
        original_name: restored.displaced_original(),
        name: restored.name,
        parent: None,
    }])
}
