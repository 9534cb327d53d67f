// package-restore/src/restore/names.rs
//! Giving trashed packages their names back.

use uuid::Uuid;

use crate::errors::{RestoreError, Result};
use crate::models::package::PackageState;
use crate::models::restore::RestorePackageInfo;
use crate::store::savepoint::{savepoint_name, GuardedRetry};
use crate::store::PackageStore;

/// How many numbered alternatives are tried before falling back to a unique token.
pub const NUMBERED_NAME_LIMIT: u32 = 100;

/// The original name, every numbered alternative, and the fallback.
const MAX_NAME_ATTEMPTS: usize = NUMBERED_NAME_LIMIT as usize + 2;

/// Prefix the trash operation puts in front of a package name.
pub fn deleted_name_prefix(node_id: &str) -> String {
    format!("__{}__{}_", PackageState::Deleted, node_id)
}

pub fn get_original_name(deleted_name: &str, node_id: &str) -> Result<String> {
    let expected_prefix = deleted_name_prefix(node_id);
    match deleted_name.strip_prefix(&expected_prefix) {
        Some(name) => Ok(name.to_string()),
        None => Err(RestoreError::InvalidDeletedName {
            name: deleted_name.to_string(),
            expected_prefix,
        }),
    }
}

/// Names to try, in order: the original, `{base}-restored_{n}{ext}` for
/// n in 1..=100, then `{base}-restored_{uuid}{ext}`.
#[derive(Debug, Clone)]
pub struct NameCandidates {
    original: Option<String>,
    base: String,
    ext: String,
    next: u32,
    fallback_done: bool,
}

impl NameCandidates {
    pub fn new(name: &str) -> Self {
        let (base, ext) = match name.rfind('.') {
            Some(i) => (name[..i].to_string(), name[i..].to_string()),
            None => (name.to_string(), String::new()),
        };
        NameCandidates {
            original: Some(name.to_string()),
            base,
            ext,
            next: 1,
            fallback_done: false,
        }
    }
}

impl Iterator for NameCandidates {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if let Some(original) = self.original.take() {
            return Some(original);
        }
        if self.next <= NUMBERED_NAME_LIMIT {
            let candidate = format!("{}-restored_{}{}", self.base, self.next, self.ext);
            self.next += 1;
            return Some(candidate);
        }
        if !self.fallback_done {
            self.fallback_done = true;
            return Some(format!("{}-restored_{}{}", self.base, Uuid::new_v4(), self.ext));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoredName {
    /// The name the package has now.
    pub name: String,
    /// The name it had before it was trashed.
    pub original: String,
}

impl RestoredName {
    /// The pre-trash name, only when the package could not get it back.
    pub fn displaced_original(&self) -> Option<String> {
        (self.name != self.original).then(|| self.original.clone())
    }
}

/// Renames the package to its pre-trash name, or to the first free alternative.
pub async fn restore_name<S>(store: &mut S, info: &RestorePackageInfo) -> Result<RestoredName>
where
    S: PackageStore + ?Sized,
{
    let original = get_original_name(&info.name, &info.node_id)?;
    let package_id = info.id;
    let retry = GuardedRetry::new(
        savepoint_name(&info.node_id),
        MAX_NAME_ATTEMPTS,
        RestoreError::is_name_conflict,
    );
    let outcome = retry
        .run(store, NameCandidates::new(&original), |store, name| {
            Box::pin(async move { store.update_package_name(package_id, name).await })
        })
        .await?;
    if outcome.attempts > 1 {
        tracing::info!(
            node_id = %info.node_id,
            original = %original,
            restored = %outcome.candidate,
            attempts = outcome.attempts,
            "original name taken, restored under another name"
        );
    }
    Ok(RestoredName {
        name: outcome.candidate,
        original,
    })
}
