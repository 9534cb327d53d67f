// package-restore/src/store/memory.rs
//! In-memory stores for tests. Transactions work on a snapshot of the tables
//! that replaces the shared copy on commit.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RetryConfig;
use crate::errors::{EntityRef, RestoreError, Result};
use crate::models::changelog::ChangelogEvent;
use crate::models::package::{Dataset, Package, PackageState, PackageType};
use crate::models::restore::{DeleteRecord, RestorePackageMessage};
use crate::restore::names::deleted_name_prefix;
use crate::store::batch::{run_chunked, BatchAttempt, BatchOperation};
use crate::store::dynamodb::{MAX_GET_ITEM_BATCH, MAX_WRITE_ITEM_BATCH};
use crate::store::s3::{delete_versions_by_bucket, MAX_DELETE_OBJECTS_BATCH};
use crate::store::{
    ChangelogStore, DeleteObjectsVersionResponse, DeleteRecordStore, DeletedVersion,
    DescendantTraversal, ObjectStore, ObjectVersion, ObjectVersionError, PackageStore,
    PackageStoreFactory, PackageTx, RestoreQueue,
};

pub fn no_wait_retry() -> RetryConfig {
    RetryConfig {
        base_delay: Duration::ZERO,
        max_jitter: Duration::ZERO,
        max_attempts: 10,
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    datasets: BTreeMap<i64, Dataset>,
    packages: BTreeMap<i64, Package>,
    /// (package_id, size) rows of the files table.
    files: Vec<(i64, i64)>,
    package_storage: HashMap<i64, i64>,
    dataset_storage: HashMap<i64, i64>,
    organization_storage: HashMap<i64, i64>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn sibling_has_name(&self, package: &Package, name: &str) -> bool {
        self.packages.values().any(|p| {
            p.id != package.id
                && p.dataset_id == package.dataset_id
                && p.parent_id == package.parent_id
                && p.name == name
        })
    }

    fn children_of(&self, parent_id: i64) -> Vec<&Package> {
        self.packages
            .values()
            .filter(|p| p.parent_id == Some(parent_id))
            .collect()
    }
}

fn add(map: &mut HashMap<i64, i64>, key: i64, delta: i64) {
    *map.entry(key).or_insert(0) += delta;
}

/// Package tables of one workspace.
pub struct MemoryPackageStore {
    org_id: i32,
    traversal: DescendantTraversal,
    tables: Arc<Mutex<Tables>>,
}

impl MemoryPackageStore {
    pub fn new(org_id: i32) -> Self {
        MemoryPackageStore {
            org_id,
            traversal: DescendantTraversal::default(),
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    pub fn with_traversal(mut self, traversal: DescendantTraversal) -> Self {
        self.traversal = traversal;
        self
    }

    pub fn insert_dataset(&self, name: &str) -> Dataset {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.allocate_id();
        let dataset = Dataset {
            id,
            name: name.to_string(),
            node_id: Some(format!("N:dataset:{}", uuid::Uuid::new_v4())),
        };
        tables.datasets.insert(id, dataset.clone());
        dataset
    }

    fn insert(
        &self,
        dataset_id: i64,
        parent_id: Option<i64>,
        package_type: PackageType,
        state: PackageState,
        name: impl FnOnce(&str) -> String,
    ) -> Package {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.allocate_id();
        let prefix = if package_type.is_collection() {
            "N:collection"
        } else {
            "N:package"
        };
        let node_id = format!("{}:{}", prefix, uuid::Uuid::new_v4());
        let now = Utc::now().naive_utc();
        let package = Package {
            id,
            name: name(&node_id),
            package_type,
            state,
            node_id,
            parent_id,
            dataset_id,
            owner_id: 1,
            size: None,
            import_id: None,
            attributes: None,
            created_at: now,
            updated_at: now,
        };
        assert!(
            !tables.sibling_has_name(&package, &package.name),
            "duplicate test package name {}",
            package.name
        );
        tables.packages.insert(id, package.clone());
        package
    }

    fn add_files(&self, package_id: i64, file_sizes: &[i64]) {
        let mut tables = self.tables.lock().unwrap();
        for size in file_sizes {
            tables.files.push((package_id, *size));
        }
    }

    pub fn insert_collection(
        &self,
        dataset_id: i64,
        parent_id: Option<i64>,
        name: &str,
        state: PackageState,
    ) -> Package {
        self.insert(dataset_id, parent_id, PackageType::Collection, state, |_| {
            name.to_string()
        })
    }

    /// Inserts a file-like package with one source file per entry of `file_sizes`.
    pub fn insert_file(
        &self,
        dataset_id: i64,
        parent_id: Option<i64>,
        name: &str,
        state: PackageState,
        file_sizes: &[i64],
    ) -> Package {
        let package = self.insert(dataset_id, parent_id, PackageType::Text, state, |_| {
            name.to_string()
        });
        self.add_files(package.id, file_sizes);
        package
    }

    /// Inserts a file-like package as the trash operation leaves it.
    pub fn insert_trashed_file(
        &self,
        dataset_id: i64,
        parent_id: Option<i64>,
        original_name: &str,
        file_sizes: &[i64],
    ) -> Package {
        let package = self.insert(
            dataset_id,
            parent_id,
            PackageType::Text,
            PackageState::Deleted,
            |node_id| format!("{}{}", deleted_name_prefix(node_id), original_name),
        );
        self.add_files(package.id, file_sizes);
        package
    }

    pub fn insert_trashed_collection(
        &self,
        dataset_id: i64,
        parent_id: Option<i64>,
        original_name: &str,
    ) -> Package {
        self.insert(
            dataset_id,
            parent_id,
            PackageType::Collection,
            PackageState::Deleted,
            |node_id| format!("{}{}", deleted_name_prefix(node_id), original_name),
        )
    }

    /// Does what the trash operation does to a package and everything below
    /// it: prefixes names with the deleted marker and sets DELETED.
    pub fn trash(&self, id: i64) -> Package {
        let mut tables = self.tables.lock().unwrap();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            pending.extend(tables.children_of(current).iter().map(|p| p.id));
            if let Some(p) = tables.packages.get_mut(&current) {
                if p.state != PackageState::Deleted {
                    p.name = format!("{}{}", deleted_name_prefix(&p.node_id), p.name);
                    p.state = PackageState::Deleted;
                }
            }
        }
        tables.packages[&id].clone()
    }

    /// Overwrites a package's state without any checks.
    pub fn set_state(&self, id: i64, state: PackageState) -> Package {
        let mut tables = self.tables.lock().unwrap();
        let p = tables.packages.get_mut(&id).unwrap();
        p.state = state;
        p.clone()
    }

    pub fn package(&self, id: i64) -> Option<Package> {
        self.tables.lock().unwrap().packages.get(&id).cloned()
    }

    pub fn package_storage(&self, id: i64) -> i64 {
        self.tables
            .lock()
            .unwrap()
            .package_storage
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub fn dataset_storage(&self, id: i64) -> i64 {
        self.tables
            .lock()
            .unwrap()
            .dataset_storage
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub fn organization_storage(&self, id: i64) -> i64 {
        self.tables
            .lock()
            .unwrap()
            .organization_storage
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PackageStoreFactory for MemoryPackageStore {
    async fn begin(&self, org_id: i32) -> Result<Box<dyn PackageTx>> {
        assert_eq!(org_id, self.org_id, "memory store serves a single workspace");
        let working = self.tables.lock().unwrap().clone();
        Ok(Box::new(MemoryTx {
            org_id,
            traversal: self.traversal,
            shared: Arc::clone(&self.tables),
            working,
            savepoints: Vec::new(),
        }))
    }
}

pub struct MemoryTx {
    org_id: i32,
    traversal: DescendantTraversal,
    shared: Arc<Mutex<Tables>>,
    working: Tables,
    savepoints: Vec<(String, Tables)>,
}

impl MemoryTx {
    fn savepoint_position(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                RestoreError::Sqlx(sqlx::Error::Protocol(format!(
                    "savepoint \"{}\" does not exist",
                    name
                )))
            })
    }

    fn package_not_found(&self, dataset_id: Option<i64>, package: EntityRef) -> RestoreError {
        RestoreError::PackageNotFound {
            org_id: self.org_id,
            dataset: dataset_id.map(EntityRef::Id),
            package,
        }
    }
}

#[async_trait]
impl PackageStore for MemoryTx {
    fn org_id(&self) -> i32 {
        self.org_id
    }

    async fn get_dataset_by_node_id(&mut self, dataset_node_id: &str) -> Result<Dataset> {
        self.working
            .datasets
            .values()
            .find(|d| d.node_id.as_deref() == Some(dataset_node_id))
            .cloned()
            .ok_or_else(|| RestoreError::DatasetNotFound {
                org_id: self.org_id,
                dataset: EntityRef::NodeId(dataset_node_id.to_string()),
            })
    }

    async fn get_package_by_node_id(&mut self, dataset_id: i64, node_id: &str) -> Result<Package> {
        self.working
            .packages
            .values()
            .find(|p| p.dataset_id == dataset_id && p.node_id == node_id)
            .cloned()
            .ok_or_else(|| {
                self.package_not_found(Some(dataset_id), EntityRef::NodeId(node_id.to_string()))
            })
    }

    async fn transition_package_state(
        &mut self,
        dataset_id: i64,
        node_id: &str,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Package> {
        let found = self
            .working
            .packages
            .values_mut()
            .find(|p| p.dataset_id == dataset_id && p.node_id == node_id && p.state == expected);
        match found {
            Some(p) => {
                p.state = target;
                p.updated_at = Utc::now().naive_utc();
                Ok(p.clone())
            }
            None => Err(self.package_not_found(Some(dataset_id), EntityRef::NodeId(node_id.to_string()))),
        }
    }

    async fn transition_descendant_package_state(
        &mut self,
        dataset_id: i64,
        package_id: i64,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Vec<Package>> {
        let mut matched = Vec::new();
        let mut frontier = vec![package_id];
        let mut first_level = true;
        while !frontier.is_empty() {
            let mut level: Vec<&Package> = frontier
                .iter()
                .flat_map(|id| self.working.children_of(*id))
                .filter(|p| !first_level || p.dataset_id == dataset_id)
                .collect();
            level.sort_by_key(|p| p.id);
            frontier = Vec::new();
            for p in level {
                let matches = p.state == expected;
                if matches {
                    matched.push(p.id);
                }
                if matches || self.traversal == DescendantTraversal::EntireSubtree {
                    frontier.push(p.id);
                }
            }
            first_level = false;
        }

        let now = Utc::now().naive_utc();
        let mut updated = Vec::with_capacity(matched.len());
        for id in matched {
            if let Some(p) = self.working.packages.get_mut(&id) {
                p.state = target;
                p.updated_at = now;
                updated.push(p.clone());
            }
        }
        Ok(updated)
    }

    async fn transition_ancestor_package_state(
        &mut self,
        parent_id: i64,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Vec<Package>> {
        let mut updated = Vec::new();
        let mut current = Some(parent_id);
        while let Some(id) = current {
            let Some(p) = self.working.packages.get_mut(&id) else {
                break;
            };
            if !p.package_type.is_collection() || p.state != expected {
                break;
            }
            p.state = target;
            updated.push(p.clone());
            current = p.parent_id;
        }
        Ok(updated)
    }

    async fn update_package_name(&mut self, package_id: i64, new_name: &str) -> Result<()> {
        let Some(package) = self.working.packages.get(&package_id).cloned() else {
            return Err(self.package_not_found(None, EntityRef::Id(package_id)));
        };
        if self.working.sibling_has_name(&package, new_name) {
            let constraint = if package.parent_id.is_some() {
                "packages_name_dataset_id_parent_id__parent_id_not_null_idx"
            } else {
                "packages_name_dataset_id__parent_id_null_idx"
            };
            return Err(RestoreError::NameUniqueness {
                org_id: self.org_id,
                package_id,
                name: new_name.to_string(),
                cause: format!("duplicate key value violates unique constraint \"{}\"", constraint)
                    .into(),
            });
        }
        if let Some(p) = self.working.packages.get_mut(&package_id) {
            p.name = new_name.to_string();
        }
        Ok(())
    }

    async fn get_package_sizes(&mut self, package_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        let wanted: HashSet<i64> = package_ids.iter().copied().collect();
        let mut sizes = HashMap::new();
        for (package_id, size) in &self.working.files {
            if wanted.contains(package_id) {
                add(&mut sizes, *package_id, *size);
            }
        }
        Ok(sizes)
    }

    async fn increment_package_storage(&mut self, package_id: i64, delta: i64) -> Result<()> {
        add(&mut self.working.package_storage, package_id, delta);
        Ok(())
    }

    async fn increment_package_storage_ancestors(&mut self, start_id: i64, delta: i64) -> Result<()> {
        let mut current = Some(start_id);
        while let Some(id) = current {
            let Some(p) = self.working.packages.get(&id) else {
                break;
            };
            current = p.parent_id;
            add(&mut self.working.package_storage, id, delta);
        }
        Ok(())
    }

    async fn increment_dataset_storage(&mut self, dataset_id: i64, delta: i64) -> Result<()> {
        add(&mut self.working.dataset_storage, dataset_id, delta);
        Ok(())
    }

    async fn increment_organization_storage(&mut self, org_id: i64, delta: i64) -> Result<()> {
        add(&mut self.working.organization_storage, org_id, delta);
        Ok(())
    }

    async fn new_savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.savepoint_position(name)?;
        self.savepoints.truncate(position + 1);
        self.working = self.savepoints[position].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.savepoint_position(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }
}

#[async_trait]
impl PackageTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        *self.shared.lock().unwrap() = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Delete record table. `leave_unprocessed` makes the next requests report
/// their last item as unprocessed, the way a throttled table does.
pub struct MemoryDeleteRecordStore {
    records: Mutex<HashMap<String, DeleteRecord>>,
    flaky_requests: Mutex<usize>,
    get_requests: Mutex<Vec<usize>>,
    remove_requests: Mutex<Vec<usize>>,
    retry: RetryConfig,
}

impl Default for MemoryDeleteRecordStore {
    fn default() -> Self {
        MemoryDeleteRecordStore {
            records: Mutex::new(HashMap::new()),
            flaky_requests: Mutex::new(0),
            get_requests: Mutex::new(Vec::new()),
            remove_requests: Mutex::new(Vec::new()),
            retry: no_wait_retry(),
        }
    }
}

impl MemoryDeleteRecordStore {
    pub fn put(&self, record: DeleteRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.node_id.clone(), record);
    }

    pub fn record(&self, node_id: &str) -> Option<DeleteRecord> {
        self.records.lock().unwrap().get(node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn leave_unprocessed(&self, requests: usize) {
        *self.flaky_requests.lock().unwrap() = requests;
    }

    pub fn get_request_sizes(&self) -> Vec<usize> {
        self.get_requests.lock().unwrap().clone()
    }

    pub fn remove_request_sizes(&self) -> Vec<usize> {
        self.remove_requests.lock().unwrap().clone()
    }

    fn split_unprocessed(&self, mut items: Vec<String>) -> (Vec<String>, Vec<String>) {
        let mut flaky = self.flaky_requests.lock().unwrap();
        if *flaky > 0 && !items.is_empty() {
            *flaky -= 1;
            let unprocessed = items.split_off(items.len() - 1);
            return (items, unprocessed);
        }
        (items, Vec::new())
    }
}

struct MemoryBatchGet<'a>(&'a MemoryDeleteRecordStore);

#[async_trait]
impl BatchOperation for MemoryBatchGet<'_> {
    type Item = String;
    type Output = Vec<DeleteRecord>;

    fn name(&self) -> &str {
        "memory batch get"
    }

    fn limit(&self) -> usize {
        MAX_GET_ITEM_BATCH
    }

    async fn submit(&self, node_ids: Vec<String>) -> Result<BatchAttempt<String, Vec<DeleteRecord>>> {
        self.0.get_requests.lock().unwrap().push(node_ids.len());
        let (processed, unprocessed) = self.0.split_unprocessed(node_ids);
        let records = self.0.records.lock().unwrap();
        let output = processed
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect();
        Ok(BatchAttempt { output, unprocessed })
    }
}

struct MemoryBatchRemove<'a>(&'a MemoryDeleteRecordStore);

#[async_trait]
impl BatchOperation for MemoryBatchRemove<'_> {
    type Item = String;
    type Output = ();

    fn name(&self) -> &str {
        "memory batch remove"
    }

    fn limit(&self) -> usize {
        MAX_WRITE_ITEM_BATCH
    }

    async fn submit(&self, node_ids: Vec<String>) -> Result<BatchAttempt<String, ()>> {
        self.0.remove_requests.lock().unwrap().push(node_ids.len());
        let (processed, unprocessed) = self.0.split_unprocessed(node_ids);
        let mut records = self.0.records.lock().unwrap();
        for id in processed {
            records.remove(&id);
        }
        Ok(BatchAttempt {
            output: (),
            unprocessed,
        })
    }
}

#[async_trait]
impl DeleteRecordStore for MemoryDeleteRecordStore {
    async fn get_delete_marker_versions(
        &self,
        node_ids: &[String],
    ) -> Result<HashMap<String, DeleteRecord>> {
        let batches = run_chunked(&MemoryBatchGet(self), node_ids.to_vec(), &self.retry).await?;
        Ok(batches
            .into_iter()
            .flatten()
            .map(|r| (r.node_id.clone(), r))
            .collect())
    }

    async fn remove_delete_records(&self, node_ids: &[String]) -> Result<()> {
        run_chunked(&MemoryBatchRemove(self), node_ids.to_vec(), &self.retry).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub version_id: String,
    pub delete_marker: bool,
}

/// Versioned buckets. Keys listed with `fail_key` get a per-object error;
/// `fail_requests` makes every request fail outright.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<StoredVersion>>>,
    failing_keys: Mutex<HashSet<String>>,
    fail_requests: AtomicBool,
    requests: Mutex<Vec<(String, usize)>>,
}

impl MemoryObjectStore {
    pub fn put_version(&self, bucket: &str, key: &str, version_id: &str, delete_marker: bool) {
        self.objects
            .lock()
            .unwrap()
            .entry((bucket.to_string(), key.to_string()))
            .or_default()
            .push(StoredVersion {
                version_id: version_id.to_string(),
                delete_marker,
            });
    }

    pub fn versions(&self, bucket: &str, key: &str) -> Vec<StoredVersion> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_delete_marker(&self, bucket: &str, key: &str) -> bool {
        self.versions(bucket, key).iter().any(|v| v.delete_marker)
    }

    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_requests(&self) {
        self.fail_requests.store(true, Ordering::SeqCst);
    }

    /// (bucket, object count) of every request made.
    pub fn requests(&self) -> Vec<(String, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

struct MemoryDeleteInBucket<'a> {
    store: &'a MemoryObjectStore,
    bucket: String,
}

#[async_trait]
impl BatchOperation for MemoryDeleteInBucket<'_> {
    type Item = ObjectVersion;
    type Output = DeleteObjectsVersionResponse;

    fn name(&self) -> &str {
        "memory delete versions"
    }

    fn limit(&self) -> usize {
        MAX_DELETE_OBJECTS_BATCH
    }

    async fn submit(
        &self,
        versions: Vec<ObjectVersion>,
    ) -> Result<BatchAttempt<ObjectVersion, DeleteObjectsVersionResponse>> {
        if self.store.fail_requests.load(Ordering::SeqCst) {
            return Err(RestoreError::S3(format!(
                "connection reset deleting from {}",
                self.bucket
            )));
        }
        self.store
            .requests
            .lock()
            .unwrap()
            .push((self.bucket.clone(), versions.len()));

        let failing = self.store.failing_keys.lock().unwrap().clone();
        let mut objects = self.store.objects.lock().unwrap();
        let mut response = DeleteObjectsVersionResponse::default();
        for v in versions {
            if failing.contains(&v.key) {
                response.errors.push(ObjectVersionError {
                    node_id: Some(v.node_id),
                    bucket: v.bucket,
                    key: v.key,
                    version_id: Some(v.version_id),
                    code: "AccessDenied".to_string(),
                    message: "Access Denied".to_string(),
                });
                continue;
            }
            let mut delete_marker = false;
            if let Some(stored) = objects.get_mut(&(v.bucket.clone(), v.key.clone())) {
                if let Some(pos) = stored.iter().position(|s| s.version_id == v.version_id) {
                    delete_marker = stored.remove(pos).delete_marker;
                }
            }
            response.deleted.push(DeletedVersion {
                node_id: v.node_id,
                bucket: v.bucket,
                key: v.key,
                delete_marker,
            });
        }
        Ok(BatchAttempt::done(response))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn delete_objects_version(
        &self,
        objects: &[ObjectVersion],
    ) -> Result<DeleteObjectsVersionResponse> {
        delete_versions_by_bucket(objects, &no_wait_retry(), |bucket| MemoryDeleteInBucket {
            store: self,
            bucket: bucket.to_string(),
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentChangelog {
    pub org_id: i64,
    pub dataset_id: i64,
    pub user_id: String,
    pub events: Vec<ChangelogEvent>,
}

#[derive(Default)]
pub struct MemoryChangelogStore {
    sent: Mutex<Vec<SentChangelog>>,
    fail: AtomicBool,
}

impl MemoryChangelogStore {
    pub fn sent(&self) -> Vec<SentChangelog> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangelogStore for MemoryChangelogStore {
    async fn log_restores(
        &self,
        org_id: i64,
        dataset_id: i64,
        user_id: &str,
        events: Vec<ChangelogEvent>,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RestoreError::Sqs("jobs queue unavailable".to_string()));
        }
        self.sent.lock().unwrap().push(SentChangelog {
            org_id,
            dataset_id,
            user_id: user_id.to_string(),
            events,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRestoreQueue {
    messages: Mutex<Vec<RestorePackageMessage>>,
    fail: AtomicBool,
}

impl MemoryRestoreQueue {
    pub fn messages(&self) -> Vec<RestorePackageMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RestoreQueue for MemoryRestoreQueue {
    async fn send_restore_package(&self, message: &RestorePackageMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RestoreError::Sqs("restore queue unavailable".to_string()));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<DeleteRecord> {
        (0..n)
            .map(|i| DeleteRecord {
                node_id: format!("N:package:{}", i),
                bucket: "bucket".to_string(),
                key: format!("key-{}", i),
                version_id: format!("marker-{}", i),
                size: Some(1),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_delete_records_batch_at_provider_limits() -> anyhow::Result<()> {
        let store = MemoryDeleteRecordStore::default();
        for r in records(230) {
            store.put(r);
        }
        let mut node_ids: Vec<String> = (0..230).map(|i| format!("N:package:{}", i)).collect();
        node_ids.push("N:package:missing".to_string());

        let found = store.get_delete_marker_versions(&node_ids).await?;
        assert_eq!(found.len(), 230);
        assert!(!found.contains_key("N:package:missing"));
        assert_eq!(store.get_request_sizes(), vec![100, 100, 31]);

        store.remove_delete_records(&node_ids[..60]).await?;
        assert_eq!(store.remove_request_sizes(), vec![25, 25, 10]);
        assert_eq!(store.len(), 170);
        Ok(())
    }

    #[tokio::test]
    async fn test_unprocessed_keys_are_drained() -> anyhow::Result<()> {
        let store = MemoryDeleteRecordStore::default();
        for r in records(120) {
            store.put(r);
        }
        let node_ids: Vec<String> = (0..120).map(|i| format!("N:package:{}", i)).collect();

        store.leave_unprocessed(3);
        let found = store.get_delete_marker_versions(&node_ids).await?;
        assert_eq!(found.len(), 120);
        // first chunk: 100 -> 1 -> 1 -> done, second chunk: 20
        assert_eq!(store.get_request_sizes(), vec![100, 1, 1, 1, 20]);

        store.leave_unprocessed(2);
        store.remove_delete_records(&node_ids).await?;
        assert_eq!(store.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_descendants_stop_at_non_matching_folder() -> anyhow::Result<()> {
        let db = MemoryPackageStore::new(1);
        let root = db.insert_collection(1, None, "root", PackageState::Restoring);
        let live = db.insert_collection(1, Some(root.id), "live", PackageState::Ready);
        let hidden = db.insert_file(1, Some(live.id), "hidden.txt", PackageState::Deleted, &[]);
        let deleted = db.insert_collection(1, Some(root.id), "deleted", PackageState::Deleted);
        let nested = db.insert_file(1, Some(deleted.id), "nested.txt", PackageState::Deleted, &[]);
        let other_root = db.insert_collection(1, None, "other", PackageState::Deleted);

        let mut tx = db.begin(1).await?;
        let moved = tx
            .transition_descendant_package_state(1, root.id, PackageState::Deleted, PackageState::Restoring)
            .await?;
        let ids: Vec<i64> = moved.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![deleted.id, nested.id]);
        tx.commit().await?;

        assert_eq!(db.package(hidden.id).map(|p| p.state), Some(PackageState::Deleted));
        assert_eq!(db.package(live.id).map(|p| p.state), Some(PackageState::Ready));
        assert_eq!(db.package(other_root.id).map(|p| p.state), Some(PackageState::Deleted));
        Ok(())
    }

    #[tokio::test]
    async fn test_descendants_entire_subtree() -> anyhow::Result<()> {
        let db = MemoryPackageStore::new(1).with_traversal(DescendantTraversal::EntireSubtree);
        let root = db.insert_collection(1, None, "root", PackageState::Restoring);
        let live = db.insert_collection(1, Some(root.id), "live", PackageState::Ready);
        let hidden = db.insert_file(1, Some(live.id), "hidden.txt", PackageState::Deleted, &[]);
        let deleted = db.insert_file(1, Some(root.id), "deleted.txt", PackageState::Deleted, &[]);

        let mut tx = db.begin(1).await?;
        let moved = tx
            .transition_descendant_package_state(1, root.id, PackageState::Deleted, PackageState::Restoring)
            .await?;
        let ids: Vec<i64> = moved.iter().map(|p| p.id).collect();
        // parents first: depth one, then depth two
        assert_eq!(ids, vec![deleted.id, hidden.id]);
        assert!(moved.iter().all(|p| p.state == PackageState::Restoring));
        Ok(())
    }

    #[tokio::test]
    async fn test_transition_requires_expected_state() -> anyhow::Result<()> {
        let db = MemoryPackageStore::new(1);
        let file = db.insert_file(1, None, "a.txt", PackageState::Ready, &[]);

        let mut tx = db.begin(1).await?;
        let result = tx
            .transition_package_state(1, &file.node_id, PackageState::Deleted, PackageState::Restoring)
            .await;
        assert!(matches!(result, Err(RestoreError::PackageNotFound { .. })));
        tx.commit().await?;
        assert_eq!(db.package(file.id), Some(file));
        Ok(())
    }

    #[tokio::test]
    async fn test_ancestor_storage_walks_to_root() -> anyhow::Result<()> {
        let db = MemoryPackageStore::new(1);
        let top = db.insert_collection(1, None, "top", PackageState::Ready);
        let mid = db.insert_collection(1, Some(top.id), "mid", PackageState::Ready);
        let leaf = db.insert_file(1, Some(mid.id), "leaf.txt", PackageState::Ready, &[5, 6]);

        let mut tx = db.begin(1).await?;
        tx.increment_package_storage_ancestors(mid.id, 11).await?;
        assert_eq!(tx.get_package_sizes(&[leaf.id, top.id]).await?, HashMap::from([(leaf.id, 11)]));
        tx.commit().await?;

        assert_eq!(db.package_storage(mid.id), 11);
        assert_eq!(db.package_storage(top.id), 11);
        assert_eq!(db.package_storage(leaf.id), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_ancestor_state_stops_at_first_mismatch() -> anyhow::Result<()> {
        let db = MemoryPackageStore::new(1);
        let top = db.insert_collection(1, None, "top", PackageState::Ready);
        let mid = db.insert_collection(1, Some(top.id), "mid", PackageState::Deleted);
        let low = db.insert_collection(1, Some(mid.id), "low", PackageState::Deleted);

        let mut tx = db.begin(1).await?;
        let moved = tx
            .transition_ancestor_package_state(low.id, PackageState::Deleted, PackageState::Ready)
            .await?;
        let ids: Vec<i64> = moved.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![low.id, mid.id]);
        Ok(())
    }
}
